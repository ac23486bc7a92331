#![no_main]

use std::num::NonZeroU32;

use isobmff::{Decode, Encode, aux::SampleTableAccessor, boxes::StblBox};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok((stbl, _)) = StblBox::decode(data) else {
        return;
    };
    let _ = stbl.encode_to_vec();

    // テーブル間の整合性が取れている場合は、全サンプルを辿ってもパニックしない
    let Ok(accessor) = SampleTableAccessor::new(&stbl) else {
        return;
    };
    for n in (1..=accessor.sample_count().min(10_000)).filter_map(NonZeroU32::new) {
        if let Some(sample) = accessor.get_sample(n) {
            let _ = accessor.sample_at_time(sample.decode_time());
        }
    }
});
