#![no_main]

use isobmff::{Decode, Encode, boxes::TrunBox};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((trun, _)) = TrunBox::decode(data) {
        let _ = trun.encode_to_vec();
    }
});
