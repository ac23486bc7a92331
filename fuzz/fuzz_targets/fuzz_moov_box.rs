#![no_main]

use isobmff::{Decode, Encode, boxes::MoovBox};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((moov, _)) = MoovBox::decode(data) {
        let _ = moov.encode_to_vec();
        for trak in &moov.trak_boxes {
            if let Ok(stbl) = trak.stbl() {
                let _ = stbl.check_consistency();
            }
        }
    }
});
