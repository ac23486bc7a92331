#![no_main]

use isobmff::{Decode, Encode, boxes::MoofBox};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((moof, _)) = MoofBox::decode(data) {
        let _ = moof.encode_to_vec();
    }
});
