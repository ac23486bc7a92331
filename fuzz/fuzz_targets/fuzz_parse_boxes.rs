#![no_main]

use isobmff::{Encode, boxes::parse_boxes};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(boxes) = parse_boxes(data) {
        for b in &boxes {
            let _ = b.encode_to_vec();
        }
    }
});
