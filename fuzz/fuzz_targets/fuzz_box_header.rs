#![no_main]

use isobmff::{BoxHeader, Decode, Encode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((header, _)) = BoxHeader::decode(data) {
        let _ = header.encode_to_vec();
    }
    let _ = BoxHeader::decode_header_and_payload(data);
});
