//! 基本型の Property-Based Testing

use proptest::prelude::*;
use isobmff::{
    BoxHeader, BoxSize, BoxType, Decode, Encode, ErrorKind, FixedPointNumber, FullBoxFlags,
    FullBoxHeader,
};

/// FullBoxFlags の値を生成する Strategy (24 ビット)
fn arb_full_box_flags() -> impl Strategy<Value = u32> {
    0u32..=0x00FF_FFFF
}

/// BoxType を生成する Strategy
///
/// `uuid` は拡張型の方で表すので、通常の 4 バイト値からは除外する
fn arb_box_type() -> impl Strategy<Value = BoxType> {
    prop_oneof![
        any::<[u8; 4]>()
            .prop_filter("uuid is an extended type", |t| t != b"uuid")
            .prop_map(BoxType::Normal),
        any::<[u8; 16]>().prop_map(BoxType::Uuid),
    ]
}

/// ペイロードサイズを生成する Strategy (32 ビットの境界付近を含む)
fn arb_payload_size() -> impl Strategy<Value = u64> {
    prop_oneof![
        0u64..=0xFFFF,
        (u32::MAX as u64 - 32)..=(u32::MAX as u64 + 32),
        (u32::MAX as u64)..=(u64::MAX / 2),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    // FullBoxFlags の Roundtrip
    #[test]
    fn full_box_flags_roundtrip(value in arb_full_box_flags()) {
        let flags = FullBoxFlags::new(value);
        let encoded = flags.encode_to_vec().unwrap();
        prop_assert_eq!(encoded.len(), 3);

        let (decoded, size) = FullBoxFlags::decode(&encoded).unwrap();
        prop_assert_eq!(size, 3);
        prop_assert_eq!(decoded.get(), flags.get());
    }

    // FullBoxFlags のビット操作
    #[test]
    fn full_box_flags_bit_operations(value in arb_full_box_flags()) {
        let flags = FullBoxFlags::new(value);
        for i in 0..24 {
            let expected = (value & (1 << i)) != 0;
            prop_assert_eq!(flags.is_set(i), expected, "bit {} mismatch", i);
        }
    }

    // FullBoxHeader の Roundtrip
    #[test]
    fn full_box_header_roundtrip(version in any::<u8>(), flags in arb_full_box_flags()) {
        let header = FullBoxHeader { version, flags: FullBoxFlags::new(flags) };
        let encoded = header.encode_to_vec().unwrap();
        prop_assert_eq!(encoded.len(), 4);
        prop_assert_eq!(FullBoxHeader::decode(&encoded).unwrap().0, header);
    }

    // BoxHeader の Roundtrip と、ヘッダー形式の選択
    #[test]
    fn box_header_roundtrip(box_type in arb_box_type(), payload_size in arb_payload_size()) {
        let header = BoxHeader {
            box_type,
            box_size: BoxSize::with_payload_size(box_type, payload_size),
        };
        let encoded = header.encode_to_vec().unwrap();
        prop_assert_eq!(encoded.len(), header.external_size());

        let total = header.box_size.get();
        prop_assert_eq!(total, payload_size + header.external_size() as u64);
        prop_assert_eq!(matches!(header.box_size, BoxSize::U64(_)), total > u32::MAX as u64);

        let (decoded, size) = BoxHeader::decode(&encoded).unwrap();
        prop_assert_eq!(decoded, header);
        prop_assert_eq!(size, encoded.len());
    }

    // 宣言サイズがバッファを超える場合は TruncatedBox になる
    #[test]
    fn declared_size_beyond_buffer_is_truncated(
        box_type in arb_box_type(),
        payload in prop::collection::vec(any::<u8>(), 0..64),
        missing in 1u64..1000,
    ) {
        let header = BoxHeader {
            box_type,
            box_size: BoxSize::with_payload_size(box_type, payload.len() as u64 + missing),
        };
        let mut bytes = header.encode_to_vec().unwrap();
        bytes.extend_from_slice(&payload);

        let err = BoxHeader::decode_header_and_payload(&bytes).unwrap_err();
        prop_assert_eq!(err.kind, ErrorKind::TruncatedBox);
    }

    // 任意のバイト列のデコードでパニックしない
    #[test]
    fn box_header_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..48)) {
        if let Ok((header, size)) = BoxHeader::decode(&bytes) {
            prop_assert!(size <= bytes.len());
            prop_assert_eq!(size, header.external_size());
        }
        let _ = BoxHeader::decode_header_and_payload(&bytes);
        let _ = FullBoxHeader::decode(&bytes);
    }

    // FixedPointNumber の Roundtrip
    #[test]
    fn fixed_point_number_roundtrip(integer in any::<i16>(), fraction in any::<u16>()) {
        let value = FixedPointNumber::new(integer, fraction);
        let encoded = value.encode_to_vec().unwrap();
        prop_assert_eq!(encoded.len(), 4);
        prop_assert_eq!(FixedPointNumber::<i16, u16>::decode(&encoded).unwrap().0, value);
    }
}
