use std::num::NonZeroU32;

use isobmff::{
    BoxType, Decode, Encode, ErrorKind, Result,
    boxes::{
        AnyBox, ChunkOffsetBox, ChunkOffsetRepr, DinfBox, FieldWidth, HdlrBox, MdhdBox, MdiaBox,
        MinfBox, MoofBox, MoovBox, MvexBox, MvhdBox, SampleEntry, SampleSizeRepr, StblBox,
        TkhdBox, TrakBox, TrexBox, TrunBox, TrunSample, choose_offset_box, choose_width,
        parse_box, parse_boxes,
    },
    fragment::merge_fragment,
};

fn bx(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut bytes = ((8 + payload.len()) as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(box_type);
    bytes.extend_from_slice(payload);
    bytes
}

fn full(box_type: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![version];
    bytes.extend_from_slice(&flags.to_be_bytes()[1..]);
    bytes.extend_from_slice(payload);
    bx(box_type, &bytes)
}

fn u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

const MATRIX: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

/// 1 トラック 1 サンプル（サイズ 100、尺 600、オフセット 48）の moov
fn minimal_moov() -> Vec<u8> {
    let mvhd = full(
        b"mvhd",
        0,
        0,
        &[
            u32s(&[0, 0, 600, 600, 0x00010000]),
            vec![1, 0],
            vec![0; 10],
            u32s(&MATRIX),
            vec![0; 24],
            u32s(&[2]),
        ]
        .concat(),
    );
    let tkhd = full(
        b"tkhd",
        0,
        3,
        &[
            u32s(&[0, 0, 1, 0, 600]),
            vec![0; 8],
            vec![0; 4],
            vec![0; 4],
            u32s(&MATRIX),
            u32s(&[0, 0]),
        ]
        .concat(),
    );
    let mdhd = full(b"mdhd", 0, 0, &[u32s(&[0, 0, 600, 600]), vec![0x55, 0xC4, 0, 0]].concat());
    let hdlr = full(b"hdlr", 0, 0, &[u32s(&[0]), b"vide".to_vec(), vec![0; 12], vec![0]].concat());
    let sample_entry = bx(b"avc1", &[vec![0; 6], vec![0, 1], vec![0xAB; 4]].concat());
    let stbl = bx(
        b"stbl",
        &[
            full(b"stsd", 0, 0, &[u32s(&[1]), sample_entry].concat()),
            full(b"stts", 0, 0, &u32s(&[1, 1, 600])),
            full(b"stsc", 0, 0, &u32s(&[1, 1, 1, 1])),
            full(b"stsz", 0, 0, &u32s(&[100, 1])),
            full(b"stco", 0, 0, &u32s(&[1, 48])),
        ]
        .concat(),
    );
    let mdia = bx(b"mdia", &[mdhd, hdlr, bx(b"minf", &stbl)].concat());
    bx(b"moov", &[mvhd, bx(b"trak", &[tkhd, mdia].concat())].concat())
}

fn decode_moov(bytes: &[u8]) -> Result<MoovBox> {
    let (moov, size) = MoovBox::decode(bytes)?;
    assert_eq!(size, bytes.len());
    Ok(moov)
}

fn video_track(track_id: u32) -> TrakBox {
    TrakBox {
        tkhd_box: Some(TkhdBox::new(track_id)),
        mdia_box: Some(MdiaBox {
            mdhd_box: Some(MdhdBox::new(NonZeroU32::new(90000).expect("non zero"))),
            hdlr_box: Some(HdlrBox {
                handler_type: HdlrBox::HANDLER_TYPE_VIDE,
                name: b"\0".to_vec(),
            }),
            minf_box: Some(MinfBox {
                media_header_box: None,
                dinf_box: Some(DinfBox::local_file()),
                stbl_box: Some(StblBox::new(SampleEntry {
                    box_type: BoxType::Normal(*b"avc1"),
                    data_reference_index: 1,
                    body: vec![1, 2, 3],
                })),
                other_boxes: Vec::new(),
            }),
            udta_box: None,
            other_boxes: Vec::new(),
        }),
        ..Default::default()
    }
}

#[test]
fn minimal_one_sample_file() -> Result<()> {
    let bytes = minimal_moov();
    let mut moov = decode_moov(&bytes)?;

    let stbl = moov.track_mut(1).expect("track 1").stbl_mut()?;
    assert_eq!(stbl.sample_count(), 1);
    assert_eq!(stbl.sample_size(1), Some(100));
    assert_eq!(stbl.decode_time(1), Some(0));
    assert_eq!(stbl.sample_duration(1), Some(600));
    assert_eq!(stbl.sample_offset(1), Some(48));
    assert_eq!(stbl.is_sync_sample(1), Some(true));
    assert_eq!(stbl.composition_offset(1), Some(0));
    assert_eq!(stbl.sample_size(2), None);
    stbl.check_consistency()?;

    // 正規化の対象となるボックスを含まないので、バイト列がそのまま再現される
    assert_eq!(moov.encode_to_vec()?, bytes);
    Ok(())
}

#[test]
fn size_only_fragment_run_uses_trex_duration() -> Result<()> {
    let mut moov = MoovBox {
        mvhd_box: Some(MvhdBox::default()),
        trak_boxes: vec![video_track(1), video_track(2)],
        mvex_box: Some(MvexBox {
            mehd_box: None,
            trex_boxes: vec![
                TrexBox::new(1),
                TrexBox {
                    default_sample_duration: 3000,
                    ..TrexBox::new(2)
                },
            ],
            other_boxes: Vec::new(),
        }),
        ..Default::default()
    };

    let trun = full(b"trun", 0, 0x201, &u32s(&[3, 16, 10, 20, 30]));
    let traf = bx(b"traf", &[full(b"tfhd", 0, 0, &u32s(&[2])), trun].concat());
    let moof_bytes = bx(b"moof", &[full(b"mfhd", 0, 0, &u32s(&[1])), traf].concat());
    let (moof, _) = MoofBox::decode(&moof_bytes)?;
    merge_fragment(&mut moov, &moof, 1000)?;

    let stbl = moov.track_mut(2).expect("track 2").stbl_mut()?;
    assert_eq!(stbl.sample_count(), 3);
    for n in 1..=3 {
        assert_eq!(stbl.sample_duration(n), Some(3000));
        assert_eq!(stbl.sample_size(n), Some(10 * n));
    }
    assert_eq!(stbl.sample_offset(1), Some(1016));
    assert_eq!(stbl.sample_offset(3), Some(1046));
    stbl.check_consistency()?;

    let stbl = moov.track(1).expect("track 1").stbl()?;
    assert_eq!(stbl.sample_count(), 0);
    Ok(())
}

#[test]
fn first_sample_flags_with_per_sample_flags_is_rejected() -> Result<()> {
    let trun = full(
        b"trun",
        0,
        0x405,
        &u32s(&[1, 0, 0x0200_0000, 0x0101_0000]),
    );
    let err = TrunBox::decode(&trun).expect_err("conflicting flags");
    assert_eq!(err.kind, ErrorKind::InvalidInput);

    // traf ごと拒否される
    let traf = bx(b"traf", &[full(b"tfhd", 0, 0, &u32s(&[1])), trun].concat());
    let moof = bx(b"moof", &[full(b"mfhd", 0, 0, &u32s(&[1])), traf].concat());
    let err = MoofBox::decode(&moof).expect_err("conflicting flags");
    assert_eq!(err.kind, ErrorKind::InvalidInput);

    // エンコード時にも同じ検査が行われる
    let run = TrunBox {
        data_offset: None,
        first_sample_flags: Some(isobmff::boxes::SampleFlags::from_sync(true)),
        samples: vec![TrunSample {
            flags: Some(isobmff::boxes::SampleFlags::from_sync(false)),
            ..Default::default()
        }],
    };
    let err = run.encode_to_vec().expect_err("conflicting flags");
    assert_eq!(err.kind, ErrorKind::InvalidInput);
    Ok(())
}

#[test]
fn offset_width_switches_above_32_bits() -> Result<()> {
    assert_eq!(choose_offset_box(&[]), ChunkOffsetRepr::Stco);
    assert_eq!(choose_offset_box(&[0, 0xFFFF_FFFF]), ChunkOffsetRepr::Stco);
    assert_eq!(choose_offset_box(&[0x1_0000_0000, 0]), ChunkOffsetRepr::Co64);

    let small = ChunkOffsetBox {
        offsets: vec![0xFFFF_FFFF],
    };
    assert_eq!(&small.encode_to_vec()?[4..8], b"stco");
    let large = ChunkOffsetBox {
        offsets: vec![0x1_0000_0000],
    };
    let bytes = large.encode_to_vec()?;
    assert_eq!(&bytes[4..8], b"co64");
    assert_eq!(bytes.len(), small.encoded_size()? + 4);
    assert_eq!(ChunkOffsetBox::decode(&bytes)?.0, large);
    Ok(())
}

#[test]
fn compact_width_selection() {
    assert_eq!(choose_width(&[7, 7, 7]), SampleSizeRepr::Uniform(7));
    assert_eq!(choose_width(&[1, 15]), SampleSizeRepr::Compact(FieldWidth::Four));
    assert_eq!(choose_width(&[1, 16]), SampleSizeRepr::Compact(FieldWidth::Eight));
    assert_eq!(choose_width(&[1, 0xFFFF]), SampleSizeRepr::Compact(FieldWidth::Sixteen));
    assert_eq!(choose_width(&[1, 0x1_0000]), SampleSizeRepr::Regular);
    assert_eq!(choose_width(&[0, 0]), SampleSizeRepr::Compact(FieldWidth::Four));
}

#[test]
fn truncated_and_oversized_boxes() {
    let bytes = minimal_moov();
    let err = parse_box(&bytes[..bytes.len() - 1]).expect_err("truncated");
    assert_eq!(err.kind, ErrorKind::TruncatedBox);

    // 子ボックスが親の残りサイズを超えている
    let mut child = full(b"mfhd", 0, 0, &u32s(&[1]));
    child[3] = 64;
    let err = MoofBox::decode(&bx(b"moof", &child)).expect_err("oversized child");
    assert!(err.kind.is_invalid_file());
}

#[test]
fn zero_size_box_extends_to_end_of_stream() -> Result<()> {
    let mut bytes = full(b"mfhd", 0, 0, &u32s(&[7]));
    bytes.extend_from_slice(&[0, 0, 0, 0, b'm', b'd', b'a', b't', 1, 2, 3]);
    let boxes = parse_boxes(&bytes)?;
    assert_eq!(boxes.len(), 2);
    let AnyBox::Mdat(mdat) = &boxes[1] else {
        panic!("expected mdat: {:?}", boxes[1]);
    };
    assert_eq!(mdat.payload, [1, 2, 3]);
    Ok(())
}

#[test]
fn unknown_and_uuid_boxes_round_trip() -> Result<()> {
    let mut uuid = 28u32.to_be_bytes().to_vec();
    uuid.extend_from_slice(b"uuid");
    uuid.extend_from_slice(&[9; 16]);
    uuid.extend_from_slice(&[1, 2, 3, 4]);
    let bytes = [bx(b"styp", b"msdh\0\0\0\0msdh"), bx(b"zzzz", &[5; 3]), uuid].concat();

    let boxes = parse_boxes(&bytes)?;
    assert_eq!(boxes.len(), 3);
    for b in &boxes {
        assert!(matches!(b, AnyBox::Unknown(_)), "{b:?}");
    }
    let AnyBox::Unknown(uuid) = &boxes[2] else {
        unreachable!()
    };
    assert_eq!(uuid.box_type, BoxType::Uuid([9; 16]));
    assert_eq!(isobmff::boxes::encode_boxes(&boxes)?, bytes);
    Ok(())
}

#[test]
fn unknown_box_keeps_large_size_header() -> Result<()> {
    let mut bytes = 1u32.to_be_bytes().to_vec();
    bytes.extend_from_slice(b"zzzz");
    bytes.extend_from_slice(&19u64.to_be_bytes());
    bytes.extend_from_slice(&[7, 8, 9]);

    let boxes = parse_boxes(&bytes)?;
    let [AnyBox::Unknown(unknown)] = boxes.as_slice() else {
        panic!("unexpected boxes: {boxes:?}");
    };
    assert!(unknown.large_size);
    assert_eq!(unknown.payload, [7, 8, 9]);
    assert_eq!(isobmff::boxes::encode_boxes(&boxes)?, bytes);
    Ok(())
}

#[test]
fn duplicate_and_missing_children() -> Result<()> {
    let bytes = minimal_moov();
    let mvhd_size = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let mvhd = &bytes[8..8 + mvhd_size];

    let duplicated = bx(b"moov", &[mvhd, &bytes[8..]].concat());
    let err = MoovBox::decode(&duplicated).expect_err("duplicate mvhd");
    assert_eq!(err.kind, ErrorKind::DuplicateBox);

    let err = MoovBox::decode(&bx(b"moov", &bytes[8 + mvhd_size..])).expect_err("no mvhd");
    assert_eq!(err.kind, ErrorKind::MissingMandatoryBox);
    assert!(err.kind.is_invalid_file());

    let mut moov = decode_moov(&bytes)?;
    moov.track_mut(1).expect("track 1").mdia_box = None;
    let err = moov.encode_to_vec().expect_err("no mdia");
    assert_eq!(err.kind, ErrorKind::MissingMandatoryBox);
    Ok(())
}

#[test]
fn header_version_follows_values() -> Result<()> {
    let bytes = minimal_moov();
    let mut moov = decode_moov(&bytes)?;
    let base_size = moov.encoded_size()?;

    moov.mvhd_mut()?.duration = u32::MAX as u64;
    assert_eq!(moov.encoded_size()?, base_size);

    moov.mvhd_mut()?.duration = u32::MAX as u64 + 1;
    assert_eq!(moov.encoded_size()?, base_size + 12);
    let encoded = moov.encode_to_vec()?;
    assert_eq!(encoded[16], 1);
    assert_eq!(decode_moov(&encoded)?, moov);
    Ok(())
}
