use std::num::NonZeroU32;

use isobmff::{
    BoxType, Decode, Encode, ErrorKind, Result,
    aux::SampleTableAccessor,
    boxes::{SampleEntry, SampleSizeRepr, SampleSizes, StblBox, StscEntry, StszBox},
    sample_table::{AppendSample, Chunk, ChunkPlacement},
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

fn index(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).expect("non zero")
}

fn empty_stbl() -> StblBox {
    StblBox::new(SampleEntry {
        box_type: BoxType::Normal(*b"mp4a"),
        data_reference_index: 1,
        body: vec![0; 20],
    })
}

fn sample(size: u32, is_sync: bool, placement: ChunkPlacement) -> AppendSample {
    AppendSample {
        size,
        duration: 1024,
        composition_offset: 0,
        is_sync,
        placement,
    }
}

/// 5 サンプルを 2 + 3 のチャンクに分けて持つ stbl（stz2 の 8 ビット形式）
fn compact_stbl_bytes() -> Vec<u8> {
    let sample_entry = bx(b"mp4a", &[vec![0; 6], vec![0, 1], vec![0; 20]].concat());
    bx(
        b"stbl",
        &[
            full(b"stsd", 0, 0, &[u32s(&[1]), sample_entry].concat()),
            full(b"stts", 0, 0, &u32s(&[2, 3, 100, 2, 200])),
            full(b"stss", 0, 0, &u32s(&[2, 1, 4])),
            full(b"stsc", 0, 0, &u32s(&[2, 1, 2, 1, 2, 3, 1])),
            full(b"stz2", 0, 0, &[vec![0, 0, 0, 8], u32s(&[5]), vec![10, 20, 30, 40, 50]].concat()),
            full(b"stco", 0, 0, &u32s(&[2, 1000, 5000])),
        ]
        .concat(),
    )
}

#[test]
fn parsed_tables_answer_sample_queries() -> Result<()> {
    let (mut stbl, _) = StblBox::decode(&compact_stbl_bytes())?;
    stbl.check_consistency()?;
    assert_eq!(stbl.sample_count(), 5);
    assert_eq!(stbl.chunk_count(), 2);

    // 順方向の連続アクセス
    let times: Vec<_> = (1..=5).filter_map(|n| stbl.decode_time(n)).collect();
    assert_eq!(times, [0, 100, 200, 300, 500]);
    let offsets: Vec<_> = (1..=5).filter_map(|n| stbl.sample_offset(n)).collect();
    assert_eq!(offsets, [1000, 1010, 5000, 5030, 5070]);

    // 逆方向のランダムアクセスでも同じ結果になる
    assert_eq!(stbl.decode_time(4), Some(300));
    assert_eq!(stbl.decode_time(1), Some(0));
    assert_eq!(stbl.sample_offset(2), Some(1010));
    let chunk = stbl.sample_to_chunk(5).expect("chunk");
    assert_eq!((chunk.chunk, chunk.first_sample), (2, 3));

    let sync: Vec<_> = (1..=5).filter_map(|n| stbl.is_sync_sample(n)).collect();
    assert_eq!(sync, [true, false, false, true, false]);
    Ok(())
}

#[test]
fn compact_sizes_reach_a_fixed_point() -> Result<()> {
    let bytes = compact_stbl_bytes();
    let (stbl, _) = StblBox::decode(&bytes)?;
    let once = stbl.encode_to_vec()?;
    assert_eq!(once, bytes);

    let (reparsed, _) = StblBox::decode(&once)?;
    assert_eq!(reparsed, stbl);
    assert_eq!(reparsed.encode_to_vec()?, once);

    // 全サイズが等しくなると、次の書き出しで stsz の一様形式になる
    let mut uniform = stbl.clone();
    if let Some(stsz) = &mut uniform.stsz_box {
        *stsz = StszBox {
            sizes: SampleSizes::PerSample(vec![7; 5]),
            compact: true,
        };
    }
    assert_eq!(uniform.stsz()?.representation(), SampleSizeRepr::Uniform(7));
    let encoded = uniform.encode_to_vec()?;
    let (normalized, _) = StblBox::decode(&encoded)?;
    assert_eq!(normalized.stsz()?.sample_size(3), Some(7));
    assert_eq!(normalized.encode_to_vec()?, encoded);
    Ok(())
}

#[test]
fn editing_keeps_tables_consistent() -> Result<()> {
    let mut stbl = empty_stbl();
    stbl.append_sample(sample(
        10,
        true,
        ChunkPlacement::NewChunk {
            offset: 100,
            description_index: index(1),
        },
    ))?;
    for size in [11, 12] {
        stbl.append_sample(sample(size, false, ChunkPlacement::CurrentChunk))?;
    }
    stbl.append_sample(sample(
        13,
        true,
        ChunkPlacement::NewChunk {
            offset: 900,
            description_index: index(1),
        },
    ))?;
    stbl.check_consistency()?;

    // 読み取り位置を末尾まで進めてから編集する
    assert_eq!(stbl.decode_time(4), Some(3072));
    assert_eq!(stbl.sample_offset(4), Some(900));

    stbl.remove_sample(2)?;
    stbl.check_consistency()?;
    assert_eq!(stbl.sample_count(), 3);
    assert_eq!(stbl.chunk_count(), 3);
    let offsets: Vec<_> = (1..=3).filter_map(|n| stbl.sample_offset(n)).collect();
    assert_eq!(offsets, [100, 121, 900]);
    assert_eq!(stbl.decode_time(3), Some(2048));
    let sync: Vec<_> = (1..=3).filter_map(|n| stbl.is_sync_sample(n)).collect();
    assert_eq!(sync, [true, false, true]);

    stbl.rechunk(&[Chunk {
        offset: 40,
        sample_count: 3,
        description_index: index(1),
    }])?;
    assert_eq!(stbl.chunk_count(), 1);
    assert_eq!(stbl.sample_offset(3), Some(40 + 10 + 12));
    assert_eq!(
        stbl.stsc()?.entries,
        [StscEntry {
            first_chunk: index(1),
            samples_per_chunk: 3,
            sample_description_index: index(1),
        }]
    );

    let err = stbl.remove_sample(4).expect_err("out of range");
    assert_eq!(err.kind, ErrorKind::InvalidInput);
    Ok(())
}

#[test]
fn accessor_matches_cursor_queries() -> Result<()> {
    let (mut stbl, _) = StblBox::decode(&compact_stbl_bytes())?;
    let expected: Vec<_> = (1..=5)
        .map(|n| (stbl.sample_offset(n), stbl.decode_time(n), stbl.sample_size(n)))
        .collect();

    let accessor = SampleTableAccessor::new(&stbl)?;
    let actual: Vec<_> = accessor
        .samples()
        .map(|s| (Some(s.data_offset()), Some(s.decode_time()), Some(s.data_size())))
        .collect();
    assert_eq!(actual, expected);

    let chunk_sizes: Vec<_> = accessor.chunks().map(|c| c.sample_count()).collect();
    assert_eq!(chunk_sizes, [2, 3]);
    Ok(())
}

#[test]
fn broken_chunk_coverage_is_invalid_file() -> Result<()> {
    let (mut stbl, _) = StblBox::decode(&compact_stbl_bytes())?;
    stbl.stsc_mut()?.entries[1].first_chunk = index(3);
    let err = stbl.check_consistency().expect_err("gap in chunks");
    assert!(err.kind.is_invalid_file());

    let err = SampleTableAccessor::new(&stbl).expect_err("gap in chunks");
    assert!(err.kind.is_invalid_file());
    Ok(())
}
