//! サンプルテーブルの Property-Based Testing

use std::num::NonZeroU32;

use proptest::prelude::*;
use isobmff::{
    BoxType, Decode, Encode,
    aux::SampleTableAccessor,
    boxes::{
        ChunkOffsetBox, ChunkOffsetRepr, CttsBox, FieldWidth, SampleEntry, SampleSizeRepr,
        SampleSizes, StblBox, StscBox, StszBox, SttsBox, choose_offset_box, choose_width,
    },
    sample_table::{AppendSample, ChunkPlacement},
};

/// choose_width() の結果を、フィールド幅の広さの順位に変換する (一様形式は対象外)
fn width_rank(repr: SampleSizeRepr) -> Option<u8> {
    match repr {
        SampleSizeRepr::Uniform(_) => None,
        SampleSizeRepr::Compact(FieldWidth::Four) => Some(0),
        SampleSizeRepr::Compact(FieldWidth::Eight) => Some(1),
        SampleSizeRepr::Compact(FieldWidth::Sixteen) => Some(2),
        SampleSizeRepr::Regular => Some(3),
    }
}

/// サンプルサイズを生成する Strategy (各フィールド幅の境界付近を含む)
fn arb_sample_size() -> impl Strategy<Value = u32> {
    prop_oneof![
        0u32..=0x20,
        0xF0u32..=0x110,
        0xFFF0u32..=0x1_0010,
        any::<u32>(),
    ]
}

/// 追加するサンプルの列を生成する Strategy
///
/// 各要素は (サイズ, 尺, 同期サンプルか, 新しいチャンクを始めるか)
fn arb_appends() -> impl Strategy<Value = Vec<(u32, u32, bool, bool)>> {
    prop::collection::vec(
        (0u32..5000, 1u32..3000, any::<bool>(), any::<bool>()),
        1..40,
    )
}

/// 生成した列に従ってサンプルを追加した stbl を作る
///
/// チャンクは詰めて配置し、各チャンクの間には 1000 バイトの隙間を置く
fn build_stbl(appends: &[(u32, u32, bool, bool)]) -> StblBox {
    let mut stbl = StblBox::new(SampleEntry {
        box_type: BoxType::Normal(*b"avc1"),
        data_reference_index: 1,
        body: Vec::new(),
    });
    let mut offset = 0u64;
    for (i, &(size, duration, is_sync, new_chunk)) in appends.iter().enumerate() {
        let placement = if i == 0 || new_chunk {
            offset += 1000;
            ChunkPlacement::NewChunk {
                offset,
                description_index: NonZeroU32::MIN,
            }
        } else {
            ChunkPlacement::CurrentChunk
        };
        stbl.append_sample(AppendSample {
            size,
            duration,
            composition_offset: 0,
            is_sync,
            placement,
        })
        .unwrap();
        offset += size as u64;
    }
    stbl
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // 同じ入力からは常に同じ形式が選ばれ、最大値が収まる最も狭い幅になる
    #[test]
    fn choose_width_picks_narrowest_width(
        sizes in prop::collection::vec(arb_sample_size(), 0..50),
    ) {
        let repr = choose_width(&sizes);
        prop_assert_eq!(repr, choose_width(&sizes.clone()));

        let max = sizes.iter().copied().max().unwrap_or(0);
        match repr {
            SampleSizeRepr::Uniform(size) => {
                prop_assert!(size != 0);
                prop_assert!(sizes.iter().all(|&s| s == size));
            }
            SampleSizeRepr::Compact(width) => {
                prop_assert!(max < (1u32 << width.bits()));
                if width != FieldWidth::Four {
                    prop_assert!(max >= (1u32 << (width.bits() / 2)));
                }
            }
            SampleSizeRepr::Regular => prop_assert!(max > 0xFFFF),
        }
    }

    // 最大値が大きくなるほど、選ばれるフィールド幅は広くなる
    #[test]
    fn choose_width_is_monotonic_in_max(
        sizes in prop::collection::vec(arb_sample_size(), 0..50),
        extra in arb_sample_size(),
    ) {
        // 0 と 1 を含めて一様形式にならないようにする
        let mut base = vec![0, 1];
        base.extend_from_slice(&sizes);
        let mut grown = base.clone();
        grown.push(extra);

        let before = width_rank(choose_width(&base)).unwrap();
        let after = width_rank(choose_width(&grown)).unwrap();
        prop_assert!(before <= after);
    }

    // co64 が選ばれるのは最大オフセットが 32 ビットに収まらない場合のみ
    #[test]
    fn offset_box_selection(offsets in prop::collection::vec(
        prop_oneof![0u64..=0x1_0000_0010, (u32::MAX as u64 - 4)..=(u32::MAX as u64 + 4)],
        0..20,
    )) {
        let max = offsets.iter().copied().max().unwrap_or(0);
        let expected = if max > 0xFFFF_FFFF {
            ChunkOffsetRepr::Co64
        } else {
            ChunkOffsetRepr::Stco
        };
        prop_assert_eq!(choose_offset_box(&offsets), expected);

        let chunk_offsets = ChunkOffsetBox { offsets };
        let encoded = chunk_offsets.encode_to_vec().unwrap();
        let (decoded, size) = ChunkOffsetBox::decode(&encoded).unwrap();
        prop_assert_eq!(size, encoded.len());
        prop_assert_eq!(decoded, chunk_offsets);
    }

    // サンプルサイズは書き出し形式によらず保存され、二回目以降の書き出しは不動点になる
    #[test]
    fn sample_sizes_reach_fixed_point(
        sizes in prop::collection::vec(arb_sample_size(), 0..50),
        compact in any::<bool>(),
    ) {
        let stsz = StszBox { sizes: SampleSizes::PerSample(sizes.clone()), compact };
        let encoded = stsz.encode_to_vec().unwrap();
        let (decoded, _) = StszBox::decode(&encoded).unwrap();
        prop_assert_eq!(decoded.sample_sizes().collect::<Vec<_>>(), sizes);

        let reencoded = decoded.encode_to_vec().unwrap();
        let (redecoded, _) = StszBox::decode(&reencoded).unwrap();
        prop_assert_eq!(redecoded.encode_to_vec().unwrap(), reencoded);
    }

    // ランレングス表現のテーブルは、展開した値の列を保存する
    #[test]
    fn run_length_tables_preserve_values(
        deltas in prop::collection::vec(prop_oneof![Just(1024u32), 1u32..4000], 0..60),
        offsets in prop::collection::vec(prop_oneof![Just(0i64), -3000i64..3000], 0..60),
    ) {
        let stts = SttsBox::from_sample_deltas(deltas.iter().copied());
        prop_assert_eq!(stts.sample_deltas().collect::<Vec<_>>(), deltas.clone());
        prop_assert_eq!(stts.total_duration(), deltas.iter().map(|&d| d as u64).sum::<u64>());
        let (decoded, _) = SttsBox::decode(&stts.encode_to_vec().unwrap()).unwrap();
        prop_assert_eq!(decoded.sample_deltas().collect::<Vec<_>>(), deltas);

        let ctts = CttsBox::from_sample_offsets(offsets.iter().copied());
        let (decoded, _) = CttsBox::decode(&ctts.encode_to_vec().unwrap()).unwrap();
        prop_assert_eq!(decoded.sample_offsets().collect::<Vec<_>>(), offsets);
    }

    // stsc はチャンクごとのサンプル数の列を保存する
    #[test]
    fn stsc_preserves_chunk_sizes(
        chunks in prop::collection::vec((1u32..5, 1u32..3), 0..40),
    ) {
        let chunks: Vec<_> = chunks
            .into_iter()
            .map(|(n, index)| (n, NonZeroU32::new(index).unwrap()))
            .collect();
        let stsc = StscBox::from_chunk_sizes(chunks.iter().copied());
        prop_assert!(stsc.entries.len() <= chunks.len());
        prop_assert_eq!(stsc.chunk_sizes(chunks.len() as u32).unwrap(), chunks.clone());

        let (decoded, _) = StscBox::decode(&stsc.encode_to_vec().unwrap()).unwrap();
        prop_assert_eq!(decoded.chunk_sizes(chunks.len() as u32).unwrap(), chunks);
    }

    // サンプルの追加と削除の後もテーブル間の整合性が保たれ、残ったサンプルの位置は変わらない
    #[test]
    fn chunk_coverage_survives_edits(
        appends in arb_appends(),
        removals in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
    ) {
        let mut stbl = build_stbl(&appends);
        stbl.check_consistency().unwrap();

        let mut expected: Vec<(u64, u32, bool)> = (1..=stbl.sample_count())
            .map(|n| {
                (
                    stbl.sample_offset(n).unwrap(),
                    stbl.sample_size(n).unwrap(),
                    stbl.is_sync_sample(n).unwrap(),
                )
            })
            .collect();

        for index in removals {
            if expected.is_empty() {
                break;
            }
            let i = index.index(expected.len());
            stbl.remove_sample(i as u32 + 1).unwrap();
            expected.remove(i);
            stbl.check_consistency().unwrap();
        }

        prop_assert_eq!(stbl.sample_count() as usize, expected.len());
        let chunks = stbl.chunks().unwrap();
        prop_assert_eq!(chunks.len() as u32, stbl.chunk_count());
        prop_assert_eq!(
            chunks.iter().map(|c| c.sample_count as usize).sum::<usize>(),
            expected.len()
        );
        prop_assert!(chunks.iter().all(|c| c.sample_count > 0));

        let actual: Vec<_> = (1..=stbl.sample_count())
            .map(|n| {
                (
                    stbl.sample_offset(n).unwrap(),
                    stbl.sample_size(n).unwrap(),
                    stbl.is_sync_sample(n).unwrap(),
                )
            })
            .collect();
        prop_assert_eq!(actual, expected);
    }

    // 読み取り位置を使う問い合わせと、不変参照のアクセサーの結果が一致する
    #[test]
    fn accessor_agrees_with_cursor_queries(
        appends in arb_appends(),
        lookups in prop::collection::vec(any::<prop::sample::Index>(), 1..20),
    ) {
        let mut stbl = build_stbl(&appends);
        let count = stbl.sample_count() as usize;
        let expected: Vec<_> = lookups
            .iter()
            .map(|p| {
                let n = p.index(count) as u32 + 1;
                (
                    stbl.decode_time(n).unwrap(),
                    stbl.sample_offset(n).unwrap(),
                    stbl.sample_to_chunk(n).unwrap().chunk,
                )
            })
            .collect();

        let accessor = SampleTableAccessor::new(&stbl).unwrap();
        let actual: Vec<_> = lookups
            .iter()
            .map(|p| {
                let n = NonZeroU32::new(p.index(count) as u32 + 1).unwrap();
                let sample = accessor.get_sample(n).unwrap();
                (sample.decode_time(), sample.data_offset(), sample.chunk().chunk_number().get())
            })
            .collect();
        prop_assert_eq!(actual, expected);

        for p in &lookups {
            let n = NonZeroU32::new(p.index(count) as u32 + 1).unwrap();
            let time = accessor.get_sample(n).unwrap().decode_time();
            let found = accessor.sample_at_time(time).unwrap();
            prop_assert!(found.decode_time() <= time);
            prop_assert!(time < found.decode_time() + found.duration() as u64);
        }
    }
}
