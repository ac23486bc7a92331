//! ムービーフラグメントの取り込みの Property-Based Testing

use std::num::NonZeroU32;

use proptest::prelude::*;
use isobmff::{
    BoxType,
    boxes::{
        DinfBox, HdlrBox, MdhdBox, MdiaBox, MfhdBox, MinfBox, MoofBox, MoovBox, MvexBox, MvhdBox,
        SampleEntry, SampleFlags, StblBox, TfhdBox, TkhdBox, TrafBox, TrakBox, TrexBox, TrunBox,
        TrunSample,
    },
    fragment::FragmentMerger,
};

fn movie(default_duration: u32) -> MoovBox {
    MoovBox {
        mvhd_box: Some(MvhdBox::default()),
        trak_boxes: vec![TrakBox {
            tkhd_box: Some(TkhdBox::new(1)),
            mdia_box: Some(MdiaBox {
                mdhd_box: Some(MdhdBox::new(NonZeroU32::new(48000).unwrap())),
                hdlr_box: Some(HdlrBox {
                    handler_type: HdlrBox::HANDLER_TYPE_SOUN,
                    name: b"\0".to_vec(),
                }),
                minf_box: Some(MinfBox {
                    media_header_box: None,
                    dinf_box: Some(DinfBox::local_file()),
                    stbl_box: Some(StblBox::new(SampleEntry {
                        box_type: BoxType::Normal(*b"mp4a"),
                        data_reference_index: 1,
                        body: Vec::new(),
                    })),
                    other_boxes: Vec::new(),
                }),
                udta_box: None,
                other_boxes: Vec::new(),
            }),
            ..Default::default()
        }],
        mvex_box: Some(MvexBox {
            mehd_box: None,
            trex_boxes: vec![TrexBox {
                default_sample_duration: default_duration,
                default_sample_size: 7,
                ..TrexBox::new(1)
            }],
            other_boxes: Vec::new(),
        }),
        ..Default::default()
    }
}

/// ラン一つ分 (データオフセット, サンプルごとの (尺, サイズ, 同期サンプルか))
type Run = (Option<u16>, Vec<(Option<u32>, u32, bool)>);

fn arb_run() -> impl Strategy<Value = Run> {
    (
        prop::option::of(any::<u16>()),
        any::<bool>(),
        prop::collection::vec((1u32..5000, 0u32..1000, any::<bool>()), 1..10),
    )
        .prop_map(|(data_offset, explicit_duration, samples)| {
            let samples = samples
                .into_iter()
                .map(|(d, s, sync)| (explicit_duration.then_some(d), s, sync))
                .collect();
            (data_offset, samples)
        })
}

fn trun((data_offset, samples): &Run) -> TrunBox {
    TrunBox {
        data_offset: data_offset.map(i32::from),
        first_sample_flags: None,
        samples: samples
            .iter()
            .map(|&(duration, size, sync)| TrunSample {
                duration,
                size: Some(size),
                flags: Some(SampleFlags::from_sync(sync)),
                composition_time_offset: None,
            })
            .collect(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    // 取り込んだ全サンプルの尺・サイズ・同期状態が保存され、テーブル間の整合性が保たれる
    #[test]
    fn merged_fragments_keep_tables_consistent(
        default_duration in 1u32..2000,
        fragments in prop::collection::vec(prop::collection::vec(arb_run(), 1..4), 1..5),
    ) {
        let mut moov = movie(default_duration);
        let mut merger = FragmentMerger::new();
        let mut expected = Vec::new();
        let mut run_count = 0;
        for (i, runs) in fragments.iter().enumerate() {
            let moof = MoofBox {
                mfhd_box: Some(MfhdBox { sequence_number: i as u32 + 1 }),
                traf_boxes: vec![TrafBox {
                    tfhd_box: Some(TfhdBox::new(1)),
                    tfdt_box: None,
                    sdtp_box: None,
                    trun_boxes: runs.iter().map(trun).collect(),
                    other_boxes: Vec::new(),
                }],
                other_boxes: Vec::new(),
            };
            merger.merge(&mut moov, &moof, (i as u64 + 1) * 100_000).unwrap();
            run_count += runs.len();
            for (_, samples) in runs {
                for &(duration, size, sync) in samples {
                    expected.push((duration.unwrap_or(default_duration), size, sync));
                }
            }
        }
        prop_assert_eq!(merger.last_sequence_number(), Some(fragments.len() as u32));

        let trak = moov.track_mut(1).unwrap();
        let stbl = trak.stbl_mut().unwrap();
        stbl.check_consistency().unwrap();
        prop_assert_eq!(stbl.chunk_count() as usize, run_count);

        let actual: Vec<_> = (1..=stbl.sample_count())
            .map(|n| {
                (
                    stbl.sample_duration(n).unwrap(),
                    stbl.sample_size(n).unwrap(),
                    stbl.is_sync_sample(n).unwrap(),
                )
            })
            .collect();
        prop_assert_eq!(&actual, &expected);

        let total: u64 = expected.iter().map(|e| e.0 as u64).sum();
        prop_assert_eq!(trak.mdia().unwrap().mdhd().unwrap().duration, total);
        prop_assert_eq!(
            moov.mvhd().unwrap().duration,
            moov.track(1).unwrap().tkhd().unwrap().duration
        );
    }
}
