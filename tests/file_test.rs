use std::{num::NonZeroU32, path::Path, time::Duration};

use isobmff::{
    BoxType, ChunkingPolicy, Encode, FileError, IsoFile, Layout, OpenMode, OpenOptions, Sample,
    SaveOptions, TrackConfig,
    boxes::{
        Brand, DinfBox, FtypBox, HdlrBox, MdhdBox, MdiaBox, MinfBox, MoovBox, MvexBox, MvhdBox,
        SampleEntry, StblBox, TkhdBox, TrakBox, TrexBox, TrefBox, TrackReferenceTypeBox,
    },
};

fn timescale(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).expect("non zero")
}

fn entry(box_type: &[u8; 4]) -> SampleEntry {
    SampleEntry {
        box_type: BoxType::Normal(*box_type),
        data_reference_index: 1,
        body: vec![0; 8],
    }
}

fn sample(data: Vec<u8>, duration: u32, is_sync: bool) -> Sample {
    Sample {
        data,
        duration,
        composition_offset: 0,
        is_sync,
        description_index: timescale(1),
    }
}

fn open(path: &Path, mode: OpenMode) -> Result<IsoFile, FileError> {
    IsoFile::open(
        path,
        OpenOptions {
            mode,
            ..Default::default()
        },
    )
}

/// 映像 1 トラック（3 サンプル）と音声 1 トラック（4 サンプル）を持つファイルを作る
fn write_two_track_file(path: &Path) -> Result<(u32, u32), FileError> {
    let mut file = IsoFile::new();
    let video = file.add_track(TrackConfig::video(timescale(90000), entry(b"avc1"), 320, 240))?;
    let audio = file.add_track(TrackConfig::audio(timescale(48000), entry(b"mp4a")))?;
    for i in 0..3u8 {
        file.add_sample(video, sample(vec![i; 100 + i as usize], 3000, i == 0))?;
        file.add_sample(audio, sample(vec![0xA0 + i; 10], 1024, true))?;
    }
    file.add_sample(audio, sample(vec![0xA3; 10], 1024, true))?;
    file.save(path, SaveOptions::default())?;
    Ok((video, audio))
}

#[test]
fn new_file_round_trips_through_disk() -> Result<(), FileError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out.mp4");
    let (video, audio) = write_two_track_file(&path)?;
    assert_eq!((video, audio), (1, 2));

    let mut file = open(&path, OpenMode::ReadOnly)?;
    assert_eq!(file.track_ids()?, [1, 2]);
    assert_eq!(file.ftyp()?.map(|f| f.major_brand), Some(Brand::ISOM));
    assert_eq!(file.moov()?.mvhd()?.next_track_id, 3);
    assert_eq!(file.media_data_ranges()?.len(), 1);

    for i in 0..3u8 {
        assert_eq!(file.sample_data(video, i as u32 + 1)?, vec![i; 100 + i as usize]);
    }
    assert_eq!(file.sample_data(audio, 4)?, vec![0xA3; 10]);

    let trak = file.track(video)?;
    assert_eq!(trak.mdia()?.mdhd()?.duration, 9000);
    assert_eq!(trak.tkhd()?.duration, 60);
    let stbl = trak.stbl()?;
    stbl.check_consistency()?;
    assert_eq!(stbl.is_sync_sample(2), Some(false));
    Ok(())
}

#[test]
fn chunking_policy_groups_consecutive_samples() -> Result<(), FileError> {
    let mut file = IsoFile::new();
    file.set_chunking_policy(ChunkingPolicy {
        max_samples_per_chunk: 2,
    })?;
    let track = file.add_track(TrackConfig::audio(timescale(1000), entry(b"mp4a")))?;
    for i in 0..5u8 {
        file.add_sample(track, sample(vec![i; 4], 20, true))?;
    }
    let stbl = file.track(track)?.stbl()?;
    assert_eq!(stbl.chunk_count(), 3);
    assert_eq!(stbl.sample_count(), 5);

    // 別のトラックへの追加を挟むと新しいチャンクになる
    let other = file.add_track(TrackConfig::audio(timescale(1000), entry(b"mp4a")))?;
    file.add_sample(other, sample(vec![9; 4], 20, true))?;
    file.add_sample(track, sample(vec![5; 4], 20, true))?;
    assert_eq!(file.track(track)?.stbl()?.chunk_count(), 4);
    assert_eq!(file.sample_data(track, 6)?, vec![5; 4]);
    Ok(())
}

#[test]
fn edit_in_place_and_save_over_source() -> Result<(), FileError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("edit.mp4");
    let (video, audio) = write_two_track_file(&path)?;

    let mut file = open(&path, OpenMode::Edit)?;
    file.remove_track(video)?;
    file.add_sample(audio, sample(vec![0xA4; 12], 1024, true))?;
    file.set_brand(Brand::MP42, 1)?;
    file.save(&path, SaveOptions::default())?;

    // 保存後も同じハンドルから新しいファイルの内容を読める
    assert_eq!(file.sample_data(audio, 5)?, vec![0xA4; 12]);
    file.close()?;

    let mut reopened = open(&path, OpenMode::ReadOnly)?;
    assert_eq!(reopened.track_ids()?, [audio]);
    let ftyp = reopened.ftyp()?.expect("ftyp").clone();
    assert_eq!(ftyp.major_brand, Brand::MP42);
    assert!(ftyp.compatible_brands.contains(&Brand::MP42));
    let data: Vec<_> = (1..=5)
        .map(|n| reopened.sample_data(audio, n))
        .collect::<Result<_, _>>()?;
    assert_eq!(
        data,
        [
            vec![0xA0; 10],
            vec![0xA1; 10],
            vec![0xA2; 10],
            vec![0xA3; 10],
            vec![0xA4; 12]
        ]
    );
    assert!(matches!(
        reopened.track(video),
        Err(FileError::TrackNotFound(id)) if id == video
    ));
    Ok(())
}

#[test]
fn interleaved_layout_orders_chunks_by_time() -> Result<(), FileError> {
    let dir = tempfile::tempdir()?;
    let source = dir.path().join("source.mp4");
    let output = dir.path().join("interleaved.mp4");
    let (video, audio) = write_two_track_file(&source)?;

    let mut file = open(&source, OpenMode::Edit)?;
    file.save(
        &output,
        SaveOptions {
            layout: Layout::Interleaved {
                chunk_duration: Duration::from_millis(50),
            },
            ..Default::default()
        },
    )?;

    let mut file = open(&output, OpenMode::ReadOnly)?;
    // 映像は 1 サンプル (33.3ms)、音声は 2 サンプル (42.7ms) ずつのチャンクになる
    assert_eq!(file.track(video)?.stbl()?.chunk_count(), 3);
    assert_eq!(file.track(audio)?.stbl()?.chunk_count(), 2);

    let video_offsets = &file.track(video)?.stbl()?.chunk_offsets()?.offsets.clone();
    let audio_offsets = &file.track(audio)?.stbl()?.chunk_offsets()?.offsets.clone();
    assert!(video_offsets[0] < audio_offsets[0]);
    assert!(audio_offsets[0] < video_offsets[1]);
    assert!(audio_offsets[1] < video_offsets[2]);

    assert_eq!(file.sample_data(video, 3)?, vec![2; 102]);
    assert_eq!(file.sample_data(audio, 2)?, vec![0xA1; 10]);
    Ok(())
}

#[test]
fn removing_a_track_drops_references_and_trex() -> Result<(), FileError> {
    let mut file = IsoFile::new();
    let video = file.add_track(TrackConfig::video(timescale(90000), entry(b"avc1"), 64, 64))?;
    let hint = file.add_track(TrackConfig {
        handler_type: HdlrBox::HANDLER_TYPE_HINT,
        ..TrackConfig::audio(timescale(90000), entry(b"rtp "))
    })?;
    file.track_mut(hint)?.tref_box = Some(TrefBox {
        references: vec![TrackReferenceTypeBox {
            reference_type: BoxType::Normal(*b"hint"),
            track_ids: vec![video],
        }],
    });

    file.remove_track(video)?;
    assert_eq!(file.track_ids()?, [hint]);
    assert!(file.track(hint)?.tref_box.is_none());
    assert!(matches!(
        file.remove_track(video),
        Err(FileError::TrackNotFound(_))
    ));
    Ok(())
}

#[test]
fn read_only_and_closed_handles_reject_operations() -> Result<(), FileError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ro.mp4");
    let (video, _) = write_two_track_file(&path)?;

    let mut file = open(&path, OpenMode::ReadOnly)?;
    assert!(matches!(
        file.add_sample(video, sample(vec![0], 1, true)),
        Err(FileError::ReadOnly)
    ));
    assert!(matches!(file.remove_track(video), Err(FileError::ReadOnly)));
    assert!(matches!(
        file.save(&path, SaveOptions::default()),
        Err(FileError::ReadOnly)
    ));
    assert!(matches!(file.track_mut(video), Err(FileError::ReadOnly)));
    assert!(file.track(video).is_ok());

    file.close()?;
    assert!(matches!(file.track_ids(), Err(FileError::Closed)));
    assert!(matches!(file.sample_data(video, 1), Err(FileError::Closed)));
    assert!(matches!(file.close(), Err(FileError::Closed)));
    Ok(())
}

#[test]
fn write_new_mode_ignores_existing_contents() -> Result<(), FileError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("new.mp4");
    std::fs::write(&path, b"not an mp4 file")?;

    let mut file = open(&path, OpenMode::WriteNew)?;
    assert_eq!(file.track_ids()?, Vec::<u32>::new());
    let track = file.add_track(TrackConfig::audio(timescale(8000), entry(b"mp4a")))?;
    file.add_sample(track, sample(vec![1, 2, 3], 160, true))?;
    file.save(&path, SaveOptions::default())?;

    let mut file = open(&path, OpenMode::ReadOnly)?;
    assert_eq!(file.sample_data(track, 1)?, [1, 2, 3]);
    Ok(())
}

#[test]
fn missing_moov_is_rejected() -> Result<(), FileError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("no-moov.mp4");
    std::fs::write(&path, FtypBox::default().encode_to_vec()?)?;
    let err = open(&path, OpenMode::ReadOnly).expect_err("no moov");
    assert!(matches!(err, FileError::Box(e) if e.kind.is_invalid_file()));
    Ok(())
}

fn fragmented_movie() -> MoovBox {
    MoovBox {
        mvhd_box: Some(MvhdBox::default()),
        trak_boxes: vec![TrakBox {
            tkhd_box: Some(TkhdBox::new(1)),
            mdia_box: Some(MdiaBox {
                mdhd_box: Some(MdhdBox::new(timescale(1000))),
                hdlr_box: Some(HdlrBox {
                    handler_type: HdlrBox::HANDLER_TYPE_SOUN,
                    name: b"\0".to_vec(),
                }),
                minf_box: Some(MinfBox {
                    media_header_box: None,
                    dinf_box: Some(DinfBox::local_file()),
                    stbl_box: Some(StblBox::new(entry(b"mp4a"))),
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
                default_sample_duration: 20,
                ..TrexBox::new(1)
            }],
            other_boxes: Vec::new(),
        }),
        ..Default::default()
    }
}

/// ftyp + moov + (moof + mdat) x 2 のフラグメント化されたファイルを書き出す
fn write_fragmented_file(path: &Path) -> Result<(), FileError> {
    use isobmff::boxes::{MfhdBox, MoofBox, TfhdBox, TrafBox, TrunBox, TrunSample};

    let mut bytes = FtypBox::default().encode_to_vec()?;
    bytes.extend_from_slice(&fragmented_movie().encode_to_vec()?);
    for (sequence_number, payload) in [(1, [1u8; 6]), (2, [2u8; 6])] {
        let mut moof = MoofBox {
            mfhd_box: Some(MfhdBox { sequence_number }),
            traf_boxes: vec![TrafBox {
                tfhd_box: Some(TfhdBox {
                    default_base_is_moof: true,
                    ..TfhdBox::new(1)
                }),
                tfdt_box: None,
                sdtp_box: None,
                trun_boxes: vec![TrunBox {
                    data_offset: Some(0),
                    first_sample_flags: None,
                    samples: vec![
                        TrunSample {
                            size: Some(4),
                            ..Default::default()
                        },
                        TrunSample {
                            size: Some(2),
                            ..Default::default()
                        },
                    ],
                }],
                other_boxes: Vec::new(),
            }],
            other_boxes: Vec::new(),
        };
        // データはこの moof の直後の mdat ペイロードから始まる
        let data_offset = moof.encoded_size()? + 8;
        moof.traf_boxes[0].trun_boxes[0].data_offset = Some(data_offset as i32);
        bytes.extend_from_slice(&moof.encode_to_vec()?);
        bytes.extend_from_slice(&(8 + payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(b"mdat");
        bytes.extend_from_slice(&payload);
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

#[test]
fn fragments_are_merged_and_flattened_on_save() -> Result<(), FileError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fragmented.mp4");
    let output = dir.path().join("flat.mp4");
    write_fragmented_file(&path)?;

    let mut file = open(&path, OpenMode::Edit)?;
    assert_eq!(file.media_data_ranges()?.len(), 2);
    let stbl = file.track(1)?.stbl()?;
    assert_eq!(stbl.sample_count(), 4);
    assert_eq!(stbl.chunk_count(), 2);
    assert_eq!(file.sample_data(1, 2)?, [1, 1]);
    assert_eq!(file.sample_data(1, 3)?, [2, 2, 2, 2]);
    assert_eq!(file.track(1)?.mdia()?.mdhd()?.duration, 80);

    file.save(&output, SaveOptions::default())?;
    let mut flat = open(&output, OpenMode::ReadOnly)?;
    assert!(flat.moov()?.mvex_box.is_none());
    assert_eq!(flat.sample_data(1, 4)?, [2, 2]);
    Ok(())
}

#[test]
fn unmerged_fragments_cannot_be_saved() -> Result<(), FileError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fragmented.mp4");
    write_fragmented_file(&path)?;

    let mut file = IsoFile::open(
        &path,
        OpenOptions {
            mode: OpenMode::Edit,
            merge_fragments: false,
        },
    )?;
    assert_eq!(file.fragments()?.len(), 2);
    assert_eq!(file.track(1)?.stbl()?.sample_count(), 0);
    assert!(matches!(
        file.save(dir.path().join("out.mp4"), SaveOptions::default()),
        Err(FileError::Layout(_))
    ));
    Ok(())
}
