//! ムービーフラグメント (moof) の内容を、moov 内の各トラックのサンプルテーブルへ取り込む処理
use std::num::NonZeroU32;

use crate::{
    ContainerBox, Error, Result,
    boxes::{
        MoofBox, MoovBox, ResolvedSample, StblBox, TrackFragmentDefaults, TrafBox, TrakBox,
        TrexBox,
    },
    codec::try_vec_with_capacity,
    sample_table::{AppendSample, ChunkPlacement},
};

/// 連続するフラグメントの取り込みを行うための構造体
///
/// 直前に取り込んだフラグメントのシーケンス番号を保持しており、番号が増加していない場合には警告を出す
#[derive(Debug, Default, Clone)]
pub struct FragmentMerger {
    last_sequence_number: Option<u32>,
}

impl FragmentMerger {
    /// 新しい [`FragmentMerger`] インスタンスを生成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 直前に取り込んだフラグメントのシーケンス番号
    pub fn last_sequence_number(&self) -> Option<u32> {
        self.last_sequence_number
    }

    /// `moof_offset` の位置にある `moof` を `moov` に取り込む
    ///
    /// 詳細は [`merge_fragment()`] を参照のこと
    pub fn merge(&mut self, moov: &mut MoovBox, moof: &MoofBox, moof_offset: u64) -> Result<()> {
        let sequence_number = moof.mfhd()?.sequence_number;
        if let Some(last) = self.last_sequence_number
            && sequence_number <= last
        {
            tracing::warn!(
                sequence_number,
                last_sequence_number = last,
                "fragment sequence number did not increase"
            );
        }
        merge_fragment(moov, moof, moof_offset)?;
        self.last_sequence_number = Some(sequence_number);
        Ok(())
    }
}

/// ファイル内の `moof_offset` の位置にある `moof` のサンプルを、`moov` の各トラックの末尾に追加する
///
/// - `moov` に mvex が存在しない場合は [`ErrorKind::InvalidFile`](crate::ErrorKind::InvalidFile) となる
/// - ラン (trun) ごとに一つのチャンクが作成され、その位置はベースオフセットにランのデータオフセットを加えたものとなる
/// - ベースオフセットは tfhd の base_data_offset 、それが無い場合は moof の先頭
///   （先頭の traf 、あるいは default-base-is-moof が指定されている場合）か、直前の traf のデータの終端となる
/// - 取り込み後に tkhd / mdhd / mvhd の尺が更新される
/// - 全ての traf の検証とオフセットの計算を終えてからトラックを変更するので、
///   エラーの場合 `moov` は変更されない（メモリ確保の失敗を除く）
pub fn merge_fragment(moov: &mut MoovBox, moof: &MoofBox, moof_offset: u64) -> Result<()> {
    let movie_timescale = moov.mvhd()?.timescale;
    let plans = plan_fragment(moov, moof, moof_offset)?;
    for plan in plans {
        let trak = &mut moov.trak_boxes[plan.track_index];
        apply_track_fragment(trak, plan)?;
        update_track_duration(trak, movie_timescale)?;
    }

    let max_duration = moov
        .trak_boxes
        .iter()
        .filter_map(|t| t.tkhd_box.as_ref().map(|h| h.duration))
        .max()
        .unwrap_or(0);
    let mvhd = moov.mvhd_mut()?;
    mvhd.duration = mvhd.duration.max(max_duration);
    Ok(())
}

/// traf 一つ分の取り込み内容
#[derive(Debug)]
struct TrackFragmentPlan {
    track_index: usize,
    track_id: u32,
    description_index: NonZeroU32,
    runs: Vec<(u64, Vec<ResolvedSample>)>, // (ランの位置, サンプル群)
}

impl TrackFragmentPlan {
    fn sample_count(&self) -> u64 {
        self.runs.iter().map(|r| r.1.len() as u64).sum()
    }
}

/// `moov` を変更せずに、各 traf の取り込み先とサンプルの位置を決める
fn plan_fragment(
    moov: &MoovBox,
    moof: &MoofBox,
    moof_offset: u64,
) -> Result<Vec<TrackFragmentPlan>> {
    let Some(mvex) = &moov.mvex_box else {
        return Err(Error::invalid_file(
            "Cannot merge a movie fragment into a movie without an mvex box",
        ));
    };

    let mut plans = try_vec_with_capacity(moof.traf_boxes.len())?;
    let mut cumulated_offset = moof_offset;
    for traf in &moof.traf_boxes {
        traf.validate()?;
        let track_id = traf.tfhd()?.track_id;
        let track_index = moov
            .trak_boxes
            .iter()
            .position(|t| t.track_id() == Some(track_id));
        let (Some(trex), Some(track_index)) = (mvex.trex(track_id), track_index) else {
            return Err(Error::invalid_file(format!(
                "Cannot find the fragment track with ID {track_id}"
            )));
        };

        let trak = &moov.trak_boxes[track_index];
        trak.tkhd()?;
        trak.mdia()?.mdhd()?;
        let stbl = trak.stbl()?;
        stbl.check_mandatory_boxes()?;

        let (plan, data_end) =
            plan_track_fragment(stbl, traf, trex, track_index, moof_offset, cumulated_offset)?;
        cumulated_offset = data_end;
        plans.push(plan);
    }

    for plan in &plans {
        let added: u64 = plans
            .iter()
            .filter(|p| p.track_index == plan.track_index)
            .map(TrackFragmentPlan::sample_count)
            .sum();
        let current = moov.trak_boxes[plan.track_index].stbl()?.sample_count() as u64;
        if current + added > u32::MAX as u64 {
            return Err(Error::unsupported(format!(
                "Too many samples in track {} after merging the fragment",
                plan.track_id
            )));
        }
    }
    Ok(plans)
}

/// traf 一つ分のランの位置とサンプルを解決し、データの終端位置と共に返す
fn plan_track_fragment(
    stbl: &StblBox,
    traf: &TrafBox,
    trex: &TrexBox,
    track_index: usize,
    moof_offset: u64,
    cumulated_offset: u64,
) -> Result<(TrackFragmentPlan, u64)> {
    let tfhd = traf.tfhd()?;
    let mut defaults = TrackFragmentDefaults::resolve(trex, tfhd);
    defaults.sample_description_index =
        checked_description_index(stbl, defaults.sample_description_index)?;
    let description_index =
        NonZeroU32::new(defaults.sample_description_index).unwrap_or(NonZeroU32::MIN);

    let base_offset = match tfhd.base_data_offset {
        Some(offset) => offset,
        None if tfhd.default_base_is_moof => moof_offset,
        None => cumulated_offset,
    };

    let mut runs = try_vec_with_capacity(traf.trun_boxes.len())?;
    let mut data_end = base_offset;
    for trun in &traf.trun_boxes {
        let run_offset = match trun.data_offset {
            Some(offset) => base_offset.checked_add_signed(offset as i64).ok_or_else(|| {
                Error::invalid_file(format!(
                    "Run data offset {offset} points outside the 64-bit offset range"
                ))
            })?,
            None => data_end,
        };
        let samples = trun.resolve(&defaults)?;
        let data_size = trun.data_size(&defaults);
        data_end = run_offset.checked_add(data_size).ok_or_else(|| {
            Error::invalid_file(format!(
                "Run data at {run_offset} (+{data_size}) extends beyond the 64-bit offset range"
            ))
        })?;
        runs.push((run_offset, samples));
    }

    let plan = TrackFragmentPlan {
        track_index,
        track_id: tfhd.track_id,
        description_index,
        runs,
    };
    Ok((plan, data_end))
}

/// 解決済みのランを、一つずつチャンクとしてトラックに追加する
fn apply_track_fragment(trak: &mut TrakBox, plan: TrackFragmentPlan) -> Result<()> {
    let stbl = trak.stbl_mut()?;
    for (run_offset, samples) in plan.runs {
        for (i, sample) in samples.iter().enumerate() {
            let placement = if i == 0 {
                ChunkPlacement::NewChunk {
                    offset: run_offset,
                    description_index: plan.description_index,
                }
            } else {
                ChunkPlacement::CurrentChunk
            };
            stbl.append_sample(AppendSample {
                size: sample.size,
                duration: sample.duration,
                composition_offset: sample.composition_offset,
                is_sync: sample.is_sync,
                placement,
            })?;
        }
        tracing::trace!(
            track_id = plan.track_id,
            sample_count = samples.len(),
            run_offset,
            "merged track run"
        );
    }
    Ok(())
}

/// 存在しないサンプルエントリーを指す番号は 1 に補正する
fn checked_description_index(stbl: &StblBox, index: u32) -> Result<u32> {
    let entry_count = stbl.stsd()?.entries.len();
    if index == 0 || index as usize > entry_count {
        tracing::warn!(
            sample_description_index = index,
            entry_count,
            "broken sample description index in fragment, using 1"
        );
        return Ok(1);
    }
    Ok(index)
}

/// サンプルテーブルの内容からメディアとトラックの尺を再計算する
pub(crate) fn update_track_duration(trak: &mut TrakBox, movie_timescale: NonZeroU32) -> Result<()> {
    let media_duration = trak.stbl()?.stts()?.total_duration();
    let mdhd = trak.mdia_mut()?.mdhd_mut()?;
    mdhd.duration = media_duration;
    let media_timescale = mdhd.timescale;
    trak.tkhd_mut()?.duration = rescale(media_duration, media_timescale, movie_timescale);
    Ok(())
}

/// `value` の時間単位を `from` から `to` へ変換する
pub(crate) fn rescale(value: u64, from: NonZeroU32, to: NonZeroU32) -> u64 {
    let scaled = value as u128 * to.get() as u128 / from.get() as u128;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}
