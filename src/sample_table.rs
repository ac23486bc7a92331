//! サンプルテーブル (stbl) に対する、サンプル番号単位の問い合わせと編集操作
//!
//! サンプル番号とチャンク番号は、ファイルフォーマットと同様に 1 始まりで指定する。
//! stts / stsc を参照する問い合わせはテーブルごとの読み取り位置を利用するため `&mut self` を要求する。
//! 木全体を共有したまま参照したい場合は [`SampleTableAccessor`](crate::aux::SampleTableAccessor) を使うこと
use std::num::NonZeroU32;

use crate::{
    ContainerBox, Error, Result,
    boxes::{ChunkOffsetBox, CttsBox, StblBox, StscBox, StssBox, with_box_type},
    codec::{entry_count_u32, try_push, try_vec_with_capacity},
};

/// [`StblBox::sample_to_chunk()`] の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleChunk {
    /// サンプルを含むチャンクの番号（1 始まり）
    pub chunk: u32,

    /// チャンクの先頭サンプルの番号（1 始まり）
    pub first_sample: u32,

    /// チャンク内のサンプルが参照するサンプルエントリーの番号（1 始まり）
    pub description_index: NonZeroU32,
}

/// チャンク一つ分の配置情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Chunk {
    pub offset: u64,
    pub sample_count: u32,
    pub description_index: NonZeroU32,
}

/// 追加するサンプルをどのチャンクに置くか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPlacement {
    /// 指定された位置から始まる新しいチャンクの先頭に置く
    #[allow(missing_docs)]
    NewChunk {
        offset: u64,
        description_index: NonZeroU32,
    },

    /// 最後のチャンクの末尾に置く
    CurrentChunk,
}

/// [`StblBox::append_sample()`] に渡すサンプルの情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AppendSample {
    pub size: u32,
    pub duration: u32,
    pub composition_offset: i64,
    pub is_sync: bool,
    pub placement: ChunkPlacement,
}

impl StblBox {
    /// サンプルの総数 (stsz が存在しない場合は 0)
    pub fn sample_count(&self) -> u32 {
        self.stsz_box.as_ref().map_or(0, |b| b.sample_count())
    }

    /// チャンクの総数 (stco / co64 が存在しない場合は 0)
    pub fn chunk_count(&self) -> u32 {
        self.chunk_offset_box
            .as_ref()
            .map_or(0, |b| u32::try_from(b.offsets.len()).unwrap_or(u32::MAX))
    }

    /// 指定されたサンプルのサイズを返す
    pub fn sample_size(&self, sample_number: u32) -> Option<u32> {
        let index = sample_number.checked_sub(1)?;
        self.stsz_box.as_ref()?.sample_size(index)
    }

    /// 指定されたサンプルのデコード時刻を返す
    pub fn decode_time(&mut self, sample_number: u32) -> Option<u64> {
        self.stts_lookup(sample_number).map(|(time, _)| time)
    }

    /// 指定されたサンプルの尺を返す
    pub fn sample_duration(&mut self, sample_number: u32) -> Option<u32> {
        self.stts_lookup(sample_number).map(|(_, delta)| delta)
    }

    /// 指定されたサンプルのコンポジションオフセットを返す (ctts が存在しない場合は 0)
    pub fn composition_offset(&self, sample_number: u32) -> Option<i64> {
        let index = self.sample_index(sample_number)?;
        match &self.ctts_box {
            Some(ctts) => ctts.sample_offset(index as u64),
            None => Some(0),
        }
    }

    /// 指定されたサンプルが同期サンプルかどうかを返す (stss が存在しない場合は常に `true`)
    pub fn is_sync_sample(&self, sample_number: u32) -> Option<bool> {
        self.sample_index(sample_number)?;
        Some(
            self.stss_box
                .as_ref()
                .is_none_or(|stss| stss.contains(sample_number)),
        )
    }

    /// 指定されたサンプルを含むチャンクを求める
    pub fn sample_to_chunk(&mut self, sample_number: u32) -> Option<SampleChunk> {
        let index = self.sample_index(sample_number)?;
        let chunk_count = self.chunk_count();
        let (chunk, first_sample, entry) = self.stsc_box.as_mut()?.lookup(index as u64)?;
        if chunk > chunk_count {
            return None;
        }
        Some(SampleChunk {
            chunk,
            first_sample: u32::try_from(first_sample + 1).ok()?,
            description_index: entry.sample_description_index,
        })
    }

    /// 指定されたサンプルのデータのファイル内での位置を返す
    pub fn sample_offset(&mut self, sample_number: u32) -> Option<u64> {
        let chunk = self.sample_to_chunk(sample_number)?;
        let stsz = self.stsz_box.as_ref()?;
        let mut offset = *self
            .chunk_offset_box
            .as_ref()?
            .offsets
            .get(chunk.chunk as usize - 1)?;
        for i in chunk.first_sample - 1..sample_number - 1 {
            offset = offset.checked_add(stsz.sample_size(i)? as u64)?;
        }
        Some(offset)
    }

    /// 現在のチャンク配置を返す
    pub fn chunks(&self) -> Result<Vec<Chunk>> {
        let offsets = &self.chunk_offsets()?.offsets;
        let chunk_count = entry_count_u32(offsets.len(), "chunk offset")?;
        let sizes = self.stsc()?.chunk_sizes(chunk_count)?;
        let mut chunks = try_vec_with_capacity(offsets.len())?;
        for (&offset, (sample_count, description_index)) in offsets.iter().zip(sizes) {
            chunks.push(Chunk {
                offset,
                sample_count,
                description_index,
            });
        }
        Ok(chunks)
    }

    /// 末尾にサンプルを一つ追加する
    ///
    /// 必要に応じて ctts や stss が作成される。
    /// sdtp / stdp / padb が存在する場合は、既定値のエントリーが追加される
    pub fn append_sample(&mut self, sample: AppendSample) -> Result<()> {
        with_box_type(Self::TYPE, || {
            self.check_mandatory_boxes()?;
            let count = self.sample_count();
            let sample_number = count
                .checked_add(1)
                .ok_or_else(|| Error::unsupported("Too many samples in a track"))?;

            match sample.placement {
                ChunkPlacement::NewChunk {
                    offset,
                    description_index,
                } => {
                    let chunk_offsets = self.chunk_offsets_mut()?;
                    try_push(&mut chunk_offsets.offsets, offset)?;
                    let chunk_count = entry_count_u32(chunk_offsets.offsets.len(), "chunk offset")?;
                    self.stsc_mut()?
                        .push_chunk(chunk_count, 1, description_index);
                }
                ChunkPlacement::CurrentChunk => {
                    let chunk_count = self.chunk_count();
                    self.stsc_mut()?.grow_last_chunk(chunk_count)?;
                }
            }

            self.stsz_mut()?.push(sample.size)?;
            self.stts_mut()?.push(sample.duration);

            if self.ctts_box.is_none() && sample.composition_offset != 0 {
                self.ctts_box = Some(CttsBox::from_sample_offsets(std::iter::repeat_n(
                    0,
                    count as usize,
                )));
            }
            if let Some(ctts) = &mut self.ctts_box {
                ctts.push(sample.composition_offset);
            }

            if self.stss_box.is_none() && !sample.is_sync {
                let mut sample_numbers = try_vec_with_capacity(count as usize)?;
                sample_numbers.extend(1..sample_number);
                self.stss_box = Some(StssBox { sample_numbers });
            }
            if let Some(stss) = &mut self.stss_box
                && sample.is_sync
            {
                try_push(&mut stss.sample_numbers, sample_number)?;
            }

            if let Some(sdtp) = &mut self.sdtp_box {
                let depends_on = if sample.is_sync { 2 } else { 1 };
                try_push(&mut sdtp.entries, depends_on << 4)?;
            }
            if let Some(stdp) = &mut self.stdp_box {
                try_push(&mut stdp.priorities, 0)?;
            }
            if let Some(padb) = &mut self.padb_box {
                try_push(&mut padb.pads, 0)?;
            }

            self.reset_cursors();
            Ok(())
        })
    }

    /// 指定されたサンプルを取り除く
    ///
    /// 残りのサンプルのファイル内での位置が変わらないように、サンプルを含むチャンクは縮小または分割される
    pub fn remove_sample(&mut self, sample_number: u32) -> Result<()> {
        with_box_type(Self::TYPE, || {
            self.check_mandatory_boxes()?;
            let Some(index) = self.sample_index(sample_number) else {
                return Err(Error::invalid_input(format!(
                    "Sample #{sample_number} does not exist"
                )));
            };

            let chunks = self.chunks_without_sample(sample_number)?;

            self.stsz_mut()?.remove(index);
            self.stts_mut()?.remove(index as u64);
            if let Some(ctts) = &mut self.ctts_box {
                ctts.remove(index as u64);
            }
            if let Some(stss) = &mut self.stss_box {
                stss.sample_numbers.retain(|&n| n != sample_number);
                renumber(stss.sample_numbers.iter_mut(), sample_number);
            }
            if let Some(stsh) = &mut self.stsh_box {
                stsh.entries.retain(|e| {
                    e.shadowed_sample_number != sample_number
                        && e.sync_sample_number != sample_number
                });
                for e in &mut stsh.entries {
                    renumber(
                        [&mut e.shadowed_sample_number, &mut e.sync_sample_number],
                        sample_number,
                    );
                }
            }
            if let Some(stsf) = &mut self.stsf_box {
                stsf.entries.retain(|e| e.sample_number != sample_number);
                renumber(stsf.entries.iter_mut().map(|e| &mut e.sample_number), sample_number);
            }
            remove_index(self.stdp_box.as_mut().map(|b| &mut b.priorities), index);
            remove_index(self.sdtp_box.as_mut().map(|b| &mut b.entries), index);
            remove_index(self.padb_box.as_mut().map(|b| &mut b.pads), index);

            self.rechunk(&chunks)
        })
    }

    /// チャンク配置を置き換える
    ///
    /// 各チャンクのサンプル数の合計は、現在のサンプル総数と一致している必要がある
    pub fn rechunk(&mut self, chunks: &[Chunk]) -> Result<()> {
        with_box_type(Self::TYPE, || {
            let total: u64 = chunks.iter().map(|c| c.sample_count as u64).sum();
            if total != self.sample_count() as u64 {
                return Err(Error::invalid_input(format!(
                    "Chunks hold {total} samples, but the track has {}",
                    self.sample_count()
                )));
            }
            if let Some(i) = chunks.iter().position(|c| c.sample_count == 0) {
                return Err(Error::invalid_input(format!("Chunk #{} is empty", i + 1)));
            }

            let mut offsets = try_vec_with_capacity(chunks.len())?;
            offsets.extend(chunks.iter().map(|c| c.offset));
            self.chunk_offset_box = Some(ChunkOffsetBox { offsets });
            self.stsc_box = Some(StscBox::from_chunk_sizes(
                chunks.iter().map(|c| (c.sample_count, c.description_index)),
            ));
            self.reset_cursors();
            tracing::trace!(chunk_count = chunks.len(), "sample table rechunked");
            Ok(())
        })
    }

    /// テーブル間の整合性を確認する
    ///
    /// - stts (と ctts) のサンプル数の合計が stsz のサンプル数と一致する
    /// - stss のサンプル番号が昇順で、サンプル数を超えない
    /// - stsc の範囲が全チャンクを隙間なく覆い、チャンク内のサンプル数の合計がサンプル数と一致する
    ///
    /// 満たされない場合は [`ErrorKind::InvalidFile`](crate::ErrorKind::InvalidFile) エラーとなる
    pub fn check_consistency(&self) -> Result<()> {
        with_box_type(Self::TYPE, || {
            self.check_mandatory_boxes()?;
            let sample_count = self.sample_count() as u64;

            let stts_count = self.stts()?.sample_count();
            if stts_count != sample_count {
                return Err(Error::invalid_file(format!(
                    "stts covers {stts_count} samples, but stsz has {sample_count}"
                )));
            }
            if let Some(ctts) = &self.ctts_box
                && ctts.sample_count() != sample_count
            {
                return Err(Error::invalid_file(format!(
                    "ctts covers {} samples, but stsz has {sample_count}",
                    ctts.sample_count()
                )));
            }
            if let Some(stss) = &self.stss_box {
                let mut prev = 0;
                for &n in &stss.sample_numbers {
                    if n <= prev || n as u64 > sample_count {
                        return Err(Error::invalid_file(format!(
                            "Invalid sync sample number {n} (previous {prev}, sample count {sample_count})"
                        )));
                    }
                    prev = n;
                }
            }

            let covered: u64 = self
                .chunks()?
                .iter()
                .map(|c| c.sample_count as u64)
                .sum();
            if covered != sample_count {
                return Err(Error::invalid_file(format!(
                    "Chunks hold {covered} samples, but stsz has {sample_count}"
                )));
            }
            Ok(())
        })
    }

    fn reset_cursors(&mut self) {
        if let Some(stts) = &mut self.stts_box {
            stts.reset_cursor();
        }
        if let Some(stsc) = &mut self.stsc_box {
            stsc.reset_cursor();
        }
    }

    fn sample_index(&self, sample_number: u32) -> Option<u32> {
        let index = sample_number.checked_sub(1)?;
        (index < self.sample_count()).then_some(index)
    }

    fn stts_lookup(&mut self, sample_number: u32) -> Option<(u64, u32)> {
        let index = self.sample_index(sample_number)?;
        self.stts_box.as_mut()?.lookup(index as u64)
    }

    /// 指定されたサンプルを除いた後のチャンク配置を求める
    fn chunks_without_sample(&mut self, sample_number: u32) -> Result<Vec<Chunk>> {
        let mut chunks = self.chunks()?;
        let location = self.sample_to_chunk(sample_number).ok_or_else(|| {
            Error::invalid_file(format!("Sample #{sample_number} is not in any chunk"))
        })?;
        let stsz = self.stsz()?;
        let size_of = |n: u32| {
            stsz.sample_size(n - 1)
                .map(u64::from)
                .ok_or_else(|| Error::invalid_file(format!("Sample #{n} has no size")))
        };

        let i = location.chunk as usize - 1;
        let chunk = chunks[i];
        let before = sample_number - location.first_sample;
        let after = chunk.sample_count - before - 1;

        let mut tail_offset = chunk.offset;
        for n in location.first_sample..=sample_number {
            tail_offset += size_of(n)?;
        }
        let head = Chunk {
            sample_count: before,
            ..chunk
        };
        let tail = Chunk {
            offset: tail_offset,
            sample_count: after,
            ..chunk
        };
        chunks.remove(i);
        for c in [tail, head] {
            if c.sample_count > 0 {
                chunks.insert(i, c);
            }
        }
        Ok(chunks)
    }
}

impl StscBox {
    /// 最後のチャンク (`chunk_count` 番目) のサンプル数を一つ増やす
    pub(crate) fn grow_last_chunk(&mut self, chunk_count: u32) -> Result<()> {
        let Some(last) = self.entries.last().copied() else {
            return Err(Error::invalid_input(
                "Cannot append to the current chunk of a track without chunks",
            ));
        };
        if last.first_chunk.get() > chunk_count {
            return Err(Error::invalid_file(format!(
                "The last stsc entry starts at chunk {}, but there are only {chunk_count} chunks",
                last.first_chunk
            )));
        }
        let samples_per_chunk = last
            .samples_per_chunk
            .checked_add(1)
            .ok_or_else(|| Error::unsupported("Too many samples in a chunk"))?;
        if last.first_chunk.get() == chunk_count {
            self.entries.pop();
        }
        self.push_chunk(chunk_count, samples_per_chunk, last.sample_description_index);
        Ok(())
    }
}

/// `removed` より大きいサンプル番号を一つずつ詰める
fn renumber<'a, I>(numbers: I, removed: u32)
where
    I: IntoIterator<Item = &'a mut u32>,
{
    for n in numbers {
        if *n > removed {
            *n -= 1;
        }
    }
}

fn remove_index<T>(entries: Option<&mut Vec<T>>, index: u32) {
    if let Some(entries) = entries
        && (index as usize) < entries.len()
    {
        entries.remove(index as usize);
    }
}
