//! ファイルフォーマットとは直接は関係がない、実装上便利な補助的なコンポーネントを集めたモジュール

use std::num::NonZeroU32;

use crate::{
    Result,
    boxes::{StblBox, StszBox},
    codec::try_vec_with_capacity,
    sample_table::Chunk,
};

/// [`StblBox`] をラップして、その中の情報を簡単かつ効率的に取り出せるようにするための構造体
///
/// 構築時に各テーブルを展開するため、以降の問い合わせは `&self` で行える。
/// [`StblBox`] のカーソルつきの問い合わせと異なり、複数のスレッドから同時に参照できる
#[derive(Debug)]
pub struct SampleTableAccessor<'a> {
    stbl_box: &'a StblBox,
    stsz_box: &'a StszBox,
    sample_count: u32,
    stts_table: Vec<(u64, u64, u32)>, // (先頭サンプルのインデックス、先頭サンプルのデコード時刻、尺）
    chunks: Vec<Chunk>,
    chunk_first_samples: Vec<u32>, // チャンクごとの先頭サンプルのインデックス
}

impl<'a> SampleTableAccessor<'a> {
    /// 引数で渡された [`StblBox`] 用の [`SampleTableAccessor`] インスタンスを生成する
    ///
    /// テーブル間の整合性が取れていない場合は [`ErrorKind::InvalidFile`](crate::ErrorKind::InvalidFile) となる
    pub fn new(stbl_box: &'a StblBox) -> Result<Self> {
        stbl_box.check_consistency()?;
        let stsz_box = stbl_box.stsz()?;
        let stts_box = stbl_box.stts()?;

        let mut stts_table = try_vec_with_capacity(stts_box.entries.len())?;
        let mut sample_index = 0;
        let mut decode_time = 0;
        for entry in stts_box.entries.iter().filter(|e| e.sample_count > 0) {
            stts_table.push((sample_index, decode_time, entry.sample_delta));
            sample_index += entry.sample_count as u64;
            decode_time += entry.sample_count as u64 * entry.sample_delta as u64;
        }

        let chunks = stbl_box.chunks()?;
        let mut chunk_first_samples = try_vec_with_capacity(chunks.len())?;
        let mut first_sample = 0;
        for chunk in &chunks {
            chunk_first_samples.push(first_sample);
            first_sample += chunk.sample_count;
        }

        Ok(Self {
            stbl_box,
            stsz_box,
            sample_count: stsz_box.sample_count(),
            stts_table,
            chunks,
            chunk_first_samples,
        })
    }

    /// 元となった [`StblBox`] を返す
    pub fn stbl_box(&self) -> &'a StblBox {
        self.stbl_box
    }

    /// トラック内のサンプルの数を取得する
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// トラック内のチャンクの数を取得する
    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// 指定されたサンプルにアクセスするためのオブジェクトを返す
    ///
    /// 存在しないサンプルが指定された場合には [`None`] が返される
    pub fn get_sample(&self, sample_number: NonZeroU32) -> Option<SampleAccessor<'_, 'a>> {
        (sample_number.get() <= self.sample_count).then_some(SampleAccessor {
            accessor: self,
            index: sample_number.get() - 1,
        })
    }

    /// 指定されたチャンクにアクセスするためのオブジェクトを返す
    ///
    /// 存在しないチャンクが指定された場合には [`None`] が返される
    pub fn get_chunk(&self, chunk_number: NonZeroU32) -> Option<ChunkAccessor<'_, 'a>> {
        let index = chunk_number.get() as usize - 1;
        (index < self.chunks.len()).then_some(ChunkAccessor {
            accessor: self,
            index,
        })
    }

    /// 全てのサンプルを先頭から順に走査するイテレーターを返す
    pub fn samples(&self) -> impl Iterator<Item = SampleAccessor<'_, 'a>> {
        (0..self.sample_count).map(|index| SampleAccessor {
            accessor: self,
            index,
        })
    }

    /// 全てのチャンクを先頭から順に走査するイテレーターを返す
    pub fn chunks(&self) -> impl Iterator<Item = ChunkAccessor<'_, 'a>> {
        (0..self.chunks.len()).map(|index| ChunkAccessor {
            accessor: self,
            index,
        })
    }

    /// 指定されたデコード時刻を含むサンプルを返す
    ///
    /// 最後のサンプルの終端以降の時刻が指定された場合には [`None`] が返される
    pub fn sample_at_time(&self, decode_time: u64) -> Option<SampleAccessor<'_, 'a>> {
        let i = self
            .stts_table
            .partition_point(|&(_, start, _)| start <= decode_time)
            .checked_sub(1)?;
        let (first, start, delta) = self.stts_table[i];
        let run_end = self
            .stts_table
            .get(i + 1)
            .map_or(self.sample_count as u64, |next| next.0);
        let offset = match delta {
            0 => 0,
            _ => (decode_time - start) / delta as u64,
        };
        let index = first + offset;
        if index >= run_end {
            return None;
        }
        self.get_sample(NonZeroU32::new(index as u32 + 1)?)
    }

    fn stts_run(&self, index: u32) -> (u64, u32) {
        let i = self
            .stts_table
            .partition_point(|&(first, _, _)| first <= index as u64)
            .saturating_sub(1);
        match self.stts_table.get(i) {
            Some(&(first, start, delta)) => (start + (index as u64 - first) * delta as u64, delta),
            None => (0, 0),
        }
    }

    fn chunk_index_of(&self, index: u32) -> usize {
        self.chunk_first_samples
            .partition_point(|&first| first <= index)
            .saturating_sub(1)
    }
}

/// トラック内の個々のサンプルの情報を取得するための構造体
#[derive(Debug, Clone, Copy)]
pub struct SampleAccessor<'a, 'b> {
    accessor: &'a SampleTableAccessor<'b>,
    index: u32,
}

impl<'a, 'b> SampleAccessor<'a, 'b> {
    /// サンプルの番号（1 始まり）
    pub fn sample_number(&self) -> NonZeroU32 {
        NonZeroU32::MIN.saturating_add(self.index)
    }

    /// サンプルのデータサイズ（バイト数）
    pub fn data_size(&self) -> u32 {
        self.accessor.stsz_box.sample_size(self.index).unwrap_or(0)
    }

    /// サンプルの尺
    pub fn duration(&self) -> u32 {
        self.accessor.stts_run(self.index).1
    }

    /// サンプルのデコード時刻
    pub fn decode_time(&self) -> u64 {
        self.accessor.stts_run(self.index).0
    }

    /// サンプルのコンポジションオフセット
    pub fn composition_offset(&self) -> i64 {
        self.accessor
            .stbl_box
            .composition_offset(self.index + 1)
            .unwrap_or(0)
    }

    /// 同期サンプルかどうか
    pub fn is_sync_sample(&self) -> bool {
        self.accessor
            .stbl_box
            .is_sync_sample(self.index + 1)
            .unwrap_or(true)
    }

    /// サンプルが属するチャンク
    pub fn chunk(&self) -> ChunkAccessor<'a, 'b> {
        ChunkAccessor {
            accessor: self.accessor,
            index: self.accessor.chunk_index_of(self.index),
        }
    }

    /// サンプルのデータのファイル内でのバイト位置
    pub fn data_offset(&self) -> u64 {
        let chunk = self.chunk();
        let first = self.accessor.chunk_first_samples[chunk.index];
        (first..self.index).fold(chunk.offset(), |offset, i| {
            offset + self.accessor.stsz_box.sample_size(i).unwrap_or(0) as u64
        })
    }

    /// サンプルが参照するサンプルエントリーの番号（1 始まり）
    pub fn sample_description_index(&self) -> NonZeroU32 {
        self.chunk().sample_description_index()
    }
}

/// トラック内の個々のチャンクの情報を取得するための構造体
#[derive(Debug, Clone, Copy)]
pub struct ChunkAccessor<'a, 'b> {
    accessor: &'a SampleTableAccessor<'b>,
    index: usize,
}

impl<'a, 'b> ChunkAccessor<'a, 'b> {
    /// チャンクの番号（1 始まり）
    pub fn chunk_number(&self) -> NonZeroU32 {
        NonZeroU32::MIN.saturating_add(self.index as u32)
    }

    /// チャンクのファイル内でのバイト位置
    pub fn offset(&self) -> u64 {
        self.accessor.chunks[self.index].offset
    }

    /// チャンク内のサンプルの数
    pub fn sample_count(&self) -> u32 {
        self.accessor.chunks[self.index].sample_count
    }

    /// チャンク内のサンプルが参照するサンプルエントリーの番号
    pub fn sample_description_index(&self) -> NonZeroU32 {
        self.accessor.chunks[self.index].description_index
    }

    /// チャンク内のサンプルを先頭から順に走査するイテレーターを返す
    pub fn samples(&self) -> impl Iterator<Item = SampleAccessor<'a, 'b>> + use<'a, 'b> {
        let accessor = self.accessor;
        let first = accessor.chunk_first_samples[self.index];
        (first..first + self.sample_count()).map(move |index| SampleAccessor { accessor, index })
    }
}
