//! サンプルテーブル（stbl）とその子ボックスの定義
//!
//! テーブルの表現形式（stsz / stz2 、 stco / co64）は、エンコードのたびに
//! 現在の値から純粋関数 [`choose_width()`] と [`choose_offset_box()`] で決定される
use std::num::NonZeroU32;

use crate::{
    BaseBox, BoxHeader, BoxType, ContainerBox, Decode, Encode, Error, ErrorKind, FullBox,
    FullBoxFlags, FullBoxHeader, Result,
    basic_types::as_box_object,
    boxes::{
        AnyBox, PadbBox, SdtpBox, StdpBox, StsfBox, StshBox, box_size, check_mandatory_box,
        copy_payload, decode_container, encode_all, encode_box, note_trailing_bytes, required,
        required_mut, route_other_box, set_singleton, sum_sizes, with_box_type,
    },
    codec::{decode_entries, entry_count_u32, try_push, try_vec_with_capacity},
};

/// ランレングス形式のテーブル（stts / stsc）上の読み取り位置
///
/// 前方向への連続したアクセスはこの位置から走査を再開し、
/// 後方へのシークは各エントリーの開始位置の索引を二分探索する
#[derive(Debug, Default, Clone)]
pub(crate) struct RunCursor {
    entry: usize,
    first_sample: u64,
    base: u64,
    starts: Vec<(u64, u64)>,
}

impl RunCursor {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// 0 始まりのサンプルインデックス `index` を含むエントリーを探す
    ///
    /// `span(i)` は i 番目のエントリーが含むサンプル数と、そのエントリー全体での累積値の増分を返す。
    /// 結果は `(エントリー位置, エントリー先頭のサンプルインデックス, エントリー先頭での累積値)`
    pub(crate) fn seek<F>(
        &mut self,
        index: u64,
        entry_count: usize,
        span: F,
    ) -> Option<(usize, u64, u64)>
    where
        F: Fn(usize) -> (u64, u64),
    {
        if entry_count == 0 {
            return None;
        }
        if self.entry >= entry_count || index < self.first_sample {
            self.seek_from_start(index, entry_count, &span);
        }
        while self.entry < entry_count {
            let (samples, advance) = span(self.entry);
            if index < self.first_sample.saturating_add(samples) {
                return Some((self.entry, self.first_sample, self.base));
            }
            self.entry += 1;
            self.first_sample = self.first_sample.saturating_add(samples);
            self.base = self.base.saturating_add(advance);
        }
        None
    }

    fn seek_from_start<F>(&mut self, index: u64, entry_count: usize, span: &F)
    where
        F: Fn(usize) -> (u64, u64),
    {
        if self.starts.len() != entry_count {
            self.starts.clear();
            let (mut first, mut base) = (0u64, 0u64);
            for i in 0..entry_count {
                self.starts.push((first, base));
                let (samples, advance) = span(i);
                first = first.saturating_add(samples);
                base = base.saturating_add(advance);
            }
        }
        let i = self
            .starts
            .partition_point(|&(first, _)| first <= index)
            .saturating_sub(1);
        self.entry = i;
        (self.first_sample, self.base) = self.starts[i];
    }
}

// 読み取り位置はテーブルの内容ではないので、比較では常に等しいとみなす
impl PartialEq for RunCursor {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for RunCursor {}

/// [ISO/IEC 14496-12] SampleTableBox class (親: [`MinfBox`](crate::boxes::MinfBox))
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StblBox {
    pub stsd_box: Option<StsdBox>,
    pub stts_box: Option<SttsBox>,
    pub ctts_box: Option<CttsBox>,
    pub stss_box: Option<StssBox>,
    pub stsc_box: Option<StscBox>,
    pub stsz_box: Option<StszBox>,
    pub chunk_offset_box: Option<ChunkOffsetBox>,
    pub stsh_box: Option<StshBox>,
    pub stdp_box: Option<StdpBox>,
    pub sdtp_box: Option<SdtpBox>,
    pub padb_box: Option<PadbBox>,
    pub stsf_box: Option<StsfBox>,
    pub other_boxes: Vec<AnyBox>,
}

impl StblBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stbl");

    /// サンプルを一つも含まない、必須の子ボックスが全て揃ったサンプルテーブルを作成する
    pub fn new(sample_entry: SampleEntry) -> Self {
        Self {
            stsd_box: Some(StsdBox {
                entries: vec![sample_entry],
            }),
            stts_box: Some(SttsBox::default()),
            stsc_box: Some(StscBox::default()),
            stsz_box: Some(StszBox::default()),
            chunk_offset_box: Some(ChunkOffsetBox::default()),
            ..Default::default()
        }
    }

    /// stsd ボックスへの参照を返す
    pub fn stsd(&self) -> Result<&StsdBox> {
        required(&self.stsd_box, StsdBox::TYPE, Self::TYPE)
    }

    /// stts ボックスへの参照を返す
    pub fn stts(&self) -> Result<&SttsBox> {
        required(&self.stts_box, SttsBox::TYPE, Self::TYPE)
    }

    /// stts ボックスへの可変参照を返す
    pub fn stts_mut(&mut self) -> Result<&mut SttsBox> {
        required_mut(&mut self.stts_box, SttsBox::TYPE, Self::TYPE)
    }

    /// stsc ボックスへの参照を返す
    pub fn stsc(&self) -> Result<&StscBox> {
        required(&self.stsc_box, StscBox::TYPE, Self::TYPE)
    }

    /// stsc ボックスへの可変参照を返す
    pub fn stsc_mut(&mut self) -> Result<&mut StscBox> {
        required_mut(&mut self.stsc_box, StscBox::TYPE, Self::TYPE)
    }

    /// stsz (または stz2) ボックスへの参照を返す
    pub fn stsz(&self) -> Result<&StszBox> {
        required(&self.stsz_box, StszBox::TYPE, Self::TYPE)
    }

    /// stsz (または stz2) ボックスへの可変参照を返す
    pub fn stsz_mut(&mut self) -> Result<&mut StszBox> {
        required_mut(&mut self.stsz_box, StszBox::TYPE, Self::TYPE)
    }

    /// stco (または co64) ボックスへの参照を返す
    pub fn chunk_offsets(&self) -> Result<&ChunkOffsetBox> {
        required(&self.chunk_offset_box, ChunkOffsetBox::STCO_TYPE, Self::TYPE)
    }

    /// stco (または co64) ボックスへの可変参照を返す
    pub fn chunk_offsets_mut(&mut self) -> Result<&mut ChunkOffsetBox> {
        required_mut(
            &mut self.chunk_offset_box,
            ChunkOffsetBox::STCO_TYPE,
            Self::TYPE,
        )
    }

    fn warn_on_inferred_counts(&self) {
        let Some(stsz) = &self.stsz_box else {
            return;
        };
        let sample_count = stsz.sample_count() as usize;
        if let Some(stdp) = &self.stdp_box
            && stdp.priorities.len() != sample_count
        {
            tracing::warn!(
                inferred = stdp.priorities.len(),
                sample_count,
                "stdp entry count inferred from box size differs from stsz"
            );
        }
        if let Some(sdtp) = &self.sdtp_box
            && sdtp.entries.len() != sample_count
        {
            tracing::warn!(
                inferred = sdtp.entries.len(),
                sample_count,
                "sdtp entry count inferred from box size differs from stsz"
            );
        }
    }

    fn payload_size(&self) -> Result<usize> {
        self.check_mandatory_boxes()?;
        Ok(sum_sizes(&self.stsd_box)?
            + sum_sizes(&self.stts_box)?
            + sum_sizes(&self.ctts_box)?
            + sum_sizes(&self.stss_box)?
            + sum_sizes(&self.stsc_box)?
            + sum_sizes(&self.stsz_box)?
            + sum_sizes(&self.chunk_offset_box)?
            + sum_sizes(&self.stsh_box)?
            + sum_sizes(&self.stdp_box)?
            + sum_sizes(&self.sdtp_box)?
            + sum_sizes(&self.padb_box)?
            + sum_sizes(&self.stsf_box)?
            + sum_sizes(&self.other_boxes)?)
    }
}

impl Encode for StblBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = 0;
            offset += encode_all(&self.stsd_box, &mut buf[offset..])?;
            offset += encode_all(&self.stts_box, &mut buf[offset..])?;
            offset += encode_all(&self.ctts_box, &mut buf[offset..])?;
            offset += encode_all(&self.stss_box, &mut buf[offset..])?;
            offset += encode_all(&self.stsc_box, &mut buf[offset..])?;
            offset += encode_all(&self.stsz_box, &mut buf[offset..])?;
            offset += encode_all(&self.chunk_offset_box, &mut buf[offset..])?;
            offset += encode_all(&self.stsh_box, &mut buf[offset..])?;
            offset += encode_all(&self.stdp_box, &mut buf[offset..])?;
            offset += encode_all(&self.sdtp_box, &mut buf[offset..])?;
            offset += encode_all(&self.padb_box, &mut buf[offset..])?;
            offset += encode_all(&self.stsf_box, &mut buf[offset..])?;
            offset += encode_all(&self.other_boxes, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for StblBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (this, size): (Self, usize) = decode_container(Self::TYPE, buf)?;
        this.warn_on_inferred_counts();
        Ok((this, size))
    }
}

impl BaseBox for StblBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::empty()
                .chain(self.stsd_box.iter().map(as_box_object))
                .chain(self.stts_box.iter().map(as_box_object))
                .chain(self.ctts_box.iter().map(as_box_object))
                .chain(self.stss_box.iter().map(as_box_object))
                .chain(self.stsc_box.iter().map(as_box_object))
                .chain(self.stsz_box.iter().map(as_box_object))
                .chain(self.chunk_offset_box.iter().map(as_box_object))
                .chain(self.stsh_box.iter().map(as_box_object))
                .chain(self.stdp_box.iter().map(as_box_object))
                .chain(self.sdtp_box.iter().map(as_box_object))
                .chain(self.padb_box.iter().map(as_box_object))
                .chain(self.stsf_box.iter().map(as_box_object))
                .chain(self.other_boxes.iter().map(as_box_object)),
        )
    }
}

impl ContainerBox for StblBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[
        StsdBox::TYPE,
        SttsBox::TYPE,
        StscBox::TYPE,
        StszBox::TYPE,
        StszBox::COMPACT_TYPE,
        ChunkOffsetBox::STCO_TYPE,
        ChunkOffsetBox::CO64_TYPE,
    ];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        match child {
            AnyBox::Stsd(b) => set_singleton(&mut self.stsd_box, b, Self::TYPE),
            AnyBox::Stts(b) => set_singleton(&mut self.stts_box, b, Self::TYPE),
            AnyBox::Ctts(b) => set_singleton(&mut self.ctts_box, b, Self::TYPE),
            AnyBox::Stss(b) => set_singleton(&mut self.stss_box, b, Self::TYPE),
            AnyBox::Stsc(b) => set_singleton(&mut self.stsc_box, b, Self::TYPE),
            AnyBox::Stsz(b) => set_singleton(&mut self.stsz_box, b, Self::TYPE),
            AnyBox::ChunkOffset(b) => set_singleton(&mut self.chunk_offset_box, b, Self::TYPE),
            AnyBox::Stsh(b) => set_singleton(&mut self.stsh_box, b, Self::TYPE),
            AnyBox::Stdp(b) => set_singleton(&mut self.stdp_box, b, Self::TYPE),
            AnyBox::Sdtp(b) => set_singleton(&mut self.sdtp_box, b, Self::TYPE),
            AnyBox::Padb(b) => set_singleton(&mut self.padb_box, b, Self::TYPE),
            AnyBox::Stsf(b) => set_singleton(&mut self.stsf_box, b, Self::TYPE),
            other => route_other_box(&mut self.other_boxes, other, Self::TYPE),
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        check_mandatory_box(&self.stsd_box, StsdBox::TYPE, Self::TYPE)?;
        check_mandatory_box(&self.stts_box, SttsBox::TYPE, Self::TYPE)?;
        check_mandatory_box(&self.stsc_box, StscBox::TYPE, Self::TYPE)?;
        check_mandatory_box(&self.stsz_box, StszBox::TYPE, Self::TYPE)?;
        check_mandatory_box(&self.chunk_offset_box, ChunkOffsetBox::STCO_TYPE, Self::TYPE)
    }
}

/// [`StsdBox`] に含まれるサンプルエントリー
///
/// コーデック固有の部分は解釈せずにバイト列として保持する
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEntry {
    /// サンプルエントリーの種別（`avc1`、`mp4a` など）
    pub box_type: BoxType,

    /// このエントリーのデータが格納されている場所を示す、 dref 内のエントリーの番号（1 始まり）
    pub data_reference_index: u16,

    /// 共通部分（予約領域と `data_reference_index`）より後ろのバイト列
    pub body: Vec<u8>,
}

impl SampleEntry {
    fn payload_size(&self) -> usize {
        6 + 2 + self.body.len()
    }
}

impl Encode for SampleEntry {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(self.box_type, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(self.box_type, self.payload_size(), buf, |buf| {
            let mut offset = [0u8; 6].encode(buf)?;
            offset += self.data_reference_index.encode(&mut buf[offset..])?;
            offset += self.body.encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for SampleEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
        with_box_type(header.box_type, || {
            let mut offset = 0;
            let _ = <[u8; 6]>::decode_at(payload, &mut offset)?;
            let data_reference_index = u16::decode_at(payload, &mut offset)?;
            let body = copy_payload(&payload[offset..])?;
            Ok((
                Self {
                    box_type: header.box_type,
                    data_reference_index,
                    body,
                },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for SampleEntry {
    fn box_type(&self) -> BoxType {
        self.box_type
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

/// [ISO/IEC 14496-12] SampleDescriptionBox class (親: [`StblBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StsdBox {
    pub entries: Vec<SampleEntry>,
}

impl StsdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stsd");

    fn payload_size(&self) -> Result<usize> {
        Ok(4 + 4 + sum_sizes(&self.entries)?)
    }
}

impl Encode for StsdBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let count = entry_count_u32(self.entries.len(), "stsd")?;
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += count.encode(&mut buf[offset..])?;
            offset += encode_all(&self.entries, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for StsdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let entry_count = u32::decode_at(payload, &mut offset)?;

            // 一エントリーは最低でもヘッダーと共通部分の 16 バイトを占める
            let mut entries = try_vec_with_capacity(
                (entry_count as usize).min((payload.len() - offset) / 16),
            )?;
            for _ in 0..entry_count {
                let (child_header, _) = BoxHeader::decode(&payload[offset..])?;
                let declared = child_header.box_size.get();
                let remaining = payload.len() - offset;
                if declared != 0 && declared > remaining as u64 {
                    return Err(Error::invalid_file(format!(
                        "Sample entry '{}' declares {declared} bytes, but only {remaining} bytes remain",
                        child_header.box_type
                    )));
                }
                try_push(&mut entries, SampleEntry::decode_at(payload, &mut offset)?)?;
            }
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((Self { entries }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for StsdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(self.entries.iter().map(as_box_object))
    }
}

impl FullBox for StsdBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [`SttsBox`] が保持するエントリー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

/// [ISO/IEC 14496-12] TimeToSampleBox class (親: [`StblBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SttsBox {
    /// `(サンプル数, 尺)` のエントリー群
    ///
    /// 直接変更した場合は [`SttsBox::reset_cursor()`] を呼び出す必要がある
    pub entries: Vec<SttsEntry>,
    pub(crate) cursor: RunCursor,
}

impl SttsBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stts");

    /// エントリー群から [`SttsBox`] を作成する
    pub fn new(entries: Vec<SttsEntry>) -> Self {
        Self {
            entries,
            cursor: RunCursor::default(),
        }
    }

    /// サンプル群の尺を走査するイテレーターを受け取って、対応する [`SttsBox`] インスタンスを作成する
    pub fn from_sample_deltas<I>(sample_deltas: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        let mut this = Self::default();
        for sample_delta in sample_deltas {
            this.push(sample_delta);
        }
        this
    }

    /// 各サンプルの尺を先頭から順に返すイテレーターを作成する
    pub fn sample_deltas(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .iter()
            .flat_map(|e| std::iter::repeat_n(e.sample_delta, e.sample_count as usize))
    }

    /// テーブルが表すサンプルの総数
    pub fn sample_count(&self) -> u64 {
        self.entries.iter().map(|e| e.sample_count as u64).sum()
    }

    /// 全サンプルの尺の合計
    pub fn total_duration(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.sample_count as u64 * e.sample_delta as u64)
            .sum()
    }

    /// 読み取り位置をテーブルの先頭に戻す
    pub fn reset_cursor(&mut self) {
        self.cursor.reset();
    }

    /// 末尾にサンプルを一つ追加する
    pub(crate) fn push(&mut self, sample_delta: u32) {
        if let Some(last) = self.entries.last_mut()
            && last.sample_delta == sample_delta
            && last.sample_count < u32::MAX
        {
            last.sample_count += 1;
        } else {
            self.entries.push(SttsEntry {
                sample_count: 1,
                sample_delta,
            });
        }
        self.cursor.reset();
    }

    /// 0 始まりのインデックスで指定されたサンプルの `(デコード時刻, 尺)` を返す
    pub(crate) fn lookup(&mut self, index: u64) -> Option<(u64, u32)> {
        let entries = &self.entries;
        let (entry, first_sample, base) = self.cursor.seek(index, entries.len(), |i| {
            let e = entries[i];
            (e.sample_count as u64, e.sample_count as u64 * e.sample_delta as u64)
        })?;
        let delta = entries[entry].sample_delta;
        Some((base + (index - first_sample) * delta as u64, delta))
    }

    /// 0 始まりのインデックスで指定されたサンプルを取り除く
    pub(crate) fn remove(&mut self, index: u64) {
        let deltas: Vec<u32> = self
            .sample_deltas()
            .enumerate()
            .filter(|(i, _)| *i as u64 != index)
            .map(|(_, d)| d)
            .collect();
        *self = Self::from_sample_deltas(deltas);
    }

    fn payload_size(&self) -> usize {
        4 + 4 + self.entries.len() * 8
    }
}

impl Encode for SttsBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let count = entry_count_u32(self.entries.len(), "stts")?;
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += count.encode(&mut buf[offset..])?;
            for entry in &self.entries {
                offset += entry.sample_count.encode(&mut buf[offset..])?;
                offset += entry.sample_delta.encode(&mut buf[offset..])?;
            }
            Ok(offset)
        })
    }
}

impl Decode for SttsBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let count = u32::decode_at(payload, &mut offset)? as usize;
            let entries = decode_entries(payload, &mut offset, count, 8, |buf, offset| {
                Ok(SttsEntry {
                    sample_count: u32::decode_at(buf, offset)?,
                    sample_delta: u32::decode_at(buf, offset)?,
                })
            })?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((Self::new(entries), header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for SttsBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for SttsBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [`CttsBox`] が保持するエントリー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CttsEntry {
    pub sample_count: u32,
    pub sample_offset: i64,
}

/// [ISO/IEC 14496-12] CompositionOffsetBox class (親: [`StblBox`])
///
/// 負のオフセットが存在する場合にのみ、符号付きのバージョン 1 で書き出される
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CttsBox {
    pub entries: Vec<CttsEntry>,
}

impl CttsBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"ctts");

    /// サンプル群のコンポジションオフセットから [`CttsBox`] を作成する
    pub fn from_sample_offsets<I>(sample_offsets: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        let mut this = Self::default();
        for sample_offset in sample_offsets {
            this.push(sample_offset);
        }
        this
    }

    /// 各サンプルのコンポジションオフセットを先頭から順に返すイテレーターを作成する
    pub fn sample_offsets(&self) -> impl Iterator<Item = i64> + '_ {
        self.entries
            .iter()
            .flat_map(|e| std::iter::repeat_n(e.sample_offset, e.sample_count as usize))
    }

    /// テーブルが表すサンプルの総数
    pub fn sample_count(&self) -> u64 {
        self.entries.iter().map(|e| e.sample_count as u64).sum()
    }

    /// 0 始まりのインデックスで指定されたサンプルのオフセットを返す
    pub fn sample_offset(&self, index: u64) -> Option<i64> {
        let mut first = 0u64;
        for e in &self.entries {
            let end = first + e.sample_count as u64;
            if index < end {
                return Some(e.sample_offset);
            }
            first = end;
        }
        None
    }

    pub(crate) fn push(&mut self, sample_offset: i64) {
        if let Some(last) = self.entries.last_mut()
            && last.sample_offset == sample_offset
            && last.sample_count < u32::MAX
        {
            last.sample_count += 1;
        } else {
            self.entries.push(CttsEntry {
                sample_count: 1,
                sample_offset,
            });
        }
    }

    pub(crate) fn remove(&mut self, index: u64) {
        let offsets: Vec<i64> = self
            .sample_offsets()
            .enumerate()
            .filter(|(i, _)| *i as u64 != index)
            .map(|(_, o)| o)
            .collect();
        *self = Self::from_sample_offsets(offsets);
    }

    fn check_range(&self) -> Result<()> {
        let version = self.full_box_version();
        for e in &self.entries {
            let ok = if version == 1 {
                i32::try_from(e.sample_offset).is_ok()
            } else {
                u32::try_from(e.sample_offset).is_ok()
            };
            if !ok {
                return Err(Error::with_reason(
                    ErrorKind::UnsupportedRepresentation,
                    format!("Composition offset {} cannot be represented", e.sample_offset),
                ));
            }
        }
        Ok(())
    }

    fn payload_size(&self) -> usize {
        4 + 4 + self.entries.len() * 8
    }
}

impl Encode for CttsBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_range()?;
        let count = entry_count_u32(self.entries.len(), "ctts")?;
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let version = self.full_box_version();
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += count.encode(&mut buf[offset..])?;
            for entry in &self.entries {
                offset += entry.sample_count.encode(&mut buf[offset..])?;
                if version == 1 {
                    offset += (entry.sample_offset as i32).encode(&mut buf[offset..])?;
                } else {
                    offset += (entry.sample_offset as u32).encode(&mut buf[offset..])?;
                }
            }
            Ok(offset)
        })
    }
}

impl Decode for CttsBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let count = u32::decode_at(payload, &mut offset)? as usize;
            let entries = decode_entries(payload, &mut offset, count, 8, |buf, offset| {
                let sample_count = u32::decode_at(buf, offset)?;
                let sample_offset = if full_header.version == 0 {
                    u32::decode_at(buf, offset)? as i64
                } else {
                    i32::decode_at(buf, offset)? as i64
                };
                Ok(CttsEntry {
                    sample_count,
                    sample_offset,
                })
            })?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((Self { entries }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for CttsBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for CttsBox {
    fn full_box_version(&self) -> u8 {
        self.entries.iter().any(|e| e.sample_offset < 0) as u8
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] SyncSampleBox class (親: [`StblBox`])
///
/// このボックスが存在しない場合は、全てのサンプルが同期サンプルとなる
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StssBox {
    /// 同期サンプルの番号（1 始まり、昇順）
    pub sample_numbers: Vec<u32>,
}

impl StssBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stss");

    /// 指定された番号（1 始まり）のサンプルが同期サンプルかどうかを判定する
    pub fn contains(&self, sample_number: u32) -> bool {
        self.sample_numbers.binary_search(&sample_number).is_ok()
    }

    fn payload_size(&self) -> usize {
        4 + 4 + self.sample_numbers.len() * 4
    }
}

impl Encode for StssBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let count = entry_count_u32(self.sample_numbers.len(), "stss")?;
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += count.encode(&mut buf[offset..])?;
            offset += encode_all(&self.sample_numbers, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for StssBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let count = u32::decode_at(payload, &mut offset)? as usize;
            let sample_numbers =
                decode_entries(payload, &mut offset, count, 4, u32::decode_at)?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((Self { sample_numbers }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for StssBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for StssBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [`StscBox`] が保持するエントリー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StscEntry {
    pub first_chunk: NonZeroU32,
    pub samples_per_chunk: u32,
    pub sample_description_index: NonZeroU32,
}

/// [`StscBox::chunk_spans()`] が返す、同じ設定を共有するチャンクの連続した範囲
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ChunkSpan {
    pub first_chunk: u32,
    pub chunk_count: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: NonZeroU32,
}

/// [ISO/IEC 14496-12] SampleToChunkBox class (親: [`StblBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StscBox {
    /// エントリー群
    ///
    /// 次のエントリーの `first_chunk` が、前のエントリーの範囲の終端となる。
    /// 直接変更した場合は [`StscBox::reset_cursor()`] を呼び出す必要がある
    pub entries: Vec<StscEntry>,
    pub(crate) cursor: RunCursor,
}

impl StscBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stsc");

    /// エントリー群から [`StscBox`] を作成する
    pub fn new(entries: Vec<StscEntry>) -> Self {
        Self {
            entries,
            cursor: RunCursor::default(),
        }
    }

    /// チャンクごとの `(サンプル数, サンプルエントリーの番号)` から [`StscBox`] を作成する
    ///
    /// 同じ設定を持つ連続したチャンクは一つのエントリーにまとめられる
    pub fn from_chunk_sizes<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = (u32, NonZeroU32)>,
    {
        let mut this = Self::default();
        let mut chunk_count = 0;
        for (samples_per_chunk, sample_description_index) in chunks {
            chunk_count += 1;
            this.push_chunk(chunk_count, samples_per_chunk, sample_description_index);
        }
        this
    }

    /// 読み取り位置をテーブルの先頭に戻す
    pub fn reset_cursor(&mut self) {
        self.cursor.reset();
    }

    /// 全 `chunk_count` 個のチャンクを、エントリーごとの範囲に分割して返す
    ///
    /// エントリーの範囲が 1 番目のチャンクから始まって隙間なく `chunk_count` 個を覆っていない場合は
    /// [`ErrorKind::InvalidFile`] エラーとなる
    pub fn chunk_spans(&self, chunk_count: u32) -> Result<Vec<ChunkSpan>> {
        let mut spans = try_vec_with_capacity(self.entries.len())?;
        if self.entries.is_empty() {
            if chunk_count != 0 {
                return Err(Error::invalid_file(format!(
                    "stsc has no entries for {chunk_count} chunks"
                )));
            }
            return Ok(spans);
        }
        if self.entries[0].first_chunk.get() != 1 {
            return Err(Error::invalid_file(format!(
                "The first stsc entry starts at chunk {}",
                self.entries[0].first_chunk
            )));
        }
        for (i, entry) in self.entries.iter().enumerate() {
            let first_chunk = entry.first_chunk.get();
            let end = match self.entries.get(i + 1) {
                Some(next) => next.first_chunk.get(),
                None => chunk_count.saturating_add(1),
            };
            if end <= first_chunk || end > chunk_count.saturating_add(1) {
                return Err(Error::invalid_file(format!(
                    "stsc entry #{i} (first chunk {first_chunk}) does not fit in {chunk_count} chunks"
                )));
            }
            spans.push(ChunkSpan {
                first_chunk,
                chunk_count: end - first_chunk,
                samples_per_chunk: entry.samples_per_chunk,
                sample_description_index: entry.sample_description_index,
            });
        }
        Ok(spans)
    }

    /// チャンクごとの `(サンプル数, サンプルエントリーの番号)` を返す
    pub fn chunk_sizes(&self, chunk_count: u32) -> Result<Vec<(u32, NonZeroU32)>> {
        let mut sizes = try_vec_with_capacity(chunk_count as usize)?;
        for span in self.chunk_spans(chunk_count)? {
            for _ in 0..span.chunk_count {
                sizes.push((span.samples_per_chunk, span.sample_description_index));
            }
        }
        Ok(sizes)
    }

    /// 指定されたチャンク（1 始まり）を含むエントリーを二分探索で求める
    pub fn entry_for_chunk(&self, chunk: u32) -> Option<&StscEntry> {
        let i = self
            .entries
            .partition_point(|e| e.first_chunk.get() <= chunk)
            .checked_sub(1)?;
        self.entries.get(i)
    }

    /// `chunk` 番目のチャンクを末尾に追加する
    pub(crate) fn push_chunk(
        &mut self,
        chunk: u32,
        samples_per_chunk: u32,
        sample_description_index: NonZeroU32,
    ) {
        let same_as_last = self.entries.last().is_some_and(|last| {
            last.samples_per_chunk == samples_per_chunk
                && last.sample_description_index == sample_description_index
        });
        if !same_as_last && let Some(first_chunk) = NonZeroU32::new(chunk) {
            self.entries.push(StscEntry {
                first_chunk,
                samples_per_chunk,
                sample_description_index,
            });
        }
        self.cursor.reset();
    }

    /// 0 始まりのサンプルインデックスから `(チャンク番号, チャンク先頭のサンプルインデックス, エントリー)` を求める
    pub(crate) fn lookup(&mut self, index: u64) -> Option<(u32, u64, StscEntry)> {
        let entries = &self.entries;
        let (entry, first_sample, _) = self.cursor.seek(index, entries.len(), |i| {
            let samples = match entries.get(i + 1) {
                Some(next) => {
                    let chunks = next
                        .first_chunk
                        .get()
                        .saturating_sub(entries[i].first_chunk.get());
                    chunks as u64 * entries[i].samples_per_chunk as u64
                }
                None => u64::MAX,
            };
            (samples, 0)
        })?;
        let e = entries[entry];
        if e.samples_per_chunk == 0 {
            return None;
        }
        let chunk_in_entry = (index - first_sample) / e.samples_per_chunk as u64;
        let chunk = u32::try_from(e.first_chunk.get() as u64 + chunk_in_entry).ok()?;
        let chunk_first_sample = first_sample + chunk_in_entry * e.samples_per_chunk as u64;
        Some((chunk, chunk_first_sample, e))
    }

    fn payload_size(&self) -> usize {
        4 + 4 + self.entries.len() * 12
    }
}

impl Encode for StscBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let count = entry_count_u32(self.entries.len(), "stsc")?;
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += count.encode(&mut buf[offset..])?;
            for entry in &self.entries {
                offset += entry.first_chunk.encode(&mut buf[offset..])?;
                offset += entry.samples_per_chunk.encode(&mut buf[offset..])?;
                offset += entry.sample_description_index.encode(&mut buf[offset..])?;
            }
            Ok(offset)
        })
    }
}

impl Decode for StscBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let count = u32::decode_at(payload, &mut offset)? as usize;
            let entries = decode_entries(payload, &mut offset, count, 12, |buf, offset| {
                let first_chunk = NonZeroU32::decode_at(buf, offset)?;
                let samples_per_chunk = u32::decode_at(buf, offset)?;
                let index = u32::decode_at(buf, offset)?;
                let sample_description_index = NonZeroU32::new(index).unwrap_or_else(|| {
                    tracing::warn!(
                        first_chunk = first_chunk.get(),
                        "broken sample description index 0 in stsc, using 1"
                    );
                    NonZeroU32::MIN
                });
                Ok(StscEntry {
                    first_chunk,
                    samples_per_chunk,
                    sample_description_index,
                })
            })?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((Self::new(entries), header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for StscBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for StscBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

fn saturating_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// stz2 の各サンプルサイズのフィールド幅
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum FieldWidth {
    Four,
    Eight,
    Sixteen,
}

impl FieldWidth {
    /// フィールドのビット数
    pub const fn bits(self) -> u8 {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
            Self::Sixteen => 16,
        }
    }

    /// `n` 個のサンプルサイズを格納するのに必要なバイト数
    pub const fn table_size(self, n: usize) -> usize {
        match self {
            Self::Four => n.div_ceil(2),
            Self::Eight => n,
            Self::Sixteen => n * 2,
        }
    }
}

/// サンプルサイズテーブルの書き出し形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSizeRepr {
    /// 全サンプルが同じサイズの stsz （テーブルを持たない）
    Uniform(u32),

    /// 指定された幅のフィールドを使う stz2
    Compact(FieldWidth),

    /// サンプルごとに 32 ビットのサイズを持つ stsz
    Regular,
}

/// サンプルサイズ群を格納するのに最適な形式を選択する
///
/// - 全てのサイズが等しく 0 ではない場合は [`SampleSizeRepr::Uniform`]
/// - それ以外は最大値が収まる最も狭い幅（4 / 8 / 16 ビット）の [`SampleSizeRepr::Compact`]
/// - 最大値が 16 ビットに収まらない場合は [`SampleSizeRepr::Regular`]
pub fn choose_width(sizes: &[u32]) -> SampleSizeRepr {
    if let Some((&first, rest)) = sizes.split_first()
        && first != 0
        && rest.iter().all(|&s| s == first)
    {
        return SampleSizeRepr::Uniform(first);
    }
    match sizes.iter().copied().max().unwrap_or(0) {
        0..=0xF => SampleSizeRepr::Compact(FieldWidth::Four),
        0x10..=0xFF => SampleSizeRepr::Compact(FieldWidth::Eight),
        0x100..=0xFFFF => SampleSizeRepr::Compact(FieldWidth::Sixteen),
        _ => SampleSizeRepr::Regular,
    }
}

/// [`StszBox`] が保持するサンプルサイズ
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleSizes {
    /// 全サンプルが同じサイズ
    #[allow(missing_docs)]
    Uniform { sample_size: u32, sample_count: u32 },

    /// サンプルごとのサイズ
    PerSample(Vec<u32>),
}

/// [ISO/IEC 14496-12] SampleSizeBox / CompactSampleSizeBox class (親: [`StblBox`])
///
/// 一つの型で stsz と stz2 の両方を表す
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StszBox {
    /// サンプルサイズ群
    pub sizes: SampleSizes,

    /// `true` の場合は書き出しのたびに [`choose_width()`] で形式を選び直す
    ///
    /// stz2 をデコードした場合は `true` になる
    pub compact: bool,
}

impl Default for StszBox {
    fn default() -> Self {
        Self {
            sizes: SampleSizes::PerSample(Vec::new()),
            compact: false,
        }
    }
}

impl StszBox {
    /// ボックス種別 (stsz)
    pub const TYPE: BoxType = BoxType::Normal(*b"stsz");

    /// ボックス種別 (stz2)
    pub const COMPACT_TYPE: BoxType = BoxType::Normal(*b"stz2");

    /// サンプルの総数
    ///
    /// サンプルごとのサイズが `u32::MAX` 個を超える場合は `u32::MAX` を返す。
    /// そのようなテーブルはエンコードできず、stts との件数の照合でも不整合となる
    pub fn sample_count(&self) -> u32 {
        match &self.sizes {
            SampleSizes::Uniform { sample_count, .. } => *sample_count,
            SampleSizes::PerSample(sizes) => saturating_count(sizes.len()),
        }
    }

    /// 0 始まりのインデックスで指定されたサンプルのサイズを返す
    pub fn sample_size(&self, index: u32) -> Option<u32> {
        match &self.sizes {
            SampleSizes::Uniform {
                sample_size,
                sample_count,
            } => (index < *sample_count).then_some(*sample_size),
            SampleSizes::PerSample(sizes) => sizes.get(index as usize).copied(),
        }
    }

    /// 全サンプルのサイズを先頭から順に返すイテレーターを作成する
    pub fn sample_sizes(&self) -> impl Iterator<Item = u32> + '_ {
        let (uniform, list): (Option<(u32, u32)>, &[u32]) = match &self.sizes {
            SampleSizes::Uniform {
                sample_size,
                sample_count,
            } => (Some((*sample_size, *sample_count)), &[]),
            SampleSizes::PerSample(sizes) => (None, sizes),
        };
        uniform
            .into_iter()
            .flat_map(|(size, count)| std::iter::repeat_n(size, count as usize))
            .chain(list.iter().copied())
    }

    /// 書き出し時に使われる形式を返す
    pub fn representation(&self) -> SampleSizeRepr {
        match (&self.sizes, self.compact) {
            (
                SampleSizes::Uniform {
                    sample_size,
                    sample_count,
                },
                _,
            ) if *sample_count > 0 => SampleSizeRepr::Uniform(*sample_size),
            (SampleSizes::Uniform { .. }, false) => SampleSizeRepr::Regular,
            (SampleSizes::Uniform { .. }, true) => SampleSizeRepr::Compact(FieldWidth::Four),
            (SampleSizes::PerSample(_), false) => SampleSizeRepr::Regular,
            (SampleSizes::PerSample(sizes), true) => choose_width(sizes),
        }
    }

    /// 末尾にサンプルを一つ追加する
    pub(crate) fn push(&mut self, size: u32) -> Result<()> {
        if let SampleSizes::Uniform {
            sample_size,
            sample_count,
        } = self.sizes
        {
            if sample_size == size && sample_count < u32::MAX {
                self.sizes = SampleSizes::Uniform {
                    sample_size,
                    sample_count: sample_count + 1,
                };
                return Ok(());
            }
            let mut sizes = try_vec_with_capacity(sample_count as usize + 1)?;
            sizes.extend(std::iter::repeat_n(sample_size, sample_count as usize));
            self.sizes = SampleSizes::PerSample(sizes);
        }
        if let SampleSizes::PerSample(sizes) = &mut self.sizes {
            try_push(sizes, size)?;
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, index: u32) {
        match &mut self.sizes {
            SampleSizes::Uniform { sample_count, .. } => {
                if index < *sample_count {
                    *sample_count -= 1;
                }
            }
            SampleSizes::PerSample(sizes) => {
                if (index as usize) < sizes.len() {
                    sizes.remove(index as usize);
                }
            }
        }
    }

    fn payload_size(&self) -> Result<usize> {
        let count = self.sample_count() as usize;
        Ok(match self.representation() {
            SampleSizeRepr::Uniform(0) => {
                return Err(Error::invalid_input(
                    "Uniform sample size must not be zero when samples exist",
                ));
            }
            SampleSizeRepr::Uniform(_) => 4 + 4 + 4,
            SampleSizeRepr::Regular => 4 + 4 + 4 + count * 4,
            SampleSizeRepr::Compact(width) => 4 + 4 + 4 + width.table_size(count),
        })
    }
}

impl Encode for StszBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(self.box_type(), self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let repr = self.representation();
        encode_box(self.box_type(), self.payload_size()?, buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            let count = self.sample_count();
            match repr {
                SampleSizeRepr::Uniform(sample_size) => {
                    offset += sample_size.encode(&mut buf[offset..])?;
                    offset += count.encode(&mut buf[offset..])?;
                }
                SampleSizeRepr::Regular => {
                    offset += 0u32.encode(&mut buf[offset..])?;
                    offset += count.encode(&mut buf[offset..])?;
                    for size in self.sample_sizes() {
                        offset += size.encode(&mut buf[offset..])?;
                    }
                }
                SampleSizeRepr::Compact(width) => {
                    offset += [0u8; 3].encode(&mut buf[offset..])?;
                    offset += width.bits().encode(&mut buf[offset..])?;
                    offset += count.encode(&mut buf[offset..])?;
                    let sizes: Vec<u32> = self.sample_sizes().collect();
                    match width {
                        FieldWidth::Four => {
                            for pair in sizes.chunks(2) {
                                let high = pair[0] as u8 & 0xF;
                                let low = pair.get(1).map_or(0, |s| *s as u8 & 0xF);
                                offset += ((high << 4) | low).encode(&mut buf[offset..])?;
                            }
                        }
                        FieldWidth::Eight => {
                            for size in sizes {
                                offset += (size as u8).encode(&mut buf[offset..])?;
                            }
                        }
                        FieldWidth::Sixteen => {
                            for size in sizes {
                                offset += (size as u16).encode(&mut buf[offset..])?;
                            }
                        }
                    }
                }
            }
            Ok(offset)
        })
    }
}

impl Decode for StszBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, _) = BoxHeader::decode(buf)?;
        if header.box_type == Self::COMPACT_TYPE {
            return with_box_type(Self::COMPACT_TYPE, || Self::decode_compact(buf));
        }
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let sample_size = u32::decode_at(payload, &mut offset)?;
            let sample_count = u32::decode_at(payload, &mut offset)?;

            let sizes = if sample_size != 0 {
                SampleSizes::Uniform {
                    sample_size,
                    sample_count,
                }
            } else {
                SampleSizes::PerSample(decode_entries(
                    payload,
                    &mut offset,
                    sample_count as usize,
                    4,
                    u32::decode_at,
                )?)
            };
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((
                Self {
                    sizes,
                    compact: false,
                },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl StszBox {
    fn decode_compact(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
        header.box_type.expect(Self::COMPACT_TYPE)?;

        let mut offset = 0;
        let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
        let _ = <[u8; 3]>::decode_at(payload, &mut offset)?;
        let field_size = u8::decode_at(payload, &mut offset)?;
        let count = u32::decode_at(payload, &mut offset)? as usize;

        let sizes = match field_size {
            4 => {
                let bytes =
                    decode_entries(payload, &mut offset, count.div_ceil(2), 1, u8::decode_at)?;
                let mut sizes = try_vec_with_capacity(count)?;
                for (i, b) in bytes.iter().enumerate() {
                    sizes.push((b >> 4) as u32);
                    if i * 2 + 1 < count {
                        sizes.push((b & 0xF) as u32);
                    }
                }
                sizes
            }
            8 => decode_entries(payload, &mut offset, count, 1, |buf, offset| {
                u8::decode_at(buf, offset).map(u32::from)
            })?,
            16 => decode_entries(payload, &mut offset, count, 2, |buf, offset| {
                u16::decode_at(buf, offset).map(u32::from)
            })?,
            _ => {
                return Err(Error::invalid_file(format!(
                    "Invalid stz2 field size: {field_size}"
                )));
            }
        };
        note_trailing_bytes(Self::COMPACT_TYPE, payload.len() - offset);

        Ok((
            Self {
                sizes: SampleSizes::PerSample(sizes),
                compact: true,
            },
            header.external_size() + payload.len(),
        ))
    }
}

impl BaseBox for StszBox {
    fn box_type(&self) -> BoxType {
        match self.representation() {
            SampleSizeRepr::Compact(_) => Self::COMPACT_TYPE,
            _ => Self::TYPE,
        }
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for StszBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// チャンクオフセットテーブルの書き出し形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOffsetRepr {
    /// 32 ビットのオフセットを使う stco
    Stco,

    /// 64 ビットのオフセットを使う co64
    Co64,
}

/// チャンクオフセット群を格納するのに必要な形式を選択する
///
/// 最大のオフセットが 32 ビットに収まらない場合にのみ [`ChunkOffsetRepr::Co64`] となる
pub fn choose_offset_box(offsets: &[u64]) -> ChunkOffsetRepr {
    if offsets.iter().any(|&o| o > u32::MAX as u64) {
        ChunkOffsetRepr::Co64
    } else {
        ChunkOffsetRepr::Stco
    }
}

/// [ISO/IEC 14496-12] ChunkOffsetBox / ChunkLargeOffsetBox class (親: [`StblBox`])
///
/// 一つの型で stco と co64 の両方を表し、書き出し時の形式は [`choose_offset_box()`] で決まる
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkOffsetBox {
    /// 各チャンクの先頭サンプルのファイル先頭からの位置
    pub offsets: Vec<u64>,
}

impl ChunkOffsetBox {
    /// ボックス種別 (stco)
    pub const STCO_TYPE: BoxType = BoxType::Normal(*b"stco");

    /// ボックス種別 (co64)
    pub const CO64_TYPE: BoxType = BoxType::Normal(*b"co64");

    /// 書き出し時に使われる形式を返す
    pub fn representation(&self) -> ChunkOffsetRepr {
        choose_offset_box(&self.offsets)
    }

    fn payload_size(&self) -> usize {
        let entry_size = match self.representation() {
            ChunkOffsetRepr::Stco => 4,
            ChunkOffsetRepr::Co64 => 8,
        };
        4 + 4 + self.offsets.len() * entry_size
    }
}

impl Encode for ChunkOffsetBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(self.box_type(), self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let count = entry_count_u32(self.offsets.len(), "chunk offset")?;
        let repr = self.representation();
        encode_box(self.box_type(), self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += count.encode(&mut buf[offset..])?;
            for &chunk_offset in &self.offsets {
                offset += match repr {
                    ChunkOffsetRepr::Stco => (chunk_offset as u32).encode(&mut buf[offset..])?,
                    ChunkOffsetRepr::Co64 => chunk_offset.encode(&mut buf[offset..])?,
                };
            }
            Ok(offset)
        })
    }
}

impl Decode for ChunkOffsetBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
        with_box_type(header.box_type, || {
            let entry_size = match header.box_type {
                Self::STCO_TYPE => 4,
                Self::CO64_TYPE => 8,
                other => {
                    return Err(Error::invalid_file(format!(
                        "Expected box type 'stco' or 'co64', but got '{other}'"
                    )));
                }
            };

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let count = u32::decode_at(payload, &mut offset)? as usize;
            let offsets = decode_entries(payload, &mut offset, count, entry_size, |buf, offset| {
                if entry_size == 4 {
                    u32::decode_at(buf, offset).map(u64::from)
                } else {
                    u64::decode_at(buf, offset)
                }
            })?;
            note_trailing_bytes(header.box_type, payload.len() - offset);

            Ok((Self { offsets }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for ChunkOffsetBox {
    fn box_type(&self) -> BoxType {
        match self.representation() {
            ChunkOffsetRepr::Stco => Self::STCO_TYPE,
            ChunkOffsetRepr::Co64 => Self::CO64_TYPE,
        }
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for ChunkOffsetBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(v: u32) -> NonZeroU32 {
        NonZeroU32::new(v).expect("non zero")
    }

    #[test]
    fn choose_width_boundaries() {
        assert_eq!(choose_width(&[]), SampleSizeRepr::Compact(FieldWidth::Four));
        assert_eq!(choose_width(&[7, 7, 7]), SampleSizeRepr::Uniform(7));
        assert_eq!(
            choose_width(&[0, 0]),
            SampleSizeRepr::Compact(FieldWidth::Four)
        );
        assert_eq!(
            choose_width(&[1, 15]),
            SampleSizeRepr::Compact(FieldWidth::Four)
        );
        assert_eq!(
            choose_width(&[1, 16]),
            SampleSizeRepr::Compact(FieldWidth::Eight)
        );
        assert_eq!(
            choose_width(&[1, 0xFFFF]),
            SampleSizeRepr::Compact(FieldWidth::Sixteen)
        );
        assert_eq!(choose_width(&[1, 0x10000]), SampleSizeRepr::Regular);
    }

    #[test]
    fn choose_offset_box_boundary() {
        assert_eq!(choose_offset_box(&[0xFFFF_FFFF]), ChunkOffsetRepr::Stco);
        assert_eq!(choose_offset_box(&[1, 0x1_0000_0000]), ChunkOffsetRepr::Co64);
        assert_eq!(choose_offset_box(&[]), ChunkOffsetRepr::Stco);
    }

    #[test]
    fn chunk_offsets_switch_box_type() {
        let mut stco = ChunkOffsetBox {
            offsets: vec![48, 0xFFFF_FFFF],
        };
        let bytes = stco.encode_to_vec().expect("encode");
        assert_eq!(&bytes[4..8], b"stco");
        assert_eq!(bytes.len(), 16 + 8);

        stco.offsets[1] = 0x1_0000_0000;
        let bytes = stco.encode_to_vec().expect("encode");
        assert_eq!(&bytes[4..8], b"co64");
        assert_eq!(bytes.len(), 16 + 16);
        assert_eq!(ChunkOffsetBox::decode(&bytes).expect("decode").0, stco);
    }

    #[test]
    fn stz2_four_bit_odd_count_is_padded() {
        let stsz = StszBox {
            sizes: SampleSizes::PerSample(vec![1, 2, 3]),
            compact: true,
        };
        let bytes = stsz.encode_to_vec().expect("encode");
        assert_eq!(&bytes[4..8], b"stz2");
        assert_eq!(bytes[15], 4);
        assert_eq!(&bytes[20..], [0x12, 0x30]);

        let (decoded, _) = StszBox::decode(&bytes).expect("decode");
        assert_eq!(decoded, stsz);
    }

    #[test]
    fn stz2_with_uniform_sizes_becomes_stsz() {
        let stsz = StszBox {
            sizes: SampleSizes::PerSample(vec![300, 300]),
            compact: true,
        };
        let bytes = stsz.encode_to_vec().expect("encode");
        assert_eq!(&bytes[4..8], b"stsz");
        assert_eq!(bytes.len(), 20);

        // 一度正規化された後は不動点になる
        let (decoded, _) = StszBox::decode(&bytes).expect("decode");
        assert_eq!(decoded.encode_to_vec().expect("encode"), bytes);
    }

    #[test]
    fn per_sample_count_saturates() {
        assert_eq!(saturating_count(0), 0);
        assert_eq!(saturating_count(u32::MAX as usize), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(saturating_count(u32::MAX as usize + 1), u32::MAX);

        let stsz = StszBox {
            sizes: SampleSizes::PerSample(vec![1, 2, 3]),
            compact: false,
        };
        assert_eq!(stsz.sample_count(), 3);
    }

    #[test]
    fn regular_stsz_stays_regular() {
        let stsz = StszBox {
            sizes: SampleSizes::PerSample(vec![5, 5]),
            compact: false,
        };
        let bytes = stsz.encode_to_vec().expect("encode");
        assert_eq!(&bytes[4..8], b"stsz");
        assert_eq!(bytes.len(), 20 + 8);
    }

    #[test]
    fn stts_cursor_handles_backward_seek() {
        let mut stts = SttsBox::from_sample_deltas([10, 10, 20, 30, 30, 30]);
        assert_eq!(stts.entries.len(), 3);
        assert_eq!(stts.lookup(0), Some((0, 10)));
        assert_eq!(stts.lookup(3), Some((40, 30)));
        assert_eq!(stts.lookup(5), Some((100, 30)));
        assert_eq!(stts.lookup(2), Some((20, 20)));
        assert_eq!(stts.lookup(1), Some((10, 10)));
        assert_eq!(stts.lookup(6), None);
        assert_eq!(stts.total_duration(), 130);
    }

    #[test]
    fn stsc_lookup_and_spans() {
        let mut stsc = StscBox::from_chunk_sizes([(2, nz(1)), (2, nz(1)), (1, nz(2))]);
        assert_eq!(stsc.entries.len(), 2);

        let spans = stsc.chunk_spans(3).expect("spans");
        assert_eq!(spans[0].chunk_count, 2);
        assert_eq!(spans[1].first_chunk, 3);
        assert_eq!(spans[1].chunk_count, 1);

        assert_eq!(stsc.lookup(3).map(|(c, f, _)| (c, f)), Some((2, 2)));
        assert_eq!(stsc.lookup(4).map(|(c, f, _)| (c, f)), Some((3, 4)));
        assert_eq!(stsc.lookup(0).map(|(c, f, _)| (c, f)), Some((1, 0)));
        assert_eq!(stsc.entry_for_chunk(2).map(|e| e.first_chunk.get()), Some(1));

        // エントリーが宣言されたチャンク数を超えている
        assert!(stsc.chunk_spans(2).is_err());
    }

    #[test]
    fn stsc_zero_description_index_is_fixed() {
        let mut bytes = vec![0, 0, 0, 28];
        bytes.extend_from_slice(b"stsc");
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);
        bytes.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 5, 0, 0, 0, 0]);
        let (stsc, _) = StscBox::decode(&bytes).expect("decode");
        assert_eq!(stsc.entries[0].sample_description_index.get(), 1);
    }

    #[test]
    fn ctts_version_follows_sign() {
        let mut ctts = CttsBox::from_sample_offsets([0, 1024, 1024]);
        assert_eq!(ctts.full_box_version(), 0);
        let bytes = ctts.encode_to_vec().expect("encode");
        assert_eq!(CttsBox::decode(&bytes).expect("decode").0, ctts);

        ctts.push(-512);
        assert_eq!(ctts.full_box_version(), 1);
        let bytes = ctts.encode_to_vec().expect("encode");
        assert_eq!(bytes[8], 1);
        assert_eq!(CttsBox::decode(&bytes).expect("decode").0, ctts);

        ctts.push(i64::from(i32::MAX) + 1);
        let err = ctts.encode_to_vec().expect_err("should fail");
        assert_eq!(err.kind, ErrorKind::UnsupportedRepresentation);
    }

    #[test]
    fn stbl_rejects_second_size_table() {
        let mut stbl = StblBox::default();
        stbl.add_child(AnyBox::Stsz(StszBox::default())).expect("first");
        let err = stbl
            .add_child(AnyBox::Stsz(StszBox {
                sizes: SampleSizes::PerSample(vec![1]),
                compact: true,
            }))
            .expect_err("should fail");
        assert_eq!(err.kind, ErrorKind::DuplicateBox);
    }

    #[test]
    fn sample_entry_keeps_body() {
        let entry = SampleEntry {
            box_type: BoxType::Normal(*b"mp4a"),
            data_reference_index: 1,
            body: vec![1, 2, 3],
        };
        let stsd = StsdBox {
            entries: vec![entry],
        };
        let bytes = stsd.encode_to_vec().expect("encode");
        assert_eq!(bytes.len(), 16 + 8 + 8 + 3);
        assert_eq!(StsdBox::decode(&bytes).expect("decode").0, stsd);
    }
}
