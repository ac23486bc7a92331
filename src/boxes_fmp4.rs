//! Fragmented MP4 関連のボックス（mvex / moof 以下）の定義と、
//! フラグメント内のサンプル情報を既定値と組み合わせて解決する処理
use crate::{
    BaseBox, BoxHeader, BoxType, ContainerBox, Decode, Encode, Error, FullBox, FullBoxFlags,
    FullBoxHeader, Result,
    basic_types::as_box_object,
    boxes::{
        AnyBox, SampleFlags, SdtpBox, box_size, check_mandatory_box, decode_container, encode_all,
        encode_box, note_trailing_bytes, required, required_mut, route_other_box, set_singleton,
        sum_sizes, version_for_values, with_box_type,
    },
    codec::{decode_entries, entry_count_u32, try_push},
};

/// [ISO/IEC 14496-12] MovieExtendsBox class (親: [`MoovBox`](crate::boxes::MoovBox))
///
/// このボックスが存在する場合、ファイルにはムービーフラグメントが後続しうることを示す。
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MvexBox {
    pub mehd_box: Option<MehdBox>,
    pub trex_boxes: Vec<TrexBox>,
    pub other_boxes: Vec<AnyBox>,
}

impl MvexBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mvex");

    /// 指定されたトラックに対応する trex ボックスを返す
    pub fn trex(&self, track_id: u32) -> Option<&TrexBox> {
        self.trex_boxes.iter().find(|b| b.track_id == track_id)
    }

    fn payload_size(&self) -> Result<usize> {
        Ok(sum_sizes(&self.mehd_box)?
            + sum_sizes(&self.trex_boxes)?
            + sum_sizes(&self.other_boxes)?)
    }
}

impl Encode for MvexBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = 0;
            offset += encode_all(&self.mehd_box, &mut buf[offset..])?;
            offset += encode_all(&self.trex_boxes, &mut buf[offset..])?;
            offset += encode_all(&self.other_boxes, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for MvexBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_container(Self::TYPE, buf)
    }
}

impl BaseBox for MvexBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::empty()
                .chain(self.mehd_box.iter().map(as_box_object))
                .chain(self.trex_boxes.iter().map(as_box_object))
                .chain(self.other_boxes.iter().map(as_box_object)),
        )
    }
}

impl ContainerBox for MvexBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        match child {
            AnyBox::Mehd(b) => set_singleton(&mut self.mehd_box, b, Self::TYPE),
            AnyBox::Trex(b) => try_push(&mut self.trex_boxes, b),
            other => route_other_box(&mut self.other_boxes, other, Self::TYPE),
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        Ok(())
    }
}

/// [ISO/IEC 14496-12] MovieExtendsHeaderBox class (親: [`MvexBox`])
///
/// フラグメントを含めたムービー全体の長さ
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MehdBox {
    pub fragment_duration: u64,
}

impl MehdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mehd");

    fn payload_size(&self) -> usize {
        if self.full_box_version() == 1 { 12 } else { 8 }
    }
}

impl Encode for MehdBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            if self.full_box_version() == 1 {
                offset += self.fragment_duration.encode(&mut buf[offset..])?;
            } else {
                offset += (self.fragment_duration as u32).encode(&mut buf[offset..])?;
            }
            Ok(offset)
        })
    }
}

impl Decode for MehdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let fragment_duration = if full_header.version == 1 {
                u64::decode_at(payload, &mut offset)?
            } else {
                u32::decode_at(payload, &mut offset)? as u64
            };
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((
                Self { fragment_duration },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for MehdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for MehdBox {
    fn full_box_version(&self) -> u8 {
        version_for_values([self.fragment_duration])
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] TrackExtendsBox class (親: [`MvexBox`])
///
/// トラックフラグメントが値を省略した場合に使われる、トラック単位の既定値
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TrexBox {
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: SampleFlags,
}

impl TrexBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"trex");

    /// サンプルエントリーの 1 番目を参照し、それ以外の既定値が全て 0 の trex ボックスを作成する
    pub fn new(track_id: u32) -> Self {
        Self {
            track_id,
            default_sample_description_index: 1,
            default_sample_duration: 0,
            default_sample_size: 0,
            default_sample_flags: SampleFlags::empty(),
        }
    }
}

impl Encode for TrexBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, 4 + 20))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, 4 + 20, buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += self.track_id.encode(&mut buf[offset..])?;
            offset += self
                .default_sample_description_index
                .encode(&mut buf[offset..])?;
            offset += self.default_sample_duration.encode(&mut buf[offset..])?;
            offset += self.default_sample_size.encode(&mut buf[offset..])?;
            offset += self.default_sample_flags.encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for TrexBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let this = Self {
                track_id: u32::decode_at(payload, &mut offset)?,
                default_sample_description_index: u32::decode_at(payload, &mut offset)?,
                default_sample_duration: u32::decode_at(payload, &mut offset)?,
                default_sample_size: u32::decode_at(payload, &mut offset)?,
                default_sample_flags: SampleFlags::decode_at(payload, &mut offset)?,
            };
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((this, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for TrexBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for TrexBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] MovieFragmentBox class
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MoofBox {
    pub mfhd_box: Option<MfhdBox>,
    pub traf_boxes: Vec<TrafBox>,
    pub other_boxes: Vec<AnyBox>,
}

impl MoofBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"moof");

    /// mfhd ボックスへの参照を返す
    pub fn mfhd(&self) -> Result<&MfhdBox> {
        required(&self.mfhd_box, MfhdBox::TYPE, Self::TYPE)
    }

    /// mfhd ボックスへの可変参照を返す
    pub fn mfhd_mut(&mut self) -> Result<&mut MfhdBox> {
        required_mut(&mut self.mfhd_box, MfhdBox::TYPE, Self::TYPE)
    }

    fn payload_size(&self) -> Result<usize> {
        self.check_mandatory_boxes()?;
        Ok(sum_sizes(&self.mfhd_box)?
            + sum_sizes(&self.traf_boxes)?
            + sum_sizes(&self.other_boxes)?)
    }
}

impl Encode for MoofBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = 0;
            offset += encode_all(&self.mfhd_box, &mut buf[offset..])?;
            offset += encode_all(&self.traf_boxes, &mut buf[offset..])?;
            offset += encode_all(&self.other_boxes, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for MoofBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_container(Self::TYPE, buf)
    }
}

impl BaseBox for MoofBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::empty()
                .chain(self.mfhd_box.iter().map(as_box_object))
                .chain(self.traf_boxes.iter().map(as_box_object))
                .chain(self.other_boxes.iter().map(as_box_object)),
        )
    }
}

impl ContainerBox for MoofBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[MfhdBox::TYPE];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        match child {
            AnyBox::Mfhd(b) => set_singleton(&mut self.mfhd_box, b, Self::TYPE),
            AnyBox::Traf(b) => try_push(&mut self.traf_boxes, b),
            other => route_other_box(&mut self.other_boxes, other, Self::TYPE),
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        check_mandatory_box(&self.mfhd_box, MfhdBox::TYPE, Self::TYPE)
    }
}

/// [ISO/IEC 14496-12] MovieFragmentHeaderBox class (親: [`MoofBox`])
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MfhdBox {
    pub sequence_number: u32,
}

impl MfhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mfhd");
}

impl Encode for MfhdBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, 8))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, 8, buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += self.sequence_number.encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for MfhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let sequence_number = u32::decode_at(payload, &mut offset)?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((
                Self { sequence_number },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for MfhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for MfhdBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] TrackFragmentBox class (親: [`MoofBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TrafBox {
    pub tfhd_box: Option<TfhdBox>,
    pub tfdt_box: Option<TfdtBox>,
    pub sdtp_box: Option<SdtpBox>,
    pub trun_boxes: Vec<TrunBox>,
    pub other_boxes: Vec<AnyBox>,
}

impl TrafBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"traf");

    /// tfhd ボックスへの参照を返す
    pub fn tfhd(&self) -> Result<&TfhdBox> {
        required(&self.tfhd_box, TfhdBox::TYPE, Self::TYPE)
    }

    /// tfhd ボックスへの可変参照を返す
    pub fn tfhd_mut(&mut self) -> Result<&mut TfhdBox> {
        required_mut(&mut self.tfhd_box, TfhdBox::TYPE, Self::TYPE)
    }

    /// tfhd が存在し、含まれる全ての trun が [`TrunBox::validate()`] を満たすことを確認する
    pub fn validate(&self) -> Result<()> {
        with_box_type(Self::TYPE, || {
            self.check_mandatory_boxes()?;
            self.trun_boxes.iter().try_for_each(TrunBox::validate)
        })
    }

    /// このトラックフラグメントに含まれる全サンプルの情報を、既定値を適用した上で返す
    pub fn resolve_samples(&self, trex: &TrexBox) -> Result<Vec<ResolvedSample>> {
        self.validate()?;
        let defaults = TrackFragmentDefaults::resolve(trex, self.tfhd()?);
        let mut samples = Vec::new();
        for trun in &self.trun_boxes {
            samples.extend(trun.resolve(&defaults)?);
        }
        Ok(samples)
    }

    fn payload_size(&self) -> Result<usize> {
        self.check_mandatory_boxes()?;
        Ok(sum_sizes(&self.tfhd_box)?
            + sum_sizes(&self.tfdt_box)?
            + sum_sizes(&self.sdtp_box)?
            + sum_sizes(&self.trun_boxes)?
            + sum_sizes(&self.other_boxes)?)
    }
}

impl Encode for TrafBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.validate()?;
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = 0;
            offset += encode_all(&self.tfhd_box, &mut buf[offset..])?;
            offset += encode_all(&self.tfdt_box, &mut buf[offset..])?;
            offset += encode_all(&self.sdtp_box, &mut buf[offset..])?;
            offset += encode_all(&self.trun_boxes, &mut buf[offset..])?;
            offset += encode_all(&self.other_boxes, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for TrafBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (this, size): (Self, usize) = decode_container(Self::TYPE, buf)?;
        this.validate()?;
        Ok((this, size))
    }
}

impl BaseBox for TrafBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::empty()
                .chain(self.tfhd_box.iter().map(as_box_object))
                .chain(self.tfdt_box.iter().map(as_box_object))
                .chain(self.sdtp_box.iter().map(as_box_object))
                .chain(self.trun_boxes.iter().map(as_box_object))
                .chain(self.other_boxes.iter().map(as_box_object)),
        )
    }
}

impl ContainerBox for TrafBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[TfhdBox::TYPE];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        match child {
            AnyBox::Tfhd(b) => set_singleton(&mut self.tfhd_box, b, Self::TYPE),
            AnyBox::Tfdt(b) => set_singleton(&mut self.tfdt_box, b, Self::TYPE),
            AnyBox::Sdtp(b) => set_singleton(&mut self.sdtp_box, b, Self::TYPE),
            AnyBox::Trun(b) => try_push(&mut self.trun_boxes, b),
            other => route_other_box(&mut self.other_boxes, other, Self::TYPE),
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        check_mandatory_box(&self.tfhd_box, TfhdBox::TYPE, Self::TYPE)
    }
}

/// [ISO/IEC 14496-12] TrackFragmentHeaderBox class (親: [`TrafBox`])
///
/// 値が `None` のフィールドはエンコード時に省略され、対応するフラグも立たない
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TfhdBox {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<SampleFlags>,
    pub duration_is_empty: bool,
    pub default_base_is_moof: bool,
}

impl TfhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"tfhd");

    /// base_data_offset が存在することを示すフラグ
    pub const FLAG_BASE_DATA_OFFSET_PRESENT: u32 = 0x000001;

    /// sample_description_index が存在することを示すフラグ
    pub const FLAG_SAMPLE_DESCRIPTION_INDEX_PRESENT: u32 = 0x000002;

    /// default_sample_duration が存在することを示すフラグ
    pub const FLAG_DEFAULT_SAMPLE_DURATION_PRESENT: u32 = 0x000008;

    /// default_sample_size が存在することを示すフラグ
    pub const FLAG_DEFAULT_SAMPLE_SIZE_PRESENT: u32 = 0x000010;

    /// default_sample_flags が存在することを示すフラグ
    pub const FLAG_DEFAULT_SAMPLE_FLAGS_PRESENT: u32 = 0x000020;

    /// 継続時間が空であることを示すフラグ
    pub const FLAG_DURATION_IS_EMPTY: u32 = 0x010000;

    /// base_data_offset の既定値が moof の先頭であることを示すフラグ
    pub const FLAG_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

    /// 全ての値を省略した tfhd ボックスを作成する
    pub fn new(track_id: u32) -> Self {
        Self {
            track_id,
            base_data_offset: None,
            sample_description_index: None,
            default_sample_duration: None,
            default_sample_size: None,
            default_sample_flags: None,
            duration_is_empty: false,
            default_base_is_moof: false,
        }
    }

    fn payload_size(&self) -> usize {
        4 + 4
            + self.base_data_offset.map_or(0, |_| 8)
            + self.sample_description_index.map_or(0, |_| 4)
            + self.default_sample_duration.map_or(0, |_| 4)
            + self.default_sample_size.map_or(0, |_| 4)
            + self.default_sample_flags.map_or(0, |_| 4)
    }
}

impl Encode for TfhdBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += self.track_id.encode(&mut buf[offset..])?;
            if let Some(v) = self.base_data_offset {
                offset += v.encode(&mut buf[offset..])?;
            }
            if let Some(v) = self.sample_description_index {
                offset += v.encode(&mut buf[offset..])?;
            }
            if let Some(v) = self.default_sample_duration {
                offset += v.encode(&mut buf[offset..])?;
            }
            if let Some(v) = self.default_sample_size {
                offset += v.encode(&mut buf[offset..])?;
            }
            if let Some(v) = self.default_sample_flags {
                offset += v.encode(&mut buf[offset..])?;
            }
            Ok(offset)
        })
    }
}

impl Decode for TfhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let flags = full_header.flags;

            let mut this = Self::new(u32::decode_at(payload, &mut offset)?);
            if flags.contains(Self::FLAG_BASE_DATA_OFFSET_PRESENT) {
                this.base_data_offset = Some(u64::decode_at(payload, &mut offset)?);
            }
            if flags.contains(Self::FLAG_SAMPLE_DESCRIPTION_INDEX_PRESENT) {
                this.sample_description_index = Some(u32::decode_at(payload, &mut offset)?);
            }
            if flags.contains(Self::FLAG_DEFAULT_SAMPLE_DURATION_PRESENT) {
                this.default_sample_duration = Some(u32::decode_at(payload, &mut offset)?);
            }
            if flags.contains(Self::FLAG_DEFAULT_SAMPLE_SIZE_PRESENT) {
                this.default_sample_size = Some(u32::decode_at(payload, &mut offset)?);
            }
            if flags.contains(Self::FLAG_DEFAULT_SAMPLE_FLAGS_PRESENT) {
                this.default_sample_flags = Some(SampleFlags::decode_at(payload, &mut offset)?);
            }
            this.duration_is_empty = flags.contains(Self::FLAG_DURATION_IS_EMPTY);
            this.default_base_is_moof = flags.contains(Self::FLAG_DEFAULT_BASE_IS_MOOF);
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((this, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for TfhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for TfhdBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        let present = [
            (Self::FLAG_BASE_DATA_OFFSET_PRESENT, self.base_data_offset.is_some()),
            (
                Self::FLAG_SAMPLE_DESCRIPTION_INDEX_PRESENT,
                self.sample_description_index.is_some(),
            ),
            (
                Self::FLAG_DEFAULT_SAMPLE_DURATION_PRESENT,
                self.default_sample_duration.is_some(),
            ),
            (Self::FLAG_DEFAULT_SAMPLE_SIZE_PRESENT, self.default_sample_size.is_some()),
            (Self::FLAG_DEFAULT_SAMPLE_FLAGS_PRESENT, self.default_sample_flags.is_some()),
            (Self::FLAG_DURATION_IS_EMPTY, self.duration_is_empty),
            (Self::FLAG_DEFAULT_BASE_IS_MOOF, self.default_base_is_moof),
        ];
        FullBoxFlags::new(
            present
                .into_iter()
                .filter(|(_, set)| *set)
                .fold(0, |acc, (flag, _)| acc | flag),
        )
    }
}

/// [ISO/IEC 14496-12] TrackFragmentBaseMediaDecodeTimeBox class (親: [`TrafBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TfdtBox {
    pub base_media_decode_time: u64,
}

impl TfdtBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"tfdt");

    fn payload_size(&self) -> usize {
        if self.full_box_version() == 1 { 12 } else { 8 }
    }
}

impl Encode for TfdtBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            if self.full_box_version() == 1 {
                offset += self.base_media_decode_time.encode(&mut buf[offset..])?;
            } else {
                offset += (self.base_media_decode_time as u32).encode(&mut buf[offset..])?;
            }
            Ok(offset)
        })
    }
}

impl Decode for TfdtBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let base_media_decode_time = if full_header.version == 1 {
                u64::decode_at(payload, &mut offset)?
            } else {
                u32::decode_at(payload, &mut offset)? as u64
            };
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((
                Self {
                    base_media_decode_time,
                },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for TfdtBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for TfdtBox {
    fn full_box_version(&self) -> u8 {
        version_for_values([self.base_media_decode_time])
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] TrackRunBox class (親: [`TrafBox`])
///
/// サンプルごとのフィールドの有無は、先頭サンプルの各フィールドが `Some` かどうかで決まる。
/// ラン内の全サンプルは同じフィールドの組を持っている必要がある
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TrunBox {
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<SampleFlags>,
    pub samples: Vec<TrunSample>,
}

impl TrunBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"trun");

    /// data_offset が存在することを示すフラグ
    pub const FLAG_DATA_OFFSET_PRESENT: u32 = 0x000001;

    /// first_sample_flags が存在することを示すフラグ
    pub const FLAG_FIRST_SAMPLE_FLAGS_PRESENT: u32 = 0x000004;

    /// sample_duration が存在することを示すフラグ
    pub const FLAG_SAMPLE_DURATION_PRESENT: u32 = 0x000100;

    /// sample_size が存在することを示すフラグ
    pub const FLAG_SAMPLE_SIZE_PRESENT: u32 = 0x000200;

    /// sample_flags が存在することを示すフラグ
    pub const FLAG_SAMPLE_FLAGS_PRESENT: u32 = 0x000400;

    /// sample_composition_time_offset が存在することを示すフラグ
    pub const FLAG_SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT: u32 = 0x000800;

    /// ランの内容が矛盾していないかを確認する
    ///
    /// 以下の場合には [`ErrorKind::InvalidInput`](crate::ErrorKind::InvalidInput) が返される:
    /// - first_sample_flags とサンプルごとの flags が同時に指定されている
    /// - サンプルごとに存在するフィールドの組が異なる
    pub fn validate(&self) -> Result<()> {
        with_box_type(Self::TYPE, || {
            let fields = self.sample_fields();
            if self.first_sample_flags.is_some() && fields & Self::FLAG_SAMPLE_FLAGS_PRESENT != 0 {
                return Err(Error::invalid_input(
                    "first-sample-flags-present and sample-flags-present are both set",
                ));
            }
            if let Some(i) = self.samples.iter().position(|s| s.fields() != fields) {
                return Err(Error::invalid_input(format!(
                    "Sample #{i} of the run carries a different set of fields (0x{:06x}) from the first sample (0x{fields:06x})",
                    self.samples[i].fields()
                )));
            }
            Ok(())
        })
    }

    /// 既定値を適用して、このランに含まれる各サンプルの情報を返す
    pub fn resolve(&self, defaults: &TrackFragmentDefaults) -> Result<Vec<ResolvedSample>> {
        self.validate()?;
        let mut resolved = crate::codec::try_vec_with_capacity(self.samples.len())?;
        for (i, s) in self.samples.iter().enumerate() {
            let flags = s
                .flags
                .or(self.first_sample_flags.filter(|_| i == 0))
                .unwrap_or(defaults.sample_flags);
            resolved.push(ResolvedSample {
                duration: s.duration.unwrap_or(defaults.sample_duration),
                size: s.size.unwrap_or(defaults.sample_size),
                flags,
                composition_offset: s.composition_time_offset.unwrap_or(0),
                description_index: defaults.sample_description_index,
                is_sync: !flags.sample_is_non_sync_sample(),
            });
        }
        Ok(resolved)
    }

    /// ラン内のサンプルのサイズの合計値
    pub fn data_size(&self, defaults: &TrackFragmentDefaults) -> u64 {
        self.samples
            .iter()
            .map(|s| s.size.unwrap_or(defaults.sample_size) as u64)
            .sum()
    }

    fn sample_fields(&self) -> u32 {
        self.samples.first().map_or(0, TrunSample::fields)
    }

    fn sample_entry_size(fields: u32) -> usize {
        fields.count_ones() as usize * 4
    }

    fn check_offset_range(&self) -> Result<()> {
        let version = self.full_box_version();
        let out_of_range = self.samples.iter().filter_map(|s| s.composition_time_offset).find(|&v| {
            if version == 1 {
                i32::try_from(v).is_err()
            } else {
                u32::try_from(v).is_err()
            }
        });
        match out_of_range {
            Some(v) => Err(Error::unsupported(format!(
                "Composition time offset {v} cannot be stored in a version {version} trun box"
            ))),
            None => Ok(()),
        }
    }

    fn payload_size(&self) -> Result<usize> {
        self.validate()?;
        self.check_offset_range()?;
        let per_sample = Self::sample_entry_size(self.sample_fields());
        Ok(4 + 4
            + self.data_offset.map_or(0, |_| 4)
            + self.first_sample_flags.map_or(0, |_| 4)
            + per_sample * self.samples.len())
    }
}

impl Encode for TrunBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let version = self.full_box_version();
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += entry_count_u32(self.samples.len(), "trun")?.encode(&mut buf[offset..])?;
            if let Some(v) = self.data_offset {
                offset += v.encode(&mut buf[offset..])?;
            }
            if let Some(v) = self.first_sample_flags {
                offset += v.encode(&mut buf[offset..])?;
            }
            for s in &self.samples {
                if let Some(v) = s.duration {
                    offset += v.encode(&mut buf[offset..])?;
                }
                if let Some(v) = s.size {
                    offset += v.encode(&mut buf[offset..])?;
                }
                if let Some(v) = s.flags {
                    offset += v.encode(&mut buf[offset..])?;
                }
                if let Some(v) = s.composition_time_offset {
                    if version == 1 {
                        offset += (v as i32).encode(&mut buf[offset..])?;
                    } else {
                        offset += (v as u32).encode(&mut buf[offset..])?;
                    }
                }
            }
            Ok(offset)
        })
    }
}

impl Decode for TrunBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let flags = full_header.flags;
            let sample_count = u32::decode_at(payload, &mut offset)? as usize;

            let data_offset = if flags.contains(Self::FLAG_DATA_OFFSET_PRESENT) {
                Some(i32::decode_at(payload, &mut offset)?)
            } else {
                None
            };
            let first_sample_flags = if flags.contains(Self::FLAG_FIRST_SAMPLE_FLAGS_PRESENT) {
                Some(SampleFlags::decode_at(payload, &mut offset)?)
            } else {
                None
            };

            let fields = flags.get() & TrunSample::FIELD_MASK;
            let samples = decode_entries(
                payload,
                &mut offset,
                sample_count,
                Self::sample_entry_size(fields),
                |buf, offset| TrunSample::decode_fields(buf, offset, fields, full_header.version),
            )?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            let this = Self {
                data_offset,
                first_sample_flags,
                samples,
            };
            this.validate()?;
            Ok((this, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for TrunBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for TrunBox {
    fn full_box_version(&self) -> u8 {
        let negative = self
            .samples
            .iter()
            .any(|s| s.composition_time_offset.is_some_and(|v| v < 0));
        u8::from(negative)
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        let mut flags = self.sample_fields();
        if self.data_offset.is_some() {
            flags |= Self::FLAG_DATA_OFFSET_PRESENT;
        }
        if self.first_sample_flags.is_some() {
            flags |= Self::FLAG_FIRST_SAMPLE_FLAGS_PRESENT;
        }
        FullBoxFlags::new(flags)
    }
}

/// [`TrunBox`] に含まれるサンプル一つ分の情報
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TrunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<SampleFlags>,

    /// バージョン 0 では符号なし、バージョン 1 では符号つきの 32 bit 値として格納される
    pub composition_time_offset: Option<i64>,
}

impl TrunSample {
    const FIELD_MASK: u32 = TrunBox::FLAG_SAMPLE_DURATION_PRESENT
        | TrunBox::FLAG_SAMPLE_SIZE_PRESENT
        | TrunBox::FLAG_SAMPLE_FLAGS_PRESENT
        | TrunBox::FLAG_SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT;

    fn fields(&self) -> u32 {
        let mut fields = 0;
        if self.duration.is_some() {
            fields |= TrunBox::FLAG_SAMPLE_DURATION_PRESENT;
        }
        if self.size.is_some() {
            fields |= TrunBox::FLAG_SAMPLE_SIZE_PRESENT;
        }
        if self.flags.is_some() {
            fields |= TrunBox::FLAG_SAMPLE_FLAGS_PRESENT;
        }
        if self.composition_time_offset.is_some() {
            fields |= TrunBox::FLAG_SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT;
        }
        fields
    }

    fn decode_fields(buf: &[u8], offset: &mut usize, fields: u32, version: u8) -> Result<Self> {
        let mut this = Self::default();
        if fields & TrunBox::FLAG_SAMPLE_DURATION_PRESENT != 0 {
            this.duration = Some(u32::decode_at(buf, offset)?);
        }
        if fields & TrunBox::FLAG_SAMPLE_SIZE_PRESENT != 0 {
            this.size = Some(u32::decode_at(buf, offset)?);
        }
        if fields & TrunBox::FLAG_SAMPLE_FLAGS_PRESENT != 0 {
            this.flags = Some(SampleFlags::decode_at(buf, offset)?);
        }
        if fields & TrunBox::FLAG_SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT != 0 {
            this.composition_time_offset = Some(if version == 1 {
                i32::decode_at(buf, offset)? as i64
            } else {
                u32::decode_at(buf, offset)? as i64
            });
        }
        Ok(this)
    }
}

/// trex の既定値に tfhd の上書き値を重ねた、トラックフラグメント単位の既定値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TrackFragmentDefaults {
    pub sample_description_index: u32,
    pub sample_duration: u32,
    pub sample_size: u32,
    pub sample_flags: SampleFlags,
}

impl TrackFragmentDefaults {
    /// tfhd で指定された値を優先し、省略された値は trex から補う
    pub fn resolve(trex: &TrexBox, tfhd: &TfhdBox) -> Self {
        Self {
            sample_description_index: tfhd
                .sample_description_index
                .unwrap_or(trex.default_sample_description_index),
            sample_duration: tfhd
                .default_sample_duration
                .unwrap_or(trex.default_sample_duration),
            sample_size: tfhd.default_sample_size.unwrap_or(trex.default_sample_size),
            sample_flags: tfhd
                .default_sample_flags
                .unwrap_or(trex.default_sample_flags),
        }
    }
}

/// 既定値を適用した後の、フラグメント内のサンプル一つ分の情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ResolvedSample {
    pub duration: u32,
    pub size: u32,
    pub flags: SampleFlags,
    pub composition_offset: i64,
    pub description_index: u32,
    pub is_sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn size_only_run(sizes: &[u32]) -> TrunBox {
        TrunBox {
            data_offset: Some(0),
            first_sample_flags: None,
            samples: sizes
                .iter()
                .map(|&size| TrunSample {
                    size: Some(size),
                    ..TrunSample::default()
                })
                .collect(),
        }
    }

    #[test]
    fn trun_flags_follow_present_fields() {
        let trun = size_only_run(&[10, 20, 30]);
        assert_eq!(
            trun.full_box_flags().get(),
            TrunBox::FLAG_DATA_OFFSET_PRESENT | TrunBox::FLAG_SAMPLE_SIZE_PRESENT
        );
        assert_eq!(trun.full_box_version(), 0);
        let bytes = trun.encode_to_vec().expect("encode");
        assert_eq!(bytes.len(), 8 + 4 + 4 + 4 + 3 * 4);
        assert_eq!(TrunBox::decode(&bytes).expect("decode").0, trun);
    }

    #[test]
    fn trun_negative_offset_selects_version_1() {
        let mut trun = TrunBox::default();
        trun.samples.push(TrunSample {
            composition_time_offset: Some(-512),
            ..TrunSample::default()
        });
        assert_eq!(trun.full_box_version(), 1);
        let bytes = trun.encode_to_vec().expect("encode");
        assert_eq!(bytes[8], 1);
        assert_eq!(TrunBox::decode(&bytes).expect("decode").0, trun);

        trun.samples[0].composition_time_offset = Some(i64::from(i32::MIN) - 1);
        let err = trun.encode_to_vec().expect_err("out of range");
        assert_eq!(err.kind, ErrorKind::UnsupportedRepresentation);
    }

    #[test]
    fn trun_first_sample_flags_conflict_is_rejected() {
        let trun = TrunBox {
            data_offset: None,
            first_sample_flags: Some(SampleFlags::from_sync(true)),
            samples: vec![TrunSample {
                flags: Some(SampleFlags::from_sync(false)),
                ..TrunSample::default()
            }],
        };
        assert_eq!(trun.validate().expect_err("conflict").kind, ErrorKind::InvalidInput);
        assert_eq!(trun.encode_to_vec().expect_err("conflict").kind, ErrorKind::InvalidInput);

        let bytes = [
            0, 0, 0, 24, b't', b'r', b'u', b'n', 0, 0, 0x04, 0x04, 0, 0, 0, 1, 0, 0, 0, 0, 0, 1, 0,
            0,
        ];
        let err = TrunBox::decode(&bytes).expect_err("conflict");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn trun_with_mixed_sample_fields_is_rejected() {
        let mut trun = size_only_run(&[1, 2]);
        trun.samples[1].duration = Some(3);
        assert_eq!(trun.validate().expect_err("mixed").kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn traf_with_conflicting_run_is_rejected() {
        let mut traf = TrafBox {
            tfhd_box: Some(TfhdBox::new(1)),
            ..TrafBox::default()
        };
        traf.trun_boxes.push(size_only_run(&[1]));
        let bytes = traf.encode_to_vec().expect("encode");
        assert_eq!(TrafBox::decode(&bytes).expect("decode").0, traf);

        let mut bytes = vec![0, 0, 0, 48, b't', b'r', b'a', b'f'];
        bytes.extend_from_slice(&TfhdBox::new(1).encode_to_vec().expect("encode"));
        bytes.extend_from_slice(&[
            0, 0, 0, 24, b't', b'r', b'u', b'n', 0, 0, 0x04, 0x04, 0, 0, 0, 1, 0, 0, 0, 0, 0, 1, 0,
            0,
        ]);
        let err = TrafBox::decode(&bytes).expect_err("conflict");
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        traf.trun_boxes[0].first_sample_flags = Some(SampleFlags::empty());
        traf.trun_boxes[0].samples[0].flags = Some(SampleFlags::empty());
        assert_eq!(traf.validate().expect_err("conflict").kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn tfhd_optional_fields() {
        let mut tfhd = TfhdBox::new(2);
        assert_eq!(tfhd.encoded_size().expect("size"), 16);

        tfhd.base_data_offset = Some(1 << 40);
        tfhd.default_sample_duration = Some(1000);
        tfhd.default_base_is_moof = true;
        assert_eq!(tfhd.full_box_flags().get(), 0x020009);
        let bytes = tfhd.encode_to_vec().expect("encode");
        assert_eq!(bytes.len(), 16 + 8 + 4);
        assert_eq!(TfhdBox::decode(&bytes).expect("decode").0, tfhd);
    }

    #[test]
    fn size_only_run_uses_trex_default_duration() {
        let mut trex = TrexBox::new(2);
        trex.default_sample_duration = 1024;
        trex.default_sample_flags = SampleFlags::from_sync(false);
        let traf = TrafBox {
            tfhd_box: Some(TfhdBox::new(2)),
            trun_boxes: vec![size_only_run(&[100, 200, 300])],
            ..TrafBox::default()
        };

        let samples = traf.resolve_samples(&trex).expect("resolve");
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.duration == 1024));
        assert!(samples.iter().all(|s| !s.is_sync));
        assert_eq!(
            samples.iter().map(|s| s.size).collect::<Vec<_>>(),
            [100, 200, 300]
        );
    }

    #[test]
    fn tfhd_overrides_trex_and_first_sample_flags_apply_once() {
        let trex = TrexBox::new(1);
        let mut tfhd = TfhdBox::new(1);
        tfhd.default_sample_duration = Some(3000);
        tfhd.default_sample_flags = Some(SampleFlags::from_sync(false));
        tfhd.sample_description_index = Some(2);

        let mut trun = size_only_run(&[5, 6]);
        trun.first_sample_flags = Some(SampleFlags::from_sync(true));
        let traf = TrafBox {
            tfhd_box: Some(tfhd),
            trun_boxes: vec![trun],
            ..TrafBox::default()
        };

        let samples = traf.resolve_samples(&trex).expect("resolve");
        assert!(samples[0].is_sync);
        assert!(!samples[1].is_sync);
        assert!(samples.iter().all(|s| s.duration == 3000 && s.description_index == 2));
    }

    #[test]
    fn moof_requires_mfhd() {
        let moof = MoofBox::default();
        let err = moof.encode_to_vec().expect_err("missing mfhd");
        assert_eq!(err.kind, ErrorKind::MissingMandatoryBox);

        let moof = MoofBox {
            mfhd_box: Some(MfhdBox { sequence_number: 7 }),
            ..MoofBox::default()
        };
        let bytes = moof.encode_to_vec().expect("encode");
        assert_eq!(MoofBox::decode(&bytes).expect("decode").0, moof);
    }

    #[test]
    fn mehd_and_tfdt_versions() {
        let mehd = MehdBox {
            fragment_duration: u32::MAX as u64 + 1,
        };
        let bytes = mehd.encode_to_vec().expect("encode");
        assert_eq!(bytes.len(), 20);
        assert_eq!(MehdBox::decode(&bytes).expect("decode").0, mehd);

        let tfdt = TfdtBox {
            base_media_decode_time: 90000,
        };
        assert_eq!(tfdt.encoded_size().expect("size"), 16);
    }
}
