//! moov 以下のボックスツリー（トラック・メディア・メディア情報など）の定義
use std::num::NonZeroU32;

use crate::{
    BaseBox, BoxHeader, BoxType, ContainerBox, Decode, Encode, Error, FixedPointNumber, FullBox,
    FullBoxFlags, FullBoxHeader, Mp4FileTime, Result,
    basic_types::as_box_object,
    boxes::{
        AnyBox, MvexBox, StblBox, box_size, check_mandatory_box, copy_payload, decode_children,
        decode_container, encode_all, encode_box, note_trailing_bytes, required, required_mut,
        route_other_box, set_singleton, sum_sizes, version_for_values, with_box_type,
    },
    codec::{decode_entries, entry_count_u32, try_push},
};

/// [ISO/IEC 14496-12] MovieBox class
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MoovBox {
    pub mvhd_box: Option<MvhdBox>,
    pub iods_box: Option<IodsBox>,
    pub trak_boxes: Vec<TrakBox>,
    pub mvex_box: Option<MvexBox>,
    pub udta_box: Option<UdtaBox>,
    pub meta_box: Option<MetaBox>,
    pub other_boxes: Vec<AnyBox>,
}

impl MoovBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"moov");

    /// mvhd ボックスへの参照を返す
    pub fn mvhd(&self) -> Result<&MvhdBox> {
        required(&self.mvhd_box, MvhdBox::TYPE, Self::TYPE)
    }

    /// mvhd ボックスへの可変参照を返す
    pub fn mvhd_mut(&mut self) -> Result<&mut MvhdBox> {
        required_mut(&mut self.mvhd_box, MvhdBox::TYPE, Self::TYPE)
    }

    /// 指定された ID を持つトラックを返す
    pub fn track(&self, track_id: u32) -> Option<&TrakBox> {
        self.trak_boxes
            .iter()
            .find(|t| t.track_id() == Some(track_id))
    }

    /// 指定された ID を持つトラックへの可変参照を返す
    pub fn track_mut(&mut self, track_id: u32) -> Option<&mut TrakBox> {
        self.trak_boxes
            .iter_mut()
            .find(|t| t.track_id() == Some(track_id))
    }

    fn payload_size(&self) -> Result<usize> {
        self.check_mandatory_boxes()?;
        Ok(sum_sizes(&self.mvhd_box)?
            + sum_sizes(&self.iods_box)?
            + sum_sizes(&self.trak_boxes)?
            + sum_sizes(&self.mvex_box)?
            + sum_sizes(&self.udta_box)?
            + sum_sizes(&self.meta_box)?
            + sum_sizes(&self.other_boxes)?)
    }
}

impl Encode for MoovBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = 0;
            offset += encode_all(&self.mvhd_box, &mut buf[offset..])?;
            offset += encode_all(&self.iods_box, &mut buf[offset..])?;
            offset += encode_all(&self.trak_boxes, &mut buf[offset..])?;
            offset += encode_all(&self.mvex_box, &mut buf[offset..])?;
            offset += encode_all(&self.udta_box, &mut buf[offset..])?;
            offset += encode_all(&self.meta_box, &mut buf[offset..])?;
            offset += encode_all(&self.other_boxes, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for MoovBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_container(Self::TYPE, buf)
    }
}

impl BaseBox for MoovBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::empty()
                .chain(self.mvhd_box.iter().map(as_box_object))
                .chain(self.iods_box.iter().map(as_box_object))
                .chain(self.trak_boxes.iter().map(as_box_object))
                .chain(self.mvex_box.iter().map(as_box_object))
                .chain(self.udta_box.iter().map(as_box_object))
                .chain(self.meta_box.iter().map(as_box_object))
                .chain(self.other_boxes.iter().map(as_box_object)),
        )
    }
}

impl ContainerBox for MoovBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[MvhdBox::TYPE];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        match child {
            AnyBox::Mvhd(b) => set_singleton(&mut self.mvhd_box, b, Self::TYPE),
            AnyBox::Iods(b) => set_singleton(&mut self.iods_box, b, Self::TYPE),
            AnyBox::Trak(b) => try_push(&mut self.trak_boxes, b),
            AnyBox::Mvex(b) => set_singleton(&mut self.mvex_box, b, Self::TYPE),
            AnyBox::Udta(b) => set_singleton(&mut self.udta_box, b, Self::TYPE),
            AnyBox::Meta(b) => set_singleton(&mut self.meta_box, b, Self::TYPE),
            other => route_other_box(&mut self.other_boxes, other, Self::TYPE),
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        check_mandatory_box(&self.mvhd_box, MvhdBox::TYPE, Self::TYPE)
    }
}

/// [ISO/IEC 14496-12] MovieHeaderBox class (親: [`MoovBox`])
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MvhdBox {
    pub creation_time: Mp4FileTime,
    pub modification_time: Mp4FileTime,
    pub timescale: NonZeroU32,
    pub duration: u64,
    pub rate: FixedPointNumber<i16, u16>,
    pub volume: FixedPointNumber<i8, u8>,
    pub matrix: [i32; 9],
    pub next_track_id: u32,
}

impl MvhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mvhd");

    /// [`MvhdBox::rate`] のデフォルト値（通常の再生速度）
    pub const DEFAULT_RATE: FixedPointNumber<i16, u16> = FixedPointNumber::new(1, 0);

    /// [`MvhdBox::volume`] のデフォルト値（最大音量）
    pub const DEFAULT_VOLUME: FixedPointNumber<i8, u8> = FixedPointNumber::new(1, 0);

    /// [`MvhdBox::matrix`] のデフォルト値
    pub const DEFAULT_MATRIX: [i32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

    /// [`MvhdBox::timescale`] のデフォルト値
    pub const DEFAULT_TIMESCALE: NonZeroU32 = match NonZeroU32::new(600) {
        Some(v) => v,
        None => NonZeroU32::MIN,
    };

    fn payload_size(&self) -> usize {
        let times = if self.full_box_version() == 1 { 28 } else { 16 };
        4 + times + 4 + 2 + 10 + 36 + 24 + 4
    }
}

impl Default for MvhdBox {
    fn default() -> Self {
        Self {
            creation_time: Mp4FileTime::default(),
            modification_time: Mp4FileTime::default(),
            timescale: Self::DEFAULT_TIMESCALE,
            duration: 0,
            rate: Self::DEFAULT_RATE,
            volume: Self::DEFAULT_VOLUME,
            matrix: Self::DEFAULT_MATRIX,
            next_track_id: 1,
        }
    }
}

impl Encode for MvhdBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            if self.full_box_version() == 1 {
                offset += self.creation_time.as_secs().encode(&mut buf[offset..])?;
                offset += self
                    .modification_time
                    .as_secs()
                    .encode(&mut buf[offset..])?;
                offset += self.timescale.encode(&mut buf[offset..])?;
                offset += self.duration.encode(&mut buf[offset..])?;
            } else {
                offset += (self.creation_time.as_secs() as u32).encode(&mut buf[offset..])?;
                offset += (self.modification_time.as_secs() as u32).encode(&mut buf[offset..])?;
                offset += self.timescale.encode(&mut buf[offset..])?;
                offset += (self.duration as u32).encode(&mut buf[offset..])?;
            }
            offset += self.rate.encode(&mut buf[offset..])?;
            offset += self.volume.encode(&mut buf[offset..])?;
            offset += [0u8; 2 + 4 * 2].encode(&mut buf[offset..])?;
            offset += self.matrix.encode(&mut buf[offset..])?;
            offset += [0u8; 4 * 6].encode(&mut buf[offset..])?;
            offset += self.next_track_id.encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for MvhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let mut this = Self::default();

            if full_header.version == 1 {
                this.creation_time =
                    u64::decode_at(payload, &mut offset).map(Mp4FileTime::from_secs)?;
                this.modification_time =
                    u64::decode_at(payload, &mut offset).map(Mp4FileTime::from_secs)?;
                this.timescale = NonZeroU32::decode_at(payload, &mut offset)?;
                this.duration = u64::decode_at(payload, &mut offset)?;
            } else {
                this.creation_time = u32::decode_at(payload, &mut offset)
                    .map(|v| Mp4FileTime::from_secs(v as u64))?;
                this.modification_time = u32::decode_at(payload, &mut offset)
                    .map(|v| Mp4FileTime::from_secs(v as u64))?;
                this.timescale = NonZeroU32::decode_at(payload, &mut offset)?;
                this.duration = u32::decode_at(payload, &mut offset).map(|v| v as u64)?;
            }

            this.rate = FixedPointNumber::decode_at(payload, &mut offset)?;
            this.volume = FixedPointNumber::decode_at(payload, &mut offset)?;
            let _ = <[u8; 2 + 4 * 2]>::decode_at(payload, &mut offset)?;
            this.matrix = <[i32; 9]>::decode_at(payload, &mut offset)?;
            let _ = <[u8; 4 * 6]>::decode_at(payload, &mut offset)?;
            this.next_track_id = u32::decode_at(payload, &mut offset)?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((this, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for MvhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for MvhdBox {
    fn full_box_version(&self) -> u8 {
        version_for_values([
            self.creation_time.as_secs(),
            self.modification_time.as_secs(),
            self.duration,
        ])
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-14] ObjectDescriptorBox class (親: [`MoovBox`])
///
/// 中身の記述子はこのライブラリでは解釈せず、バイト列のまま保持する
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct IodsBox {
    pub descriptor: Vec<u8>,
}

impl IodsBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"iods");
}

impl Encode for IodsBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, 4 + self.descriptor.len()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, 4 + self.descriptor.len(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += self.descriptor.encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for IodsBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let descriptor = copy_payload(&payload[offset..])?;
            Ok((Self { descriptor }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for IodsBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for IodsBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] TrackBox class (親: [`MoovBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TrakBox {
    pub tkhd_box: Option<TkhdBox>,
    pub tref_box: Option<TrefBox>,
    pub edts_box: Option<EdtsBox>,
    pub mdia_box: Option<MdiaBox>,
    pub udta_box: Option<UdtaBox>,
    pub meta_box: Option<MetaBox>,
    pub other_boxes: Vec<AnyBox>,
}

impl TrakBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"trak");

    /// トラック ID を返す（tkhd ボックスが存在しない場合は `None`）
    pub fn track_id(&self) -> Option<u32> {
        self.tkhd_box.as_ref().map(|b| b.track_id)
    }

    /// tkhd ボックスへの参照を返す
    pub fn tkhd(&self) -> Result<&TkhdBox> {
        required(&self.tkhd_box, TkhdBox::TYPE, Self::TYPE)
    }

    /// tkhd ボックスへの可変参照を返す
    pub fn tkhd_mut(&mut self) -> Result<&mut TkhdBox> {
        required_mut(&mut self.tkhd_box, TkhdBox::TYPE, Self::TYPE)
    }

    /// mdia ボックスへの参照を返す
    pub fn mdia(&self) -> Result<&MdiaBox> {
        required(&self.mdia_box, MdiaBox::TYPE, Self::TYPE)
    }

    /// mdia ボックスへの可変参照を返す
    pub fn mdia_mut(&mut self) -> Result<&mut MdiaBox> {
        required_mut(&mut self.mdia_box, MdiaBox::TYPE, Self::TYPE)
    }

    /// このトラックのサンプルテーブルを返す
    pub fn stbl(&self) -> Result<&StblBox> {
        self.mdia()?.minf()?.stbl()
    }

    /// このトラックのサンプルテーブルへの可変参照を返す
    pub fn stbl_mut(&mut self) -> Result<&mut StblBox> {
        self.mdia_mut()?.minf_mut()?.stbl_mut()
    }

    fn payload_size(&self) -> Result<usize> {
        self.check_mandatory_boxes()?;
        Ok(sum_sizes(&self.tkhd_box)?
            + sum_sizes(&self.tref_box)?
            + sum_sizes(&self.edts_box)?
            + sum_sizes(&self.mdia_box)?
            + sum_sizes(&self.udta_box)?
            + sum_sizes(&self.meta_box)?
            + sum_sizes(&self.other_boxes)?)
    }
}

impl Encode for TrakBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = 0;
            offset += encode_all(&self.tkhd_box, &mut buf[offset..])?;
            offset += encode_all(&self.tref_box, &mut buf[offset..])?;
            offset += encode_all(&self.edts_box, &mut buf[offset..])?;
            offset += encode_all(&self.mdia_box, &mut buf[offset..])?;
            offset += encode_all(&self.udta_box, &mut buf[offset..])?;
            offset += encode_all(&self.meta_box, &mut buf[offset..])?;
            offset += encode_all(&self.other_boxes, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for TrakBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_container(Self::TYPE, buf)
    }
}

impl BaseBox for TrakBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::empty()
                .chain(self.tkhd_box.iter().map(as_box_object))
                .chain(self.tref_box.iter().map(as_box_object))
                .chain(self.edts_box.iter().map(as_box_object))
                .chain(self.mdia_box.iter().map(as_box_object))
                .chain(self.udta_box.iter().map(as_box_object))
                .chain(self.meta_box.iter().map(as_box_object))
                .chain(self.other_boxes.iter().map(as_box_object)),
        )
    }
}

impl ContainerBox for TrakBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[TkhdBox::TYPE, MdiaBox::TYPE];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        match child {
            AnyBox::Tkhd(b) => set_singleton(&mut self.tkhd_box, b, Self::TYPE),
            AnyBox::Tref(b) => set_singleton(&mut self.tref_box, b, Self::TYPE),
            AnyBox::Edts(b) => set_singleton(&mut self.edts_box, b, Self::TYPE),
            AnyBox::Mdia(b) => set_singleton(&mut self.mdia_box, b, Self::TYPE),
            AnyBox::Udta(b) => set_singleton(&mut self.udta_box, b, Self::TYPE),
            AnyBox::Meta(b) => set_singleton(&mut self.meta_box, b, Self::TYPE),
            other => route_other_box(&mut self.other_boxes, other, Self::TYPE),
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        check_mandatory_box(&self.tkhd_box, TkhdBox::TYPE, Self::TYPE)?;
        check_mandatory_box(&self.mdia_box, MdiaBox::TYPE, Self::TYPE)
    }
}

/// [ISO/IEC 14496-12] TrackHeaderBox class (親: [`TrakBox`])
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TkhdBox {
    pub flag_track_enabled: bool,
    pub flag_track_in_movie: bool,
    pub flag_track_in_preview: bool,
    pub flag_track_size_is_aspect_ratio: bool,

    pub creation_time: Mp4FileTime,
    pub modification_time: Mp4FileTime,
    pub track_id: u32,
    pub duration: u64,
    pub layer: i16,
    pub alternate_group: i16,
    pub volume: FixedPointNumber<i8, u8>,
    pub matrix: [i32; 9],
    pub width: FixedPointNumber<i16, u16>,
    pub height: FixedPointNumber<i16, u16>,
}

impl TkhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"tkhd");

    /// [`TkhdBox::layer`] のデフォルト値
    pub const DEFAULT_LAYER: i16 = 0;

    /// [`TkhdBox::alternate_group`] のデフォルト値
    pub const DEFAULT_ALTERNATE_GROUP: i16 = 0;

    /// 音声用の [`TkhdBox::volume`] のデフォルト値（最大音量）
    pub const DEFAULT_AUDIO_VOLUME: FixedPointNumber<i8, u8> = FixedPointNumber::new(1, 0);

    /// 映像用の [`TkhdBox::volume`] のデフォルト値（無音）
    pub const DEFAULT_VIDEO_VOLUME: FixedPointNumber<i8, u8> = FixedPointNumber::new(0, 0);

    /// [`TkhdBox::matrix`] のデフォルト値
    pub const DEFAULT_MATRIX: [i32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

    /// 指定されたトラック ID を持つ、有効化済みのトラックヘッダーを作成する
    pub fn new(track_id: u32) -> Self {
        Self {
            flag_track_enabled: true,
            flag_track_in_movie: true,
            flag_track_in_preview: false,
            flag_track_size_is_aspect_ratio: false,
            creation_time: Mp4FileTime::default(),
            modification_time: Mp4FileTime::default(),
            track_id,
            duration: 0,
            layer: Self::DEFAULT_LAYER,
            alternate_group: Self::DEFAULT_ALTERNATE_GROUP,
            volume: Self::DEFAULT_VIDEO_VOLUME,
            matrix: Self::DEFAULT_MATRIX,
            width: FixedPointNumber::new(0, 0),
            height: FixedPointNumber::new(0, 0),
        }
    }

    fn payload_size(&self) -> usize {
        let times = if self.full_box_version() == 1 { 32 } else { 20 };
        4 + times + 8 + 8 + 36 + 8
    }
}

impl Encode for TkhdBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            if self.full_box_version() == 1 {
                offset += self.creation_time.as_secs().encode(&mut buf[offset..])?;
                offset += self
                    .modification_time
                    .as_secs()
                    .encode(&mut buf[offset..])?;
                offset += self.track_id.encode(&mut buf[offset..])?;
                offset += [0u8; 4].encode(&mut buf[offset..])?;
                offset += self.duration.encode(&mut buf[offset..])?;
            } else {
                offset += (self.creation_time.as_secs() as u32).encode(&mut buf[offset..])?;
                offset += (self.modification_time.as_secs() as u32).encode(&mut buf[offset..])?;
                offset += self.track_id.encode(&mut buf[offset..])?;
                offset += [0u8; 4].encode(&mut buf[offset..])?;
                offset += (self.duration as u32).encode(&mut buf[offset..])?;
            }
            offset += [0u8; 4 * 2].encode(&mut buf[offset..])?;
            offset += self.layer.encode(&mut buf[offset..])?;
            offset += self.alternate_group.encode(&mut buf[offset..])?;
            offset += self.volume.encode(&mut buf[offset..])?;
            offset += [0u8; 2].encode(&mut buf[offset..])?;
            offset += self.matrix.encode(&mut buf[offset..])?;
            offset += self.width.encode(&mut buf[offset..])?;
            offset += self.height.encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for TkhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let full_header = FullBoxHeader::decode_at(payload, &mut offset)?;

            let mut this = Self::new(0);
            this.flag_track_enabled = full_header.flags.is_set(0);
            this.flag_track_in_movie = full_header.flags.is_set(1);
            this.flag_track_in_preview = full_header.flags.is_set(2);
            this.flag_track_size_is_aspect_ratio = full_header.flags.is_set(3);

            if full_header.version == 1 {
                this.creation_time =
                    u64::decode_at(payload, &mut offset).map(Mp4FileTime::from_secs)?;
                this.modification_time =
                    u64::decode_at(payload, &mut offset).map(Mp4FileTime::from_secs)?;
                this.track_id = u32::decode_at(payload, &mut offset)?;
                let _ = <[u8; 4]>::decode_at(payload, &mut offset)?;
                this.duration = u64::decode_at(payload, &mut offset)?;
            } else {
                this.creation_time = u32::decode_at(payload, &mut offset)
                    .map(|v| Mp4FileTime::from_secs(v as u64))?;
                this.modification_time = u32::decode_at(payload, &mut offset)
                    .map(|v| Mp4FileTime::from_secs(v as u64))?;
                this.track_id = u32::decode_at(payload, &mut offset)?;
                let _ = <[u8; 4]>::decode_at(payload, &mut offset)?;
                this.duration = u32::decode_at(payload, &mut offset).map(|v| v as u64)?;
            }

            let _ = <[u8; 4 * 2]>::decode_at(payload, &mut offset)?;
            this.layer = i16::decode_at(payload, &mut offset)?;
            this.alternate_group = i16::decode_at(payload, &mut offset)?;
            this.volume = FixedPointNumber::decode_at(payload, &mut offset)?;
            let _ = <[u8; 2]>::decode_at(payload, &mut offset)?;
            this.matrix = <[i32; 9]>::decode_at(payload, &mut offset)?;
            this.width = FixedPointNumber::decode_at(payload, &mut offset)?;
            this.height = FixedPointNumber::decode_at(payload, &mut offset)?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((this, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for TkhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for TkhdBox {
    fn full_box_version(&self) -> u8 {
        version_for_values([
            self.creation_time.as_secs(),
            self.modification_time.as_secs(),
            self.duration,
        ])
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::from_flags([
            (0, self.flag_track_enabled),
            (1, self.flag_track_in_movie),
            (2, self.flag_track_in_preview),
            (3, self.flag_track_size_is_aspect_ratio),
        ])
    }
}

/// [ISO/IEC 14496-12] TrackReferenceBox class (親: [`TrakBox`])
///
/// 子ボックスの種別は参照の種類（`hint`、`cdsc` など）を表す任意の 4CC なので、
/// [`AnyBox`] を経由せずに [`TrackReferenceTypeBox`] として直接デコードする
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TrefBox {
    pub references: Vec<TrackReferenceTypeBox>,
}

impl TrefBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"tref");

    /// 指定された種別の参照リストを返す
    pub fn reference(&self, reference_type: BoxType) -> Option<&TrackReferenceTypeBox> {
        self.references
            .iter()
            .find(|r| r.reference_type == reference_type)
    }

    /// 指定された種別の参照リストにトラック ID を追加する（リストが無ければ作成する）
    pub fn add_reference(&mut self, reference_type: BoxType, track_id: u32) -> Result<()> {
        if let Some(r) = self
            .references
            .iter_mut()
            .find(|r| r.reference_type == reference_type)
        {
            return try_push(&mut r.track_ids, track_id);
        }
        try_push(
            &mut self.references,
            TrackReferenceTypeBox {
                reference_type,
                track_ids: vec![track_id],
            },
        )
    }

    /// 全ての参照リストから指定されたトラック ID を取り除き、空になったリストを削除する
    pub fn remove_track_id(&mut self, track_id: u32) {
        for r in &mut self.references {
            r.track_ids.retain(|&id| id != track_id);
        }
        self.references.retain(|r| !r.track_ids.is_empty());
    }

    fn payload_size(&self) -> Result<usize> {
        sum_sizes(&self.references)
    }
}

impl Encode for TrefBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            encode_all(&self.references, buf)
        })
    }
}

impl Decode for TrefBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let mut references = Vec::new();
            while offset < payload.len() {
                let r = TrackReferenceTypeBox::decode_at(payload, &mut offset).map_err(|e| {
                    if e.kind == crate::ErrorKind::TruncatedBox {
                        Error::invalid_file(e.reason)
                    } else {
                        e
                    }
                })?;
                try_push(&mut references, r)?;
            }
            Ok((Self { references }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for TrefBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(self.references.iter().map(as_box_object))
    }
}

/// [ISO/IEC 14496-12] TrackReferenceTypeBox class (親: [`TrefBox`])
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackReferenceTypeBox {
    /// 参照の種類（`hint`、`cdsc`、`chap` など）
    pub reference_type: BoxType,

    /// 参照先のトラック ID 群
    pub track_ids: Vec<u32>,
}

impl Encode for TrackReferenceTypeBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(self.reference_type, self.track_ids.len() * 4))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(self.reference_type, self.track_ids.len() * 4, buf, |buf| {
            encode_all(&self.track_ids, buf)
        })
    }
}

impl Decode for TrackReferenceTypeBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
        let mut offset = 0;
        let count = payload.len() / 4;
        let track_ids = decode_entries(payload, &mut offset, count, 4, |buf, offset| {
            u32::decode_at(buf, offset)
        })?;
        note_trailing_bytes(header.box_type, payload.len() - offset);
        Ok((
            Self {
                reference_type: header.box_type,
                track_ids,
            },
            header.external_size() + payload.len(),
        ))
    }
}

impl BaseBox for TrackReferenceTypeBox {
    fn box_type(&self) -> BoxType {
        self.reference_type
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

/// [ISO/IEC 14496-12] EditBox class (親: [`TrakBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct EdtsBox {
    pub elst_box: Option<ElstBox>,
    pub other_boxes: Vec<AnyBox>,
}

impl EdtsBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"edts");

    fn payload_size(&self) -> Result<usize> {
        Ok(sum_sizes(&self.elst_box)? + sum_sizes(&self.other_boxes)?)
    }
}

impl Encode for EdtsBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = 0;
            offset += encode_all(&self.elst_box, &mut buf[offset..])?;
            offset += encode_all(&self.other_boxes, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for EdtsBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_container(Self::TYPE, buf)
    }
}

impl BaseBox for EdtsBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::empty()
                .chain(self.elst_box.iter().map(as_box_object))
                .chain(self.other_boxes.iter().map(as_box_object)),
        )
    }
}

impl ContainerBox for EdtsBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        match child {
            AnyBox::Elst(b) => set_singleton(&mut self.elst_box, b, Self::TYPE),
            other => route_other_box(&mut self.other_boxes, other, Self::TYPE),
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        Ok(())
    }
}

/// [`ElstBox`] に含まれるエントリー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ElstEntry {
    pub edit_duration: u64,

    /// -1 の場合は空の編集（何も表示しない区間）を表す
    pub media_time: i64,
    pub media_rate: FixedPointNumber<i16, i16>,
}

/// [ISO/IEC 14496-12] EditListBox class (親: [`EdtsBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ElstBox {
    pub entries: Vec<ElstEntry>,
}

impl ElstBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"elst");

    fn payload_size(&self) -> usize {
        let entry_size = if self.full_box_version() == 1 { 20 } else { 12 };
        4 + 4 + self.entries.len() * entry_size
    }
}

impl Encode for ElstBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let count = entry_count_u32(self.entries.len(), "elst")?;
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let version = self.full_box_version();
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += count.encode(&mut buf[offset..])?;
            for entry in &self.entries {
                if version == 1 {
                    offset += entry.edit_duration.encode(&mut buf[offset..])?;
                    offset += entry.media_time.encode(&mut buf[offset..])?;
                } else {
                    offset += (entry.edit_duration as u32).encode(&mut buf[offset..])?;
                    offset += (entry.media_time as i32).encode(&mut buf[offset..])?;
                }
                offset += entry.media_rate.encode(&mut buf[offset..])?;
            }
            Ok(offset)
        })
    }
}

impl Decode for ElstBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let count = u32::decode_at(payload, &mut offset)? as usize;
            let entry_size = if full_header.version == 1 { 20 } else { 12 };
            let entries = decode_entries(payload, &mut offset, count, entry_size, |buf, offset| {
                let (edit_duration, media_time) = if full_header.version == 1 {
                    (u64::decode_at(buf, offset)?, i64::decode_at(buf, offset)?)
                } else {
                    (
                        u32::decode_at(buf, offset)? as u64,
                        i32::decode_at(buf, offset)? as i64,
                    )
                };
                let media_rate = FixedPointNumber::decode_at(buf, offset)?;
                Ok(ElstEntry {
                    edit_duration,
                    media_time,
                    media_rate,
                })
            })?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((Self { entries }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for ElstBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for ElstBox {
    fn full_box_version(&self) -> u8 {
        let media_time_is_wide = self
            .entries
            .iter()
            .any(|e| i32::try_from(e.media_time).is_err());
        if media_time_is_wide {
            1
        } else {
            version_for_values(self.entries.iter().map(|e| e.edit_duration))
        }
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] MediaBox class (親: [`TrakBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MdiaBox {
    pub mdhd_box: Option<MdhdBox>,
    pub hdlr_box: Option<HdlrBox>,
    pub minf_box: Option<MinfBox>,
    pub udta_box: Option<UdtaBox>,
    pub other_boxes: Vec<AnyBox>,
}

impl MdiaBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mdia");

    /// mdhd ボックスへの参照を返す
    pub fn mdhd(&self) -> Result<&MdhdBox> {
        required(&self.mdhd_box, MdhdBox::TYPE, Self::TYPE)
    }

    /// mdhd ボックスへの可変参照を返す
    pub fn mdhd_mut(&mut self) -> Result<&mut MdhdBox> {
        required_mut(&mut self.mdhd_box, MdhdBox::TYPE, Self::TYPE)
    }

    /// hdlr ボックスへの参照を返す
    pub fn hdlr(&self) -> Result<&HdlrBox> {
        required(&self.hdlr_box, HdlrBox::TYPE, Self::TYPE)
    }

    /// minf ボックスへの参照を返す
    pub fn minf(&self) -> Result<&MinfBox> {
        required(&self.minf_box, MinfBox::TYPE, Self::TYPE)
    }

    /// minf ボックスへの可変参照を返す
    pub fn minf_mut(&mut self) -> Result<&mut MinfBox> {
        required_mut(&mut self.minf_box, MinfBox::TYPE, Self::TYPE)
    }

    fn payload_size(&self) -> Result<usize> {
        self.check_mandatory_boxes()?;
        Ok(sum_sizes(&self.mdhd_box)?
            + sum_sizes(&self.hdlr_box)?
            + sum_sizes(&self.minf_box)?
            + sum_sizes(&self.udta_box)?
            + sum_sizes(&self.other_boxes)?)
    }
}

impl Encode for MdiaBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = 0;
            offset += encode_all(&self.mdhd_box, &mut buf[offset..])?;
            offset += encode_all(&self.hdlr_box, &mut buf[offset..])?;
            offset += encode_all(&self.minf_box, &mut buf[offset..])?;
            offset += encode_all(&self.udta_box, &mut buf[offset..])?;
            offset += encode_all(&self.other_boxes, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for MdiaBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_container(Self::TYPE, buf)
    }
}

impl BaseBox for MdiaBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::empty()
                .chain(self.mdhd_box.iter().map(as_box_object))
                .chain(self.hdlr_box.iter().map(as_box_object))
                .chain(self.minf_box.iter().map(as_box_object))
                .chain(self.udta_box.iter().map(as_box_object))
                .chain(self.other_boxes.iter().map(as_box_object)),
        )
    }
}

impl ContainerBox for MdiaBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[MdhdBox::TYPE, HdlrBox::TYPE, MinfBox::TYPE];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        match child {
            AnyBox::Mdhd(b) => set_singleton(&mut self.mdhd_box, b, Self::TYPE),
            AnyBox::Hdlr(b) => set_singleton(&mut self.hdlr_box, b, Self::TYPE),
            AnyBox::Minf(b) => set_singleton(&mut self.minf_box, b, Self::TYPE),
            AnyBox::Udta(b) => set_singleton(&mut self.udta_box, b, Self::TYPE),
            other => route_other_box(&mut self.other_boxes, other, Self::TYPE),
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        check_mandatory_box(&self.mdhd_box, MdhdBox::TYPE, Self::TYPE)?;
        check_mandatory_box(&self.hdlr_box, HdlrBox::TYPE, Self::TYPE)?;
        check_mandatory_box(&self.minf_box, MinfBox::TYPE, Self::TYPE)
    }
}

/// [ISO/IEC 14496-12] MediaHeaderBox class (親: [`MdiaBox`])
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MdhdBox {
    pub creation_time: Mp4FileTime,
    pub modification_time: Mp4FileTime,
    pub timescale: NonZeroU32,
    pub duration: u64,

    /// ISO-639-2/T language code
    pub language: [u8; 3],
}

impl MdhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mdhd");

    /// 未定義を表す言語コード
    pub const LANGUAGE_UNDEFINED: [u8; 3] = *b"und";

    /// 時間単位を指定して、長さが 0 のメディアヘッダーを作成する
    pub fn new(timescale: NonZeroU32) -> Self {
        Self {
            creation_time: Mp4FileTime::default(),
            modification_time: Mp4FileTime::default(),
            timescale,
            duration: 0,
            language: Self::LANGUAGE_UNDEFINED,
        }
    }

    fn payload_size(&self) -> usize {
        let times = if self.full_box_version() == 1 { 28 } else { 16 };
        4 + times + 2 + 2
    }

    fn packed_language(&self) -> Result<u16> {
        let mut language: u16 = 0;
        for l in &self.language {
            let Some(code) = l.checked_sub(0x60).filter(|c| *c < 0x20) else {
                return Err(Error::invalid_input(format!(
                    "Invalid language code: {:?}",
                    self.language
                )));
            };
            language = (language << 5) | code as u16;
        }
        Ok(language)
    }
}

impl Encode for MdhdBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let language = self.packed_language()?;
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            if self.full_box_version() == 1 {
                offset += self.creation_time.as_secs().encode(&mut buf[offset..])?;
                offset += self
                    .modification_time
                    .as_secs()
                    .encode(&mut buf[offset..])?;
                offset += self.timescale.encode(&mut buf[offset..])?;
                offset += self.duration.encode(&mut buf[offset..])?;
            } else {
                offset += (self.creation_time.as_secs() as u32).encode(&mut buf[offset..])?;
                offset += (self.modification_time.as_secs() as u32).encode(&mut buf[offset..])?;
                offset += self.timescale.encode(&mut buf[offset..])?;
                offset += (self.duration as u32).encode(&mut buf[offset..])?;
            }
            offset += language.encode(&mut buf[offset..])?;
            offset += [0u8; 2].encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for MdhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let mut this = Self::new(NonZeroU32::MIN);

            if full_header.version == 1 {
                this.creation_time =
                    u64::decode_at(payload, &mut offset).map(Mp4FileTime::from_secs)?;
                this.modification_time =
                    u64::decode_at(payload, &mut offset).map(Mp4FileTime::from_secs)?;
                this.timescale = NonZeroU32::decode_at(payload, &mut offset)?;
                this.duration = u64::decode_at(payload, &mut offset)?;
            } else {
                this.creation_time = u32::decode_at(payload, &mut offset)
                    .map(|v| Mp4FileTime::from_secs(v as u64))?;
                this.modification_time = u32::decode_at(payload, &mut offset)
                    .map(|v| Mp4FileTime::from_secs(v as u64))?;
                this.timescale = NonZeroU32::decode_at(payload, &mut offset)?;
                this.duration = u32::decode_at(payload, &mut offset).map(|v| v as u64)?;
            }

            let language = u16::decode_at(payload, &mut offset)?;
            this.language = [
                ((language >> 10) & 0b11111) as u8 + 0x60,
                ((language >> 5) & 0b11111) as u8 + 0x60,
                (language & 0b11111) as u8 + 0x60,
            ];
            let _ = <[u8; 2]>::decode_at(payload, &mut offset)?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((this, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for MdhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for MdhdBox {
    fn full_box_version(&self) -> u8 {
        version_for_values([
            self.creation_time.as_secs(),
            self.modification_time.as_secs(),
            self.duration,
        ])
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] HandlerBox class (親: [`MdiaBox`], [`MetaBox`])
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct HdlrBox {
    pub handler_type: [u8; 4],

    /// ハンドラ名
    ///
    /// null 終端文字列ではなく先頭にサイズバイトを格納する形式で
    /// MP4 ファイルを作成する実装が普通に存在するため、
    /// ここでは単なるバイト列として扱っている
    pub name: Vec<u8>,
}

impl HdlrBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"hdlr");

    /// 音声用のハンドラー種別
    pub const HANDLER_TYPE_SOUN: [u8; 4] = *b"soun";

    /// 映像用のハンドラー種別
    pub const HANDLER_TYPE_VIDE: [u8; 4] = *b"vide";

    /// ヒントトラック用のハンドラー種別
    pub const HANDLER_TYPE_HINT: [u8; 4] = *b"hint";

    /// メタデータ用のハンドラー種別
    pub const HANDLER_TYPE_META: [u8; 4] = *b"meta";

    fn payload_size(&self) -> usize {
        4 + 4 + 4 + 4 * 3 + self.name.len()
    }
}

impl Encode for HdlrBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += [0u8; 4].encode(&mut buf[offset..])?;
            offset += self.handler_type.encode(&mut buf[offset..])?;
            offset += [0u8; 4 * 3].encode(&mut buf[offset..])?;
            offset += self.name.encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for HdlrBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let _ = <[u8; 4]>::decode_at(payload, &mut offset)?;
            let handler_type = <[u8; 4]>::decode_at(payload, &mut offset)?;
            let _ = <[u8; 4 * 3]>::decode_at(payload, &mut offset)?;
            let name = copy_payload(&payload[offset..])?;

            Ok((
                Self { handler_type, name },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for HdlrBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for HdlrBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] MediaInformationBox class (親: [`MdiaBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MinfBox {
    pub media_header_box: Option<MediaHeaderBox>,
    pub dinf_box: Option<DinfBox>,
    pub stbl_box: Option<StblBox>,
    pub other_boxes: Vec<AnyBox>,
}

impl MinfBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"minf");

    /// stbl ボックスへの参照を返す
    pub fn stbl(&self) -> Result<&StblBox> {
        required(&self.stbl_box, StblBox::TYPE, Self::TYPE)
    }

    /// stbl ボックスへの可変参照を返す
    pub fn stbl_mut(&mut self) -> Result<&mut StblBox> {
        required_mut(&mut self.stbl_box, StblBox::TYPE, Self::TYPE)
    }

    fn payload_size(&self) -> Result<usize> {
        self.check_mandatory_boxes()?;
        Ok(sum_sizes(&self.media_header_box)?
            + sum_sizes(&self.dinf_box)?
            + sum_sizes(&self.stbl_box)?
            + sum_sizes(&self.other_boxes)?)
    }
}

impl Encode for MinfBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = 0;
            offset += encode_all(&self.media_header_box, &mut buf[offset..])?;
            offset += encode_all(&self.dinf_box, &mut buf[offset..])?;
            offset += encode_all(&self.stbl_box, &mut buf[offset..])?;
            offset += encode_all(&self.other_boxes, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for MinfBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_container(Self::TYPE, buf)
    }
}

impl BaseBox for MinfBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::empty()
                .chain(self.media_header_box.iter().map(as_box_object))
                .chain(self.dinf_box.iter().map(as_box_object))
                .chain(self.stbl_box.iter().map(as_box_object))
                .chain(self.other_boxes.iter().map(as_box_object)),
        )
    }
}

impl ContainerBox for MinfBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[StblBox::TYPE];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        let slot = &mut self.media_header_box;
        match child {
            AnyBox::Vmhd(b) => set_singleton(slot, MediaHeaderBox::Vmhd(b), Self::TYPE),
            AnyBox::Smhd(b) => set_singleton(slot, MediaHeaderBox::Smhd(b), Self::TYPE),
            AnyBox::Hmhd(b) => set_singleton(slot, MediaHeaderBox::Hmhd(b), Self::TYPE),
            AnyBox::Nmhd(b) => set_singleton(slot, MediaHeaderBox::Nmhd(b), Self::TYPE),
            AnyBox::Dinf(b) => set_singleton(&mut self.dinf_box, b, Self::TYPE),
            AnyBox::Stbl(b) => set_singleton(&mut self.stbl_box, b, Self::TYPE),
            other => route_other_box(&mut self.other_boxes, other, Self::TYPE),
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        check_mandatory_box(&self.stbl_box, StblBox::TYPE, Self::TYPE)
    }
}

/// メディア種別ごとのヘッダーボックス (親: [`MinfBox`])
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MediaHeaderBox {
    Vmhd(VmhdBox),
    Smhd(SmhdBox),
    Hmhd(HmhdBox),
    Nmhd(NmhdBox),
}

impl MediaHeaderBox {
    fn inner(&self) -> &dyn MediaHeader {
        match self {
            Self::Vmhd(b) => b,
            Self::Smhd(b) => b,
            Self::Hmhd(b) => b,
            Self::Nmhd(b) => b,
        }
    }
}

trait MediaHeader: BaseBox + Encode {}

impl<T: BaseBox + Encode> MediaHeader for T {}

impl Encode for MediaHeaderBox {
    fn encoded_size(&self) -> Result<usize> {
        self.inner().encoded_size()
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner().encode(buf)
    }
}

impl BaseBox for MediaHeaderBox {
    fn box_type(&self) -> BoxType {
        self.inner().box_type()
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

/// [ISO/IEC 14496-12] SoundMediaHeaderBox class (親: [`MinfBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct SmhdBox {
    pub balance: FixedPointNumber<i8, u8>,
}

impl SmhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"smhd");

    /// [`SmhdBox::balance`] のデフォルト値（中央）
    pub const DEFAULT_BALANCE: FixedPointNumber<i8, u8> = FixedPointNumber::new(0, 0);
}

impl Encode for SmhdBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, 8))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, 8, buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += self.balance.encode(&mut buf[offset..])?;
            offset += [0u8; 2].encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for SmhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let balance = FixedPointNumber::decode_at(payload, &mut offset)?;
            let _ = <[u8; 2]>::decode_at(payload, &mut offset)?;
            Ok((Self { balance }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for SmhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for SmhdBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] VideoMediaHeaderBox class (親: [`MinfBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct VmhdBox {
    pub graphicsmode: u16,
    pub opcolor: [u16; 3],
}

impl VmhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"vmhd");

    /// [`VmhdBox::graphicsmode`] のデフォルト値（コピー）
    pub const DEFAULT_GRAPHICSMODE: u16 = 0;

    /// [`VmhdBox::opcolor`] のデフォルト値
    pub const DEFAULT_OPCOLOR: [u16; 3] = [0, 0, 0];
}

impl Encode for VmhdBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, 12))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, 12, buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += self.graphicsmode.encode(&mut buf[offset..])?;
            offset += self.opcolor.encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for VmhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let graphicsmode = u16::decode_at(payload, &mut offset)?;
            let opcolor = <[u16; 3]>::decode_at(payload, &mut offset)?;
            Ok((
                Self {
                    graphicsmode,
                    opcolor,
                },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for VmhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for VmhdBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(1)
    }
}

/// [ISO/IEC 14496-12] HintMediaHeaderBox class (親: [`MinfBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct HmhdBox {
    pub max_pdu_size: u16,
    pub avg_pdu_size: u16,
    pub max_bitrate: u32,
    pub avg_bitrate: u32,
}

impl HmhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"hmhd");
}

impl Encode for HmhdBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, 20))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, 20, buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += self.max_pdu_size.encode(&mut buf[offset..])?;
            offset += self.avg_pdu_size.encode(&mut buf[offset..])?;
            offset += self.max_bitrate.encode(&mut buf[offset..])?;
            offset += self.avg_bitrate.encode(&mut buf[offset..])?;
            offset += [0u8; 4].encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for HmhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let this = Self {
                max_pdu_size: u16::decode_at(payload, &mut offset)?,
                avg_pdu_size: u16::decode_at(payload, &mut offset)?,
                max_bitrate: u32::decode_at(payload, &mut offset)?,
                avg_bitrate: u32::decode_at(payload, &mut offset)?,
            };
            let _ = <[u8; 4]>::decode_at(payload, &mut offset)?;
            Ok((this, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for HmhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for HmhdBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] NullMediaHeaderBox class (親: [`MinfBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct NmhdBox {
    pub flags: FullBoxFlags,
}

impl NmhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"nmhd");
}

impl Encode for NmhdBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, 4))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, 4, buf, |buf| {
            FullBoxHeader::from_box(self).encode(buf)
        })
    }
}

impl Decode for NmhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;
            let full_header = FullBoxHeader::decode(payload)?.0;
            Ok((
                Self {
                    flags: full_header.flags,
                },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for NmhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for NmhdBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        self.flags
    }
}

/// [ISO/IEC 14496-12] DataInformationBox class (親: [`MinfBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DinfBox {
    pub dref_box: Option<DrefBox>,
    pub other_boxes: Vec<AnyBox>,
}

impl DinfBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"dinf");

    /// メディアデータが同じファイル内に格納されていることを示す [`DinfBox`] を作成する
    pub fn local_file() -> Self {
        Self {
            dref_box: Some(DrefBox::local_file()),
            other_boxes: Vec::new(),
        }
    }

    fn payload_size(&self) -> Result<usize> {
        self.check_mandatory_boxes()?;
        Ok(sum_sizes(&self.dref_box)? + sum_sizes(&self.other_boxes)?)
    }
}

impl Encode for DinfBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = 0;
            offset += encode_all(&self.dref_box, &mut buf[offset..])?;
            offset += encode_all(&self.other_boxes, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for DinfBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_container(Self::TYPE, buf)
    }
}

impl BaseBox for DinfBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::empty()
                .chain(self.dref_box.iter().map(as_box_object))
                .chain(self.other_boxes.iter().map(as_box_object)),
        )
    }
}

impl ContainerBox for DinfBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[DrefBox::TYPE];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        match child {
            AnyBox::Dref(b) => set_singleton(&mut self.dref_box, b, Self::TYPE),
            other => route_other_box(&mut self.other_boxes, other, Self::TYPE),
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        check_mandatory_box(&self.dref_box, DrefBox::TYPE, Self::TYPE)
    }
}

/// [`DrefBox`] に含まれるデータエントリー
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DataEntry {
    Url(UrlBox),
    Urn(UrnBox),
}

impl Encode for DataEntry {
    fn encoded_size(&self) -> Result<usize> {
        match self {
            Self::Url(b) => b.encoded_size(),
            Self::Urn(b) => b.encoded_size(),
        }
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Url(b) => b.encode(buf),
            Self::Urn(b) => b.encode(buf),
        }
    }
}

impl BaseBox for DataEntry {
    fn box_type(&self) -> BoxType {
        match self {
            Self::Url(b) => b.box_type(),
            Self::Urn(b) => b.box_type(),
        }
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

/// [ISO/IEC 14496-12] DataReferenceBox class (親: [`DinfBox`])
///
/// データエントリー（`url ` / `urn `）以外の子ボックスは破棄される
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DrefBox {
    pub entries: Vec<DataEntry>,
}

impl DrefBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"dref");

    /// メディアデータが同じファイル内に格納されていることを示す [`DrefBox`] を作成する
    pub fn local_file() -> Self {
        Self {
            entries: vec![DataEntry::Url(UrlBox::LOCAL_FILE)],
        }
    }

    fn payload_size(&self) -> Result<usize> {
        Ok(4 + 4 + sum_sizes(&self.entries)?)
    }
}

impl Encode for DrefBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let count = entry_count_u32(self.entries.len(), "dref")?;
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += count.encode(&mut buf[offset..])?;
            offset += encode_all(&self.entries, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for DrefBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let entry_count = u32::decode_at(payload, &mut offset)?;

            let mut this = Self::default();
            decode_children(&mut this, &payload[offset..])?;
            if this.entries.len() != entry_count as usize {
                tracing::debug!(
                    declared = entry_count,
                    actual = this.entries.len(),
                    "dref entry count differs from the number of data entries"
                );
            }
            Ok((this, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for DrefBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(self.entries.iter().map(as_box_object))
    }
}

impl FullBox for DrefBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

impl ContainerBox for DrefBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        match child {
            AnyBox::Url(b) => try_push(&mut self.entries, DataEntry::Url(b)),
            AnyBox::Urn(b) => try_push(&mut self.entries, DataEntry::Urn(b)),
            other => {
                tracing::debug!(
                    box_type = %other.box_type(),
                    "dropping non data-entry box in dref"
                );
                Ok(())
            }
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        Ok(())
    }
}

/// null 終端文字列を読み込む（終端が無い場合は残り全体を文字列とみなす）
fn decode_c_string(buf: &[u8], offset: &mut usize) -> Result<Vec<u8>> {
    let rest = buf.get(*offset..).unwrap_or_default();
    let (s, consumed) = match rest.iter().position(|&b| b == 0) {
        Some(end) => (&rest[..end], end + 1),
        None => (rest, rest.len()),
    };
    *offset += consumed;
    copy_payload(s)
}

/// [ISO/IEC 14496-12] DataEntryUrlBox class (親: [`DrefBox`])
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct UrlBox {
    /// メディアデータがこのファイル自身に含まれているかどうか（flags の 0 ビット目）
    pub self_contained: bool,

    /// 終端の null 文字を含まない URL
    pub location: Vec<u8>,
}

impl UrlBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"url ");

    /// メディアデータが同じファイル内に格納されていることを示す [`UrlBox`] の値
    pub const LOCAL_FILE: Self = Self {
        self_contained: true,
        location: Vec::new(),
    };

    fn payload_size(&self) -> usize {
        if self.self_contained && self.location.is_empty() {
            4
        } else {
            4 + self.location.len() + 1
        }
    }
}

impl Encode for UrlBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            if !(self.self_contained && self.location.is_empty()) {
                offset += self.location.encode(&mut buf[offset..])?;
                offset += 0u8.encode(&mut buf[offset..])?;
            }
            Ok(offset)
        })
    }
}

impl Decode for UrlBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let location = decode_c_string(payload, &mut offset)?;
            Ok((
                Self {
                    self_contained: full_header.flags.is_set(0),
                    location,
                },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for UrlBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for UrlBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(self.self_contained as u32)
    }
}

/// [ISO/IEC 14496-12] DataEntryUrnBox class (親: [`DrefBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct UrnBox {
    pub self_contained: bool,
    pub name: Vec<u8>,
    pub location: Vec<u8>,
}

impl UrnBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"urn ");

    fn payload_size(&self) -> usize {
        4 + self.name.len() + 1 + self.location.len() + 1
    }
}

impl Encode for UrnBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += self.name.encode(&mut buf[offset..])?;
            offset += 0u8.encode(&mut buf[offset..])?;
            offset += self.location.encode(&mut buf[offset..])?;
            offset += 0u8.encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for UrnBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let name = decode_c_string(payload, &mut offset)?;
            let location = decode_c_string(payload, &mut offset)?;
            Ok((
                Self {
                    self_contained: full_header.flags.is_set(0),
                    name,
                    location,
                },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for UrnBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for UrnBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(self.self_contained as u32)
    }
}

/// [ISO/IEC 14496-12] UserDataBox class
///
/// 子ボックスは種別を問わず、出現順のまま保持される
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct UdtaBox {
    pub boxes: Vec<AnyBox>,
}

impl UdtaBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"udta");
}

impl Encode for UdtaBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, sum_sizes(&self.boxes)?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, sum_sizes(&self.boxes)?, buf, |buf| {
            encode_all(&self.boxes, buf)
        })
    }
}

impl Decode for UdtaBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_container(Self::TYPE, buf)
    }
}

impl BaseBox for UdtaBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(self.boxes.iter().map(as_box_object))
    }
}

impl ContainerBox for UdtaBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        try_push(&mut self.boxes, child)
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        Ok(())
    }
}

/// [ISO/IEC 14496-12] MetaBox class
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MetaBox {
    pub hdlr_box: Option<HdlrBox>,
    pub other_boxes: Vec<AnyBox>,
}

impl MetaBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"meta");

    fn payload_size(&self) -> Result<usize> {
        self.check_mandatory_boxes()?;
        Ok(4 + sum_sizes(&self.hdlr_box)? + sum_sizes(&self.other_boxes)?)
    }
}

impl Encode for MetaBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()?))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size()?, buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += encode_all(&self.hdlr_box, &mut buf[offset..])?;
            offset += encode_all(&self.other_boxes, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for MetaBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let mut this = Self::default();
            decode_children(&mut this, &payload[offset..])?;
            Ok((this, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for MetaBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::empty()
                .chain(self.hdlr_box.iter().map(as_box_object))
                .chain(self.other_boxes.iter().map(as_box_object)),
        )
    }
}

impl FullBox for MetaBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

impl ContainerBox for MetaBox {
    const MANDATORY_CHILDREN: &'static [BoxType] = &[HdlrBox::TYPE];

    fn add_child(&mut self, child: AnyBox) -> Result<()> {
        match child {
            AnyBox::Hdlr(b) => set_singleton(&mut self.hdlr_box, b, Self::TYPE),
            other => route_other_box(&mut self.other_boxes, other, Self::TYPE),
        }
    }

    fn check_mandatory_boxes(&self) -> Result<()> {
        check_mandatory_box(&self.hdlr_box, HdlrBox::TYPE, Self::TYPE)
    }
}
