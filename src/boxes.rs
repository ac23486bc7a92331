//! ボックス群の定義と、ボックス種別に応じたデコード処理の振り分けを行うモジュール
//!
//! 既知のボックスは全て [`AnyBox`] のいずれかのバリアントとして表現される。
//! 未知の種別のボックスは [`UnknownBox`] としてペイロードをそのまま保持するので、
//! デコードしたボックスを再度エンコードしても情報が失われることはない。
use crate::{
    BaseBox, BoxHeader, BoxSize, BoxType, ContainerBox, Decode, Encode, Error, ErrorKind, Result,
    Uint, codec::try_vec_with_capacity,
};

pub use crate::boxes_fmp4::*;
pub use crate::boxes_moov_tree::*;
pub use crate::boxes_sample_aux::*;
pub use crate::boxes_sample_table::*;

/// ボックスのブランド (`ftyp` の major_brand / compatible_brands)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Brand([u8; 4]);

impl Brand {
    /// [ISO/IEC 14496-12] isom ブランド
    pub const ISOM: Self = Self::new(*b"isom");

    /// [ISO/IEC 14496-12] iso2 ブランド
    pub const ISO2: Self = Self::new(*b"iso2");

    /// [ISO/IEC 14496-12] iso6 ブランド
    pub const ISO6: Self = Self::new(*b"iso6");

    /// [ISO/IEC 14496-14] mp41 ブランド
    pub const MP41: Self = Self::new(*b"mp41");

    /// [ISO/IEC 14496-14] mp42 ブランド
    pub const MP42: Self = Self::new(*b"mp42");

    /// [ISO/IEC 14496-15] avc1 ブランド
    pub const AVC1: Self = Self::new(*b"avc1");

    /// 3GPP Release 6 のブランド
    pub const THREE_GP6: Self = Self::new(*b"3gp6");

    /// バイト列を指定して [`Brand`] インスタンスを生成する
    pub const fn new(brand: [u8; 4]) -> Self {
        Self(brand)
    }

    /// このブランドを表すバイト列を返す
    pub const fn get(self) -> [u8; 4] {
        self.0
    }
}

impl std::fmt::Debug for Brand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Ok(s) = std::str::from_utf8(&self.0) {
            f.debug_tuple("Brand").field(&s).finish()
        } else {
            f.debug_tuple("Brand").field(&self.0).finish()
        }
    }
}

impl std::fmt::Display for Brand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

impl Encode for Brand {
    fn encoded_size(&self) -> Result<usize> {
        Ok(4)
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.0.encode(buf)
    }
}

impl Decode for Brand {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (bytes, size) = <[u8; 4]>::decode(buf)?;
        Ok((Self(bytes), size))
    }
}

/// [ISO/IEC 14496-12] FileTypeBox class
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FtypBox {
    pub major_brand: Brand,
    pub minor_version: u32,
    pub compatible_brands: Vec<Brand>,
}

impl FtypBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"ftyp");

    fn payload_size(&self) -> usize {
        8 + self.compatible_brands.len() * 4
    }

    /// major brand を変更する
    ///
    /// 新しい major brand が compatible brands に含まれていない場合は末尾に追加される
    pub fn set_major_brand(&mut self, brand: Brand, minor_version: u32) {
        self.major_brand = brand;
        self.minor_version = minor_version;
        if !self.compatible_brands.contains(&brand) {
            self.compatible_brands.push(brand);
        }
    }
}

impl Default for FtypBox {
    fn default() -> Self {
        Self {
            major_brand: Brand::ISOM,
            minor_version: 1,
            compatible_brands: vec![Brand::ISOM],
        }
    }
}

impl Encode for FtypBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = 0;
            offset += self.major_brand.encode(&mut buf[offset..])?;
            offset += self.minor_version.encode(&mut buf[offset..])?;
            for brand in &self.compatible_brands {
                offset += brand.encode(&mut buf[offset..])?;
            }
            Ok(offset)
        })
    }
}

impl Decode for FtypBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let major_brand = Brand::decode_at(payload, &mut offset)?;
            let minor_version = u32::decode_at(payload, &mut offset)?;
            let count = (payload.len() - offset) / 4;
            let compatible_brands =
                crate::codec::decode_entries(payload, &mut offset, count, 4, |buf, offset| {
                    Brand::decode_at(buf, offset)
                })?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((
                Self {
                    major_brand,
                    minor_version,
                    compatible_brands,
                },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for FtypBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

/// [ISO/IEC 14496-12] FreeSpaceBox class
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FreeBox {
    pub payload: Vec<u8>,
}

impl FreeBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"free");
}

impl Encode for FreeBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload.len()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload.len(), buf, |buf| {
            self.payload.encode(buf)
        })
    }
}

impl Decode for FreeBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;
            Ok((
                Self {
                    payload: copy_payload(payload)?,
                },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for FreeBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

/// [ISO/IEC 14496-12] MediaDataBox class
///
/// メモリ上のバイト列からデコードした場合にのみ使われる。
/// ファイルを扱う [`IsoFile`](crate::IsoFile) ではペイロードを読み込まずに、位置とサイズだけを参照する
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MdatBox {
    pub payload: Vec<u8>,
}

impl MdatBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mdat");
}

impl Encode for MdatBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload.len()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, self.payload.len(), buf, |buf| {
            self.payload.encode(buf)
        })
    }
}

impl Decode for MdatBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;
            Ok((
                Self {
                    payload: copy_payload(payload)?,
                },
                header.external_size() + payload.len(),
            ))
        })
    }
}

impl BaseBox for MdatBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

/// 未知のボックス、あるいはデコードに失敗した任意のボックスを表す
///
/// ペイロードとヘッダーのサイズ形式をそのまま保持しているので、エンコード時には元のバイト列が再現される
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBox {
    /// ボックスの種別
    pub box_type: BoxType,

    /// `true` の場合は、サイズが 32 ビットに収まっていても 64 ビットのサイズ形式 (size == 1) で書き出す
    pub large_size: bool,

    /// ヘッダー部分を除いたボックスのバイト列
    pub payload: Vec<u8>,
}

impl UnknownBox {
    fn header(&self) -> BoxHeader {
        let header = BoxHeader::for_payload(self.box_type, self.payload.len());
        match header.box_size {
            BoxSize::U32(size) if self.large_size => BoxHeader {
                box_type: self.box_type,
                box_size: BoxSize::U64(size as u64 + 8),
            },
            _ => header,
        }
    }
}

impl Encode for UnknownBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(self.header().external_size() + self.payload.len())
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        with_box_type(self.box_type, || {
            let offset = self.header().encode(buf)?;
            Ok(offset + self.payload.encode(&mut buf[offset..])?)
        })
    }
}

impl Decode for UnknownBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
        Ok((
            Self {
                box_type: header.box_type,
                large_size: matches!(header.box_size, BoxSize::U64(_)),
                payload: copy_payload(payload)?,
            },
            header.external_size() + payload.len(),
        ))
    }
}

impl BaseBox for UnknownBox {
    fn box_type(&self) -> BoxType {
        self.box_type
    }

    fn is_unknown_box(&self) -> bool {
        true
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

/// [ISO/IEC 14496-12] で定義されているサンプルフラグ（`trex` / `tfhd` / `trun` で使われる 32 bit 値）
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleFlags(u32);

impl SampleFlags {
    /// 全てのビットが 0 のフラグを返す
    pub const fn empty() -> Self {
        Self(0)
    }

    /// [`u32`] を受け取って、対応するフラグを作成する
    pub const fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// 同期サンプルかどうかだけを指定したフラグを作成する
    ///
    /// 非同期サンプルの場合は `sample_depends_on` に「他のサンプルに依存する」(1) が設定される
    pub fn from_sync(is_sync: bool) -> Self {
        if is_sync {
            Self::empty().with_depends_on(2)
        } else {
            Self::empty().with_depends_on(1).with_non_sync(true)
        }
    }

    /// このフラグに対応する [`u32`] 値を返す
    pub const fn get(self) -> u32 {
        self.0
    }

    /// is_leading フィールドの値を返す
    pub fn is_leading(self) -> u8 {
        Uint::<u32, 2, 26>::from_bits(self.0).get() as u8
    }

    /// sample_depends_on フィールドの値を返す
    pub fn sample_depends_on(self) -> u8 {
        Uint::<u32, 2, 24>::from_bits(self.0).get() as u8
    }

    /// sample_is_depended_on フィールドの値を返す
    pub fn sample_is_depended_on(self) -> u8 {
        Uint::<u32, 2, 22>::from_bits(self.0).get() as u8
    }

    /// sample_has_redundancy フィールドの値を返す
    pub fn sample_has_redundancy(self) -> u8 {
        Uint::<u32, 2, 20>::from_bits(self.0).get() as u8
    }

    /// sample_padding_value フィールドの値を返す
    pub fn sample_padding_value(self) -> u8 {
        Uint::<u32, 3, 17>::from_bits(self.0).get() as u8
    }

    /// sample_is_non_sync_sample フィールドの値を返す
    pub fn sample_is_non_sync_sample(self) -> bool {
        Uint::<u32, 1, 16>::from_bits(self.0).get() == 1
    }

    /// sample_degradation_priority フィールドの値を返す
    pub fn sample_degradation_priority(self) -> u16 {
        Uint::<u32, 16>::from_bits(self.0).get() as u16
    }

    /// sdtp ボックスの一エントリー分の値（is_leading / depends_on / is_depended_on / has_redundancy）に変換する
    pub fn dependency_byte(self) -> u8 {
        (self.0 >> 20) as u8
    }

    fn with_depends_on(self, v: u8) -> Self {
        Self(
            (self.0 & !Uint::<u32, 2, 24>::new(3).to_bits())
                | Uint::<u32, 2, 24>::new(v as u32).to_bits(),
        )
    }

    fn with_non_sync(self, v: bool) -> Self {
        Self((self.0 & !(1 << 16)) | Uint::<u32, 1, 16>::new(v as u32).to_bits())
    }
}

impl Encode for SampleFlags {
    fn encoded_size(&self) -> Result<usize> {
        Ok(4)
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.0.encode(buf)
    }
}

impl Decode for SampleFlags {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (v, size) = u32::decode(buf)?;
        Ok((Self(v), size))
    }
}

/// 既知の全てのボックスと、未知のボックスを表す列挙型
///
/// ボックス種別をキーにしたデコード処理の振り分けは [`AnyBox::decode()`] で行われる
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AnyBox {
    Ftyp(FtypBox),
    Free(FreeBox),
    Mdat(MdatBox),
    Moov(MoovBox),
    Mvhd(MvhdBox),
    Iods(IodsBox),
    Trak(TrakBox),
    Tkhd(TkhdBox),
    Tref(TrefBox),
    Edts(EdtsBox),
    Elst(ElstBox),
    Mdia(MdiaBox),
    Mdhd(MdhdBox),
    Hdlr(HdlrBox),
    Minf(MinfBox),
    Vmhd(VmhdBox),
    Smhd(SmhdBox),
    Hmhd(HmhdBox),
    Nmhd(NmhdBox),
    Dinf(DinfBox),
    Dref(DrefBox),
    Url(UrlBox),
    Urn(UrnBox),
    Udta(UdtaBox),
    Meta(MetaBox),
    Stbl(StblBox),
    Stsd(StsdBox),
    Stts(SttsBox),
    Ctts(CttsBox),
    Stss(StssBox),
    Stsc(StscBox),
    Stsz(StszBox),
    ChunkOffset(ChunkOffsetBox),
    Stsh(StshBox),
    Stdp(StdpBox),
    Sdtp(SdtpBox),
    Padb(PadbBox),
    Stsf(StsfBox),
    Mvex(MvexBox),
    Mehd(MehdBox),
    Trex(TrexBox),
    Moof(MoofBox),
    Mfhd(MfhdBox),
    Traf(TrafBox),
    Tfhd(TfhdBox),
    Tfdt(TfdtBox),
    Trun(TrunBox),
    Unknown(UnknownBox),
}

macro_rules! dispatch {
    ($this:expr, $b:ident => $body:expr) => {
        match $this {
            AnyBox::Ftyp($b) => $body,
            AnyBox::Free($b) => $body,
            AnyBox::Mdat($b) => $body,
            AnyBox::Moov($b) => $body,
            AnyBox::Mvhd($b) => $body,
            AnyBox::Iods($b) => $body,
            AnyBox::Trak($b) => $body,
            AnyBox::Tkhd($b) => $body,
            AnyBox::Tref($b) => $body,
            AnyBox::Edts($b) => $body,
            AnyBox::Elst($b) => $body,
            AnyBox::Mdia($b) => $body,
            AnyBox::Mdhd($b) => $body,
            AnyBox::Hdlr($b) => $body,
            AnyBox::Minf($b) => $body,
            AnyBox::Vmhd($b) => $body,
            AnyBox::Smhd($b) => $body,
            AnyBox::Hmhd($b) => $body,
            AnyBox::Nmhd($b) => $body,
            AnyBox::Dinf($b) => $body,
            AnyBox::Dref($b) => $body,
            AnyBox::Url($b) => $body,
            AnyBox::Urn($b) => $body,
            AnyBox::Udta($b) => $body,
            AnyBox::Meta($b) => $body,
            AnyBox::Stbl($b) => $body,
            AnyBox::Stsd($b) => $body,
            AnyBox::Stts($b) => $body,
            AnyBox::Ctts($b) => $body,
            AnyBox::Stss($b) => $body,
            AnyBox::Stsc($b) => $body,
            AnyBox::Stsz($b) => $body,
            AnyBox::ChunkOffset($b) => $body,
            AnyBox::Stsh($b) => $body,
            AnyBox::Stdp($b) => $body,
            AnyBox::Sdtp($b) => $body,
            AnyBox::Padb($b) => $body,
            AnyBox::Stsf($b) => $body,
            AnyBox::Mvex($b) => $body,
            AnyBox::Mehd($b) => $body,
            AnyBox::Trex($b) => $body,
            AnyBox::Moof($b) => $body,
            AnyBox::Mfhd($b) => $body,
            AnyBox::Traf($b) => $body,
            AnyBox::Tfhd($b) => $body,
            AnyBox::Tfdt($b) => $body,
            AnyBox::Trun($b) => $body,
            AnyBox::Unknown($b) => $body,
        }
    };
}

type DecodeFn = fn(&[u8]) -> Result<(AnyBox, usize)>;

fn decode_as<T: Decode>(buf: &[u8], f: fn(T) -> AnyBox) -> Result<(AnyBox, usize)> {
    let (b, size) = T::decode(buf)?;
    Ok((f(b), size))
}

impl AnyBox {
    /// この種別のボックスを [`AnyBox`] の既知のバリアントとしてデコード可能かどうかを判定する
    pub fn is_recognized_type(box_type: BoxType) -> bool {
        Self::decoder_for(box_type).is_some()
    }

    fn decoder_for(box_type: BoxType) -> Option<DecodeFn> {
        let decoder: DecodeFn = match box_type {
            FtypBox::TYPE => |b| decode_as(b, AnyBox::Ftyp),
            FreeBox::TYPE => |b| decode_as(b, AnyBox::Free),
            MdatBox::TYPE => |b| decode_as(b, AnyBox::Mdat),
            MoovBox::TYPE => |b| decode_as(b, AnyBox::Moov),
            MvhdBox::TYPE => |b| decode_as(b, AnyBox::Mvhd),
            IodsBox::TYPE => |b| decode_as(b, AnyBox::Iods),
            TrakBox::TYPE => |b| decode_as(b, AnyBox::Trak),
            TkhdBox::TYPE => |b| decode_as(b, AnyBox::Tkhd),
            TrefBox::TYPE => |b| decode_as(b, AnyBox::Tref),
            EdtsBox::TYPE => |b| decode_as(b, AnyBox::Edts),
            ElstBox::TYPE => |b| decode_as(b, AnyBox::Elst),
            MdiaBox::TYPE => |b| decode_as(b, AnyBox::Mdia),
            MdhdBox::TYPE => |b| decode_as(b, AnyBox::Mdhd),
            HdlrBox::TYPE => |b| decode_as(b, AnyBox::Hdlr),
            MinfBox::TYPE => |b| decode_as(b, AnyBox::Minf),
            VmhdBox::TYPE => |b| decode_as(b, AnyBox::Vmhd),
            SmhdBox::TYPE => |b| decode_as(b, AnyBox::Smhd),
            HmhdBox::TYPE => |b| decode_as(b, AnyBox::Hmhd),
            NmhdBox::TYPE => |b| decode_as(b, AnyBox::Nmhd),
            DinfBox::TYPE => |b| decode_as(b, AnyBox::Dinf),
            DrefBox::TYPE => |b| decode_as(b, AnyBox::Dref),
            UrlBox::TYPE => |b| decode_as(b, AnyBox::Url),
            UrnBox::TYPE => |b| decode_as(b, AnyBox::Urn),
            UdtaBox::TYPE => |b| decode_as(b, AnyBox::Udta),
            MetaBox::TYPE => |b| decode_as(b, AnyBox::Meta),
            StblBox::TYPE => |b| decode_as(b, AnyBox::Stbl),
            StsdBox::TYPE => |b| decode_as(b, AnyBox::Stsd),
            SttsBox::TYPE => |b| decode_as(b, AnyBox::Stts),
            CttsBox::TYPE => |b| decode_as(b, AnyBox::Ctts),
            StssBox::TYPE => |b| decode_as(b, AnyBox::Stss),
            StscBox::TYPE => |b| decode_as(b, AnyBox::Stsc),
            StszBox::TYPE | StszBox::COMPACT_TYPE => |b| decode_as(b, AnyBox::Stsz),
            ChunkOffsetBox::STCO_TYPE | ChunkOffsetBox::CO64_TYPE => {
                |b| decode_as(b, AnyBox::ChunkOffset)
            }
            StshBox::TYPE => |b| decode_as(b, AnyBox::Stsh),
            StdpBox::TYPE => |b| decode_as(b, AnyBox::Stdp),
            SdtpBox::TYPE => |b| decode_as(b, AnyBox::Sdtp),
            PadbBox::TYPE => |b| decode_as(b, AnyBox::Padb),
            StsfBox::TYPE => |b| decode_as(b, AnyBox::Stsf),
            MvexBox::TYPE => |b| decode_as(b, AnyBox::Mvex),
            MehdBox::TYPE => |b| decode_as(b, AnyBox::Mehd),
            TrexBox::TYPE => |b| decode_as(b, AnyBox::Trex),
            MoofBox::TYPE => |b| decode_as(b, AnyBox::Moof),
            MfhdBox::TYPE => |b| decode_as(b, AnyBox::Mfhd),
            TrafBox::TYPE => |b| decode_as(b, AnyBox::Traf),
            TfhdBox::TYPE => |b| decode_as(b, AnyBox::Tfhd),
            TfdtBox::TYPE => |b| decode_as(b, AnyBox::Tfdt),
            TrunBox::TYPE => |b| decode_as(b, AnyBox::Trun),
            // uuid 形式の拡張種別で認識しているものは無いので、全て未知のボックス扱いとなる
            _ => return None,
        };
        Some(decoder)
    }
}

impl Decode for AnyBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, _) = BoxHeader::decode(buf)?;
        match Self::decoder_for(header.box_type) {
            Some(decode) => decode(buf),
            None => decode_as(buf, AnyBox::Unknown),
        }
    }
}

impl Encode for AnyBox {
    fn encoded_size(&self) -> Result<usize> {
        dispatch!(self, b => b.encoded_size())
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        dispatch!(self, b => b.encode(buf))
    }
}

impl BaseBox for AnyBox {
    fn box_type(&self) -> BoxType {
        dispatch!(self, b => b.box_type())
    }

    fn is_unknown_box(&self) -> bool {
        dispatch!(self, b => b.is_unknown_box())
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        dispatch!(self, b => b.children())
    }
}

/// バイト列の先頭にあるボックスを一つデコードする
///
/// 成功時には、デコードされたボックスと消費したバイト数のタプルが返される。
/// 未知の種別のボックスは [`AnyBox::Unknown`] となり、エラーにはならない
pub fn parse_box(buf: &[u8]) -> Result<(AnyBox, usize)> {
    AnyBox::decode(buf)
}

/// バイト列に含まれるトップレベルのボックスを全てデコードする
///
/// サイズが 0 のボックスはバイト列の末尾まで続くものとして扱われるため、必ず最後のボックスとなる
pub fn parse_boxes(buf: &[u8]) -> Result<Vec<AnyBox>> {
    let mut boxes = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let b = AnyBox::decode_at(buf, &mut offset)?;
        crate::codec::try_push(&mut boxes, b)?;
    }
    Ok(boxes)
}

/// 指定されたボックスを順番にエンコードしたバイト列を返す
pub fn encode_boxes(boxes: &[AnyBox]) -> Result<Vec<u8>> {
    let size = sum_sizes(boxes)?;
    let mut buf = try_vec_with_capacity(size)?;
    buf.resize(size, 0);
    let mut offset = 0;
    for b in boxes {
        offset += b.encode(&mut buf[offset..])?;
    }
    Ok(buf)
}

pub(crate) fn with_box_type<F, T>(ty: BoxType, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    f().map_err(|e| e.with_box_type(ty))
}

/// ペイロードサイズから、ヘッダーを含むボックス全体のサイズを求める
pub(crate) fn box_size(box_type: BoxType, payload_size: usize) -> usize {
    BoxHeader::for_payload(box_type, payload_size).external_size() + payload_size
}

/// ボックスヘッダーを書きこんだ後に `f` でペイロードを書きこむ
///
/// `f` が書きこんだバイト数がサイズ計算の結果と異なる場合はエラーとなる
pub(crate) fn encode_box<F>(
    box_type: BoxType,
    payload_size: usize,
    buf: &mut [u8],
    f: F,
) -> Result<usize>
where
    F: FnOnce(&mut [u8]) -> Result<usize>,
{
    with_box_type(box_type, || {
        let header = BoxHeader::for_payload(box_type, payload_size);
        let offset = header.encode(buf)?;
        Error::check_buffer_size(offset + payload_size, buf)?;
        let written = f(&mut buf[offset..offset + payload_size])?;
        if written != payload_size {
            return Err(Error::with_reason(
                ErrorKind::Other,
                format!("Payload size mismatch: computed={payload_size}, written={written}"),
            ));
        }
        Ok(offset + written)
    })
}

pub(crate) fn sum_sizes<'a, T, I>(items: I) -> Result<usize>
where
    T: 'a + Encode,
    I: IntoIterator<Item = &'a T>,
{
    items.into_iter().map(|b| b.encoded_size()).sum()
}

pub(crate) fn encode_all<'a, T, I>(items: I, buf: &mut [u8]) -> Result<usize>
where
    T: 'a + Encode,
    I: IntoIterator<Item = &'a T>,
{
    let mut offset = 0;
    for b in items {
        offset += b.encode(&mut buf[offset..])?;
    }
    Ok(offset)
}

pub(crate) fn copy_payload(payload: &[u8]) -> Result<Vec<u8>> {
    let mut bytes = try_vec_with_capacity(payload.len())?;
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// 32 bit と 64 bit を切り替えるフィールドを持つボックスのバージョンを決定する
///
/// いずれかの値が 32 bit に収まらない場合は 1 、それ以外は 0 となる
pub(crate) fn version_for_values<I>(values: I) -> u8
where
    I: IntoIterator<Item = u64>,
{
    if values.into_iter().any(|v| v > u32::MAX as u64) {
        1
    } else {
        0
    }
}

/// 必須の子ボックスへの参照を取得する
pub(crate) fn required<'a, T>(b: &'a Option<T>, child: BoxType, parent: BoxType) -> Result<&'a T> {
    b.as_ref()
        .ok_or_else(|| Error::missing_mandatory_box(child, parent))
}

/// 必須の子ボックスへの可変参照を取得する
pub(crate) fn required_mut<'a, T>(
    b: &'a mut Option<T>,
    child: BoxType,
    parent: BoxType,
) -> Result<&'a mut T> {
    b.as_mut()
        .ok_or_else(|| Error::missing_mandatory_box(child, parent))
}

/// コンテナボックスをデコードする
pub(crate) fn decode_container<C>(box_type: BoxType, buf: &[u8]) -> Result<(C, usize)>
where
    C: ContainerBox + Default,
{
    with_box_type(box_type, || {
        let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
        header.box_type.expect(box_type)?;
        let mut this = C::default();
        decode_children(&mut this, payload)?;
        Ok((this, header.external_size() + payload.len()))
    })
}

/// 一つしか存在できない子ボックスを設定する
pub(crate) fn set_singleton<T: BaseBox>(
    slot: &mut Option<T>,
    child: T,
    parent: BoxType,
) -> Result<()> {
    if slot.is_some() {
        return Err(Error::duplicate_box(child.box_type(), parent));
    }
    *slot = Some(child);
    Ok(())
}

pub(crate) fn check_mandatory_box<T>(b: &Option<T>, child: BoxType, parent: BoxType) -> Result<()> {
    if b.is_none() {
        return Err(Error::missing_mandatory_box(child, parent));
    }
    Ok(())
}

/// コンテナの子ボックスとして置けない既知のボックスを、順序つきリストに追加する
pub(crate) fn route_other_box(
    other_boxes: &mut Vec<AnyBox>,
    child: AnyBox,
    parent: BoxType,
) -> Result<()> {
    if !child.is_unknown_box() {
        tracing::debug!(
            box_type = %child.box_type(),
            parent = %parent,
            "keeping inapplicable box as an extra child"
        );
    }
    crate::codec::try_push(other_boxes, child)
}

pub(crate) fn note_trailing_bytes(box_type: BoxType, trailing: usize) {
    if trailing > 0 {
        tracing::debug!(
            box_type = %box_type,
            trailing,
            "ignoring trailing bytes at the end of box"
        );
    }
}

/// コンテナのペイロードに含まれる子ボックスを順番にデコードして、コンテナに追加する
///
/// - 親の残りサイズを超えるサイズを宣言している子ボックスは [`ErrorKind::InvalidFile`] となる
/// - 必須の子ボックスのデコードに失敗した場合は、そのエラーが伝播する
/// - 内容の検証に失敗した場合 ([`ErrorKind::InvalidInput`]) もエラーが伝播する
/// - それ以外の既知のボックスのデコードに失敗した場合は、警告ログを出して [`UnknownBox`] として保持する
pub(crate) fn decode_children<C: ContainerBox>(container: &mut C, payload: &[u8]) -> Result<()> {
    let parent = container.box_type();
    let mut offset = 0;
    while offset < payload.len() {
        let remaining = &payload[offset..];
        let (child_header, _) = BoxHeader::decode(remaining)?;
        let declared = child_header.box_size.get();
        let child_size = if declared == 0 {
            remaining.len()
        } else {
            usize::try_from(declared)
                .ok()
                .filter(|&n| n <= remaining.len())
                .ok_or_else(|| {
                    Error::invalid_file(format!(
                        "Child box '{}' declares {declared} bytes, but only {} bytes remain in '{parent}'",
                        child_header.box_type,
                        remaining.len()
                    ))
                })?
        };
        let child_bytes = &remaining[..child_size];

        let child = match AnyBox::decode(child_bytes) {
            Ok((child, _)) => child,
            Err(e)
                if matches!(e.kind, ErrorKind::OutOfMemory | ErrorKind::InvalidInput)
                    || C::MANDATORY_CHILDREN.contains(&child_header.box_type) =>
            {
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    box_type = %child_header.box_type,
                    parent = %parent,
                    error = %e.reason,
                    kind = ?e.kind,
                    "failed to parse optional box, keeping its raw bytes"
                );
                AnyBox::Unknown(UnknownBox::decode(child_bytes)?.0)
            }
        };
        container.add_child(child)?;
        offset += child_size;
    }
    container.check_mandatory_boxes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_box_round_trip() {
        let bytes = [0, 0, 0, 11, b'a', b'b', b'c', b'd', 1, 2, 3];
        let (b, size) = parse_box(&bytes).expect("decode");
        assert_eq!(size, bytes.len());
        assert!(b.is_unknown_box());
        assert_eq!(b.box_type(), BoxType::Normal(*b"abcd"));
        assert_eq!(b.encode_to_vec().expect("encode"), bytes);
    }

    #[test]
    fn uuid_box_falls_back_to_unknown() {
        let mut bytes = vec![0, 0, 0, 26];
        bytes.extend_from_slice(b"uuid");
        bytes.extend_from_slice(&[9; 16]);
        bytes.extend_from_slice(&[1, 2]);
        let (b, _) = parse_box(&bytes).expect("decode");
        assert_eq!(b.box_type(), BoxType::Uuid([9; 16]));
        assert_eq!(b.encode_to_vec().expect("encode"), bytes);
    }

    #[test]
    fn ftyp_set_major_brand_keeps_compatible_list() {
        let mut ftyp = FtypBox::default();
        ftyp.set_major_brand(Brand::MP42, 0);
        assert_eq!(ftyp.major_brand, Brand::MP42);
        assert_eq!(ftyp.compatible_brands, [Brand::ISOM, Brand::MP42]);
    }

    #[test]
    fn sample_flags_fields() {
        let flags = SampleFlags::from_sync(false);
        assert!(flags.sample_is_non_sync_sample());
        assert_eq!(flags.sample_depends_on(), 1);

        let flags = SampleFlags::new((7 << 17) | 0x1234);
        assert_eq!(flags.sample_padding_value(), 7);
        assert_eq!(flags.sample_degradation_priority(), 0x1234);
    }

    #[test]
    fn terminal_zero_size_box_in_stream() {
        let mut bytes = vec![0, 0, 0, 8, b'f', b'r', b'e', b'e'];
        bytes.extend_from_slice(&[0, 0, 0, 0, b'm', b'd', b'a', b't', 1, 2, 3, 4]);
        let boxes = parse_boxes(&bytes).expect("decode");
        assert_eq!(boxes.len(), 2);
        let AnyBox::Mdat(mdat) = &boxes[1] else {
            panic!("expected mdat");
        };
        assert_eq!(mdat.payload, [1, 2, 3, 4]);
    }
}
