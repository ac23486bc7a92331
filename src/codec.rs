use std::{
    backtrace::Backtrace,
    num::{NonZeroU16, NonZeroU32},
    panic::Location,
};

use crate::BoxType;

/// このライブラリ用の Result 型
pub type Result<T> = std::result::Result<T, Error>;

/// エンコード/デコード操作のエラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// ボックスが宣言しているサイズ分のバイト列が存在しない
    TruncatedBox,

    /// ファイルの構造が壊れている（子ボックスが親の範囲を超えている、テーブル間の件数が食い違っている、など）
    InvalidFile,

    /// 一つしか存在してはいけない子ボックスが複数存在する
    DuplicateBox,

    /// 必須の子ボックスが存在しない
    MissingMandatoryBox,

    /// 値がどの表現形式でも表現できない範囲にある、あるいは未対応の表現形式（バージョンなど）である
    UnsupportedRepresentation,

    /// テーブルの拡張時にメモリの確保に失敗した
    OutOfMemory,

    /// API に渡された値が無効である
    InvalidInput,

    /// エンコード先のバッファのサイズが不足している
    InsufficientBuffer,

    /// その他の予期しないエラー
    Other,
}

impl ErrorKind {
    /// 構造的に壊れたファイルを表すエラーかどうかを判定する
    ///
    /// [`ErrorKind::DuplicateBox`] と [`ErrorKind::MissingMandatoryBox`] は
    /// [`ErrorKind::InvalidFile`] をより詳細に分類したものなので、これらも `true` となる
    pub const fn is_invalid_file(self) -> bool {
        matches!(
            self,
            Self::InvalidFile | Self::DuplicateBox | Self::MissingMandatoryBox
        )
    }
}

/// エラー型
pub struct Error {
    /// 発生したエラーの種類
    pub kind: ErrorKind,

    /// エラーが発生した理由
    pub reason: String,

    /// エラーが作成されたソースコードの場所
    pub location: &'static Location<'static>,

    /// エラーが発生したボックスの種類
    pub box_type: Option<BoxType>,

    /// エラー発生箇所を示すバックトレース
    ///
    /// バックトレースは `RUST_BACKTRACE` 環境変数が設定されていない場合には取得されない
    pub backtrace: Backtrace,
}

impl Error {
    /// [`Error`] インスタンスを生成する
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        Self::with_reason(kind, String::new())
    }

    /// エラー理由つきで [`Error`] インスタンスを生成する
    #[track_caller]
    pub fn with_reason<T: Into<String>>(kind: ErrorKind, reason: T) -> Self {
        Self {
            kind,
            reason: reason.into(),
            location: Location::caller(),
            box_type: None,
            backtrace: Backtrace::capture(),
        }
    }

    /// エラーが発生したボックスの種別を設定する
    ///
    /// すでに種別が設定されている場合（より内側のボックスで発生したエラーの場合）には何もしない
    pub fn with_box_type(mut self, box_type: BoxType) -> Self {
        if self.box_type.is_none() {
            self.box_type = Some(box_type);
        }
        self
    }

    #[track_caller]
    pub(crate) fn truncated<T: Into<String>>(reason: T) -> Self {
        Self::with_reason(ErrorKind::TruncatedBox, reason)
    }

    #[track_caller]
    pub(crate) fn invalid_file<T: Into<String>>(reason: T) -> Self {
        Self::with_reason(ErrorKind::InvalidFile, reason)
    }

    #[track_caller]
    pub(crate) fn duplicate_box(child: BoxType, parent: BoxType) -> Self {
        Self::with_reason(
            ErrorKind::DuplicateBox,
            format!("Duplicate '{child}' box in '{parent}' box"),
        )
        .with_box_type(parent)
    }

    #[track_caller]
    pub(crate) fn missing_mandatory_box(child: BoxType, parent: BoxType) -> Self {
        Self::with_reason(
            ErrorKind::MissingMandatoryBox,
            format!("Missing mandatory '{child}' box in '{parent}' box"),
        )
        .with_box_type(parent)
    }

    #[track_caller]
    pub(crate) fn unsupported<T: Into<String>>(reason: T) -> Self {
        Self::with_reason(ErrorKind::UnsupportedRepresentation, reason)
    }

    #[track_caller]
    pub(crate) fn out_of_memory(requested: usize) -> Self {
        Self::with_reason(
            ErrorKind::OutOfMemory,
            format!("Failed to reserve memory for {requested} table entries"),
        )
    }

    #[track_caller]
    pub(crate) fn invalid_input<T: Into<String>>(reason: T) -> Self {
        Self::with_reason(ErrorKind::InvalidInput, reason)
    }

    #[track_caller]
    pub(crate) fn insufficient_buffer() -> Self {
        Self::new(ErrorKind::InsufficientBuffer)
    }

    #[track_caller]
    pub(crate) fn check_buffer_size(required_size: usize, buf: &[u8]) -> Result<()> {
        if buf.len() < required_size {
            Err(Self::insufficient_buffer())
        } else {
            Ok(())
        }
    }

    #[track_caller]
    pub(crate) fn check_remaining(required_size: usize, buf: &[u8]) -> Result<()> {
        if buf.len() < required_size {
            Err(Self::truncated(format!(
                "Need {required_size} bytes, but only {} bytes remain",
                buf.len()
            )))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ty) = self.box_type {
            write!(f, "[{ty}] ")?;
        }

        write!(f, "{:?}: {}", self.kind, self.reason)?;
        write!(f, " (at {}:{})", self.location.file(), self.location.line())?;
        if self.backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            write!(f, "\n\nBacktrace:\n{}", self.backtrace)?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {}

/// バイト列に変換可能な型を表現するためのトレイト
///
/// 変換は二段階で行われる:
/// 1. [`Encode::encoded_size()`] で、現在のフィールド値から表現形式（バージョンやテーブル形式）を選択し、バイト数を求める
/// 2. [`Encode::encode()`] で、同じ表現形式を使ってバイト列を書きこむ
pub trait Encode {
    /// `self` をバイト列に変換した際のサイズを返す
    ///
    /// このメソッドは `self` を変更しない純粋な計算であり、
    /// 同じ値に対しては [`Encode::encode()`] が書きこむバイト数と常に一致する
    fn encoded_size(&self) -> Result<usize>;

    /// `self` をバイト列に変換して `buf` に書きこむ
    ///
    /// 返り値は、変換後のバイト列のサイズで、
    /// もし `buf` のサイズが不足している場合には [`ErrorKind::InsufficientBuffer`] エラーが返される
    fn encode(&self, buf: &mut [u8]) -> Result<usize>;

    /// `self` をバイト列に変換して、変換後のバイト列を返す
    fn encode_to_vec(&self) -> Result<Vec<u8>> {
        let size = self.encoded_size()?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| Error::out_of_memory(size))?;
        buf.resize(size, 0);

        let written = self.encode(&mut buf)?;
        if written != size {
            return Err(Error::with_reason(
                ErrorKind::Other,
                format!("Size pass computed {size} bytes, but the write pass produced {written} bytes"),
            ));
        }
        Ok(buf)
    }
}

macro_rules! impl_int_codec {
    ($($ty:ty),*) => {
        $(
            impl Encode for $ty {
                fn encoded_size(&self) -> Result<usize> {
                    Ok(size_of::<$ty>())
                }

                #[track_caller]
                fn encode(&self, buf: &mut [u8]) -> Result<usize> {
                    const N: usize = size_of::<$ty>();
                    Error::check_buffer_size(N, buf)?;
                    buf[..N].copy_from_slice(&self.to_be_bytes());
                    Ok(N)
                }
            }

            impl Decode for $ty {
                #[track_caller]
                fn decode(buf: &[u8]) -> Result<(Self, usize)> {
                    const N: usize = size_of::<$ty>();
                    Error::check_remaining(N, buf)?;
                    let mut bytes = [0; N];
                    bytes.copy_from_slice(&buf[..N]);
                    Ok((Self::from_be_bytes(bytes), N))
                }
            }
        )*
    };
}

impl_int_codec!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Encode for NonZeroU16 {
    fn encoded_size(&self) -> Result<usize> {
        Ok(2)
    }

    #[track_caller]
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.get().encode(buf)
    }
}

impl Encode for NonZeroU32 {
    fn encoded_size(&self) -> Result<usize> {
        Ok(4)
    }

    #[track_caller]
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.get().encode(buf)
    }
}

impl<T: Encode, const N: usize> Encode for [T; N] {
    fn encoded_size(&self) -> Result<usize> {
        self.iter().map(|item| item.encoded_size()).sum()
    }

    #[track_caller]
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut offset = 0;
        for item in self {
            offset += item.encode(&mut buf[offset..])?;
        }
        Ok(offset)
    }
}

impl Encode for [u8] {
    fn encoded_size(&self) -> Result<usize> {
        Ok(self.len())
    }

    #[track_caller]
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        Error::check_buffer_size(self.len(), buf)?;
        buf[..self.len()].copy_from_slice(self);
        Ok(self.len())
    }
}

/// バイト列から `Self` に変換するためのトレイト
pub trait Decode: Sized {
    /// バイト列からこの型の値をデコードする
    ///
    /// 成功時には、デコードされた値とデコードに消費されたバイト数のタプルが、
    /// 失敗時には [`Error`] が返される
    fn decode(buf: &[u8]) -> Result<(Self, usize)>;

    /// オフセット位置からバイト列をデコードし、オフセットを自動で進める
    fn decode_at(buf: &[u8], offset: &mut usize) -> Result<Self> {
        let (decoded, size) = Self::decode(buf.get(*offset..).unwrap_or_default())?;
        *offset += size;
        Ok(decoded)
    }
}

impl Decode for NonZeroU16 {
    #[track_caller]
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (v, size) = u16::decode(buf)?;
        NonZeroU16::new(v)
            .map(|nz| (nz, size))
            .ok_or_else(|| Error::invalid_file("Expected a non-zero integer, but got 0"))
    }
}

impl Decode for NonZeroU32 {
    #[track_caller]
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (v, size) = u32::decode(buf)?;
        NonZeroU32::new(v)
            .map(|nz| (nz, size))
            .ok_or_else(|| Error::invalid_file("Expected a non-zero integer, but got 0"))
    }
}

impl<T: Decode + Default + Copy, const N: usize> Decode for [T; N] {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut items = [T::default(); N];
        let mut offset = 0;

        for item in &mut items {
            *item = T::decode_at(buf, &mut offset)?;
        }

        Ok((items, offset))
    }
}

/// 要素数 `count` のテーブルを確保する
///
/// 確保に失敗した場合には [`ErrorKind::OutOfMemory`] エラーが返される
pub(crate) fn try_vec_with_capacity<T>(count: usize) -> Result<Vec<T>> {
    let mut entries = Vec::new();
    entries
        .try_reserve_exact(count)
        .map_err(|_| Error::out_of_memory(count))?;
    Ok(entries)
}

/// テーブルに一要素を追加する
pub(crate) fn try_push<T>(entries: &mut Vec<T>, entry: T) -> Result<()> {
    entries
        .try_reserve(1)
        .map_err(|_| Error::out_of_memory(entries.len() + 1))?;
    entries.push(entry);
    Ok(())
}

/// `count` 個の固定長エントリー（一つあたり `entry_size` バイト）をデコードする
///
/// 宣言された件数がバッファに収まらない場合は、メモリ確保の前に [`ErrorKind::TruncatedBox`] エラーとなる
pub(crate) fn decode_entries<T, F>(
    buf: &[u8],
    offset: &mut usize,
    count: usize,
    entry_size: usize,
    mut decode_entry: F,
) -> Result<Vec<T>>
where
    F: FnMut(&[u8], &mut usize) -> Result<T>,
{
    let remaining = buf.len().saturating_sub(*offset);
    let required = count
        .checked_mul(entry_size)
        .ok_or_else(|| Error::truncated(format!("Entry count {count} is too large")))?;
    if remaining < required {
        return Err(Error::truncated(format!(
            "Table declares {count} entries ({required} bytes), but only {remaining} bytes remain"
        )));
    }

    let mut entries = try_vec_with_capacity(count)?;
    for _ in 0..count {
        entries.push(decode_entry(buf, offset)?);
    }
    Ok(entries)
}

/// テーブルの要素数をボックス内の `u32` のカウントフィールド用に変換する
pub(crate) fn entry_count_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::unsupported(format!("Too many {what} entries: {len}")))
}
