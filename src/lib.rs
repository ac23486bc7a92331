//! ISO Base Media File Format (MP4) のボックスツリーを読み書き・編集するためのライブラリ
//!
//! - [`boxes`] : 個々のボックスのエンコードおよびデコード
//! - [`sample_table`] : サンプルテーブル (stbl) へのサンプル単位の問い合わせと編集
//! - [`fragment`] : ムービーフラグメント (moof) のトラックへの取り込み
//! - [`IsoFile`] : ファイル単位での読み込み・編集・書き出し
#![warn(missing_docs)]

mod auxiliary;
mod basic_types;
pub mod boxes;
mod boxes_fmp4;
mod boxes_moov_tree;
mod boxes_sample_aux;
mod boxes_sample_table;
mod codec;
mod file;
pub mod fragment;
pub mod sample_table;

pub use basic_types::{
    BaseBox, BoxHeader, BoxSize, BoxType, ContainerBox, FixedPointNumber, FullBox, FullBoxFlags,
    FullBoxHeader, Mp4FileTime, Uint,
};
pub use codec::{Decode, Encode, Error, ErrorKind, Result};
pub use file::{
    ChunkingPolicy, FileError, IsoFile, Layout, OpenMode, OpenOptions, Sample, SaveOptions,
    TrackConfig,
};

// [NOTE]
// Windows 環境では aux.rs というファイル名が予約語で、リポジトリに含まれていると git clone に失敗するため、
// ファイル名自体は auxiliary.rs にして lib.rs の中で aux モジュール以下に再エクスポートしている。
pub mod aux {
    //! ボックスの仕様とは直接は関係がない、実装上便利な補助的なコンポーネントを集めたモジュール

    pub use crate::auxiliary::{ChunkAccessor, SampleAccessor, SampleTableAccessor};
}
