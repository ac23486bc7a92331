//! ファイル単位で ISOBMFF を開いて編集し、書き出すためのハンドル
//!
//! メディアデータ (mdat) の中身はメモリに読み込まず、ファイル内での位置だけを保持する。
//! 書き出し時には、サンプルテーブルが指すバイト列を元のファイルから新しいファイルへコピーする
use std::{
    fs::File,
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    BoxHeader, BoxSize, BoxType, Decode, Encode, Error, ErrorKind, FixedPointNumber,
    boxes::{
        AnyBox, Brand, DinfBox, FreeBox, FtypBox, HdlrBox, HmhdBox, MdatBox, MdhdBox, MdiaBox,
        MediaHeaderBox, MinfBox, MoofBox, MoovBox, MvhdBox, NmhdBox, SampleEntry, SmhdBox,
        StblBox, TkhdBox, TrakBox, TrexBox, VmhdBox, encode_boxes, parse_box,
    },
    codec::try_vec_with_capacity,
    fragment::{FragmentMerger, update_track_duration},
    sample_table::{AppendSample, Chunk, ChunkPlacement},
};

/// [`IsoFile`] の操作で発生するエラー
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    /// ファイルの読み書きに失敗した
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ボックスのエンコードまたはデコードに失敗した
    #[error("box error: {0}")]
    Box(#[from] Error),

    /// 読み取り専用で開かれたファイルに対して編集または保存を行おうとした
    #[error("the file is opened read-only")]
    ReadOnly,

    /// 指定された ID のトラックが存在しない
    #[error("track {0} not found")]
    TrackNotFound(u32),

    /// [`IsoFile::close()`] の後に操作を行おうとした
    #[error("the file handle is closed")]
    Closed,

    /// 書き出し時のレイアウトを確定できなかった
    #[error("layout error: {0}")]
    Layout(String),
}

/// [`IsoFile::open()`] の動作モード
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// 読み取りのみ（編集と保存はできない）
    #[default]
    ReadOnly,

    /// 既存のファイルを読み込んで編集する
    Edit,

    /// ファイルを読み込まずに、空のムービーから新しいファイルを作る
    WriteNew,
}

/// [`IsoFile::open()`] に指定するオプション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// 動作モード
    pub mode: OpenMode,

    /// `true` の場合は、読み込んだ moof をトラックのサンプルテーブルに取り込む
    pub merge_fragments: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode: OpenMode::ReadOnly,
            merge_fragments: true,
        }
    }
}

/// 書き出し時のチャンクの配置方法
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// 既存のチャンク分割を維持し、チャンクを元のファイル内での位置の順に並べる
    #[default]
    Preserve,

    /// 各トラックをメディア時間で `chunk_duration` 以下のチャンクに分割し直し、
    /// デコード時刻の順に交互に並べる
    Interleaved {
        /// チャンク一つ分の最大の尺
        chunk_duration: Duration,
    },
}

/// [`IsoFile::save()`] に指定するオプション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    /// チャンクの配置方法
    pub layout: Layout,

    /// チャンクオフセットが確定するまでに、サイズ計算を繰り返す最大回数
    pub max_size_pass_iterations: usize,

    /// `true` の場合は mvex を取り除いて、フラグメントを含まないファイルとして書き出す
    pub drop_fragment_extends: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            layout: Layout::Preserve,
            max_size_pass_iterations: 8,
            drop_fragment_extends: true,
        }
    }
}

/// [`IsoFile::add_sample()`] で、同じトラックのサンプルをまとめるチャンクの大きさ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingPolicy {
    /// チャンク一つに含めるサンプルの最大数
    pub max_samples_per_chunk: u32,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self {
            max_samples_per_chunk: 10,
        }
    }
}

/// [`IsoFile::add_track()`] に指定するトラックの設定
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TrackConfig {
    pub handler_type: [u8; 4],
    pub timescale: NonZeroU32,
    pub sample_entry: SampleEntry,

    /// ISO-639-2/T の言語コード
    pub language: [u8; 3],
    pub width: FixedPointNumber<i16, u16>,
    pub height: FixedPointNumber<i16, u16>,
    pub volume: FixedPointNumber<i8, u8>,
}

impl TrackConfig {
    /// 映像トラック用の設定を作成する
    pub fn video(
        timescale: NonZeroU32,
        sample_entry: SampleEntry,
        width: i16,
        height: i16,
    ) -> Self {
        Self {
            handler_type: HdlrBox::HANDLER_TYPE_VIDE,
            timescale,
            sample_entry,
            language: MdhdBox::LANGUAGE_UNDEFINED,
            width: FixedPointNumber::new(width, 0),
            height: FixedPointNumber::new(height, 0),
            volume: TkhdBox::DEFAULT_VIDEO_VOLUME,
        }
    }

    /// 音声トラック用の設定を作成する
    pub fn audio(timescale: NonZeroU32, sample_entry: SampleEntry) -> Self {
        Self {
            handler_type: HdlrBox::HANDLER_TYPE_SOUN,
            timescale,
            sample_entry,
            language: MdhdBox::LANGUAGE_UNDEFINED,
            width: FixedPointNumber::new(0, 0),
            height: FixedPointNumber::new(0, 0),
            volume: TkhdBox::DEFAULT_AUDIO_VOLUME,
        }
    }
}

/// [`IsoFile::add_sample()`] で追加するサンプル
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Sample {
    pub data: Vec<u8>,
    pub duration: u32,
    pub composition_offset: i64,
    pub is_sync: bool,
    pub description_index: NonZeroU32,
}

#[derive(Debug)]
struct SourceFile {
    path: PathBuf,
    file: File,
    len: u64,
}

/// add_sample() で追記中のチャンク
#[derive(Debug, Clone, Copy)]
struct OpenChunk {
    track_id: u32,
    description_index: NonZeroU32,
    sample_count: u32,
    end: u64,
}

/// 書き出し時に配置するチャンク一つ分の情報
#[derive(Debug)]
struct PlannedChunk {
    track_index: usize,
    track_order: usize,
    description_index: NonZeroU32,
    sample_count: u32,
    start_time: u64,
    timescale: NonZeroU32,
    source_offset: u64,
    pieces: Vec<(u64, u64)>, // (元の位置、バイト数)
}

impl PlannedChunk {
    fn size(&self) -> u64 {
        self.pieces.iter().map(|p| p.1).sum()
    }

    fn push_piece(&mut self, offset: u64, len: u64) {
        match self.pieces.last_mut() {
            Some(last) if last.0 + last.1 == offset => last.1 += len,
            _ => self.pieces.push((offset, len)),
        }
    }
}

#[derive(Debug)]
struct FileState {
    mode: OpenMode,
    source: Option<SourceFile>,
    ftyp: Option<FtypBox>,
    moov: MoovBox,
    other_boxes: Vec<AnyBox>,
    media_data: Vec<(u64, u64)>,
    fragments: Vec<(u64, MoofBox)>,
    merger: FragmentMerger,
    append_base: u64,
    append_buffer: Vec<u8>,
    open_chunk: Option<OpenChunk>,
    chunking: ChunkingPolicy,
}

impl FileState {
    fn empty(mode: OpenMode) -> Self {
        Self {
            mode,
            source: None,
            ftyp: Some(FtypBox::default()),
            moov: MoovBox {
                mvhd_box: Some(MvhdBox::default()),
                ..Default::default()
            },
            other_boxes: Vec::new(),
            media_data: Vec::new(),
            fragments: Vec::new(),
            merger: FragmentMerger::new(),
            append_base: 0,
            append_buffer: Vec::new(),
            open_chunk: None,
            chunking: ChunkingPolicy::default(),
        }
    }
}

/// ISOBMFF ファイルを開いて編集し、保存するためのハンドル
///
/// 追加されたサンプルのデータは、元のファイルの末尾以降の仮想的なオフセット空間に置かれ、
/// [`IsoFile::save()`] でまとめて書き出される
#[derive(Debug)]
pub struct IsoFile {
    state: Option<FileState>,
}

impl Default for IsoFile {
    fn default() -> Self {
        Self::new()
    }
}

impl IsoFile {
    /// メモリ上に空のムービー (ftyp の major brand は `isom`) を作成する
    pub fn new() -> Self {
        Self {
            state: Some(FileState::empty(OpenMode::WriteNew)),
        }
    }

    /// ファイルを開く
    ///
    /// [`OpenMode::WriteNew`] の場合はファイルを読み込まずに、空のムービーを作成する
    pub fn open<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self, FileError> {
        let path = path.as_ref();
        if options.mode == OpenMode::WriteNew {
            tracing::info!(path = %path.display(), "created new movie");
            return Ok(Self::new());
        }

        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut state = FileState::empty(options.mode);
        state.ftyp = None;
        let moov = read_top_level_boxes(&mut file, len, options, &mut state)?;
        state.moov = moov;
        state.append_base = len;
        state.source = Some(SourceFile {
            path: path.to_path_buf(),
            file,
            len,
        });

        tracing::info!(
            path = %path.display(),
            size = len,
            tracks = state.moov.trak_boxes.len(),
            unmerged_fragments = state.fragments.len(),
            "opened file"
        );
        Ok(Self { state: Some(state) })
    }

    /// 動作モードを返す
    pub fn mode(&self) -> Result<OpenMode, FileError> {
        Ok(self.state()?.mode)
    }

    /// ftyp ボックスを返す（古い形式のファイルでは存在しないことがある）
    pub fn ftyp(&self) -> Result<Option<&FtypBox>, FileError> {
        Ok(self.state()?.ftyp.as_ref())
    }

    /// moov ボックスを返す
    pub fn moov(&self) -> Result<&MoovBox, FileError> {
        Ok(&self.state()?.moov)
    }

    /// mdat ボックスのペイロードのファイル内での位置とサイズを、出現順に返す
    pub fn media_data_ranges(&self) -> Result<&[(u64, u64)], FileError> {
        Ok(&self.state()?.media_data)
    }

    /// トラックに取り込まれなかったムービーフラグメントと、そのファイル内での位置を返す
    pub fn fragments(&self) -> Result<&[(u64, MoofBox)], FileError> {
        Ok(&self.state()?.fragments)
    }

    /// [`IsoFile::add_sample()`] で使われるチャンク分割の方針を変更する
    pub fn set_chunking_policy(&mut self, policy: ChunkingPolicy) -> Result<(), FileError> {
        let state = self.editable()?;
        state.chunking = policy;
        state.open_chunk = None;
        Ok(())
    }

    /// 新しいトラックを追加して、そのトラック ID を返す
    ///
    /// トラック ID には mvhd の next_track_id が使われる。
    /// mvex が存在する場合は、対応する trex も追加される
    pub fn add_track(&mut self, config: TrackConfig) -> Result<u32, FileError> {
        let state = self.editable()?;
        let moov = &mut state.moov;
        let mut track_id = moov.mvhd()?.next_track_id.max(1);
        while moov.track(track_id).is_some() {
            track_id = next_track_id(track_id)?;
        }

        let media_header_box = match config.handler_type {
            HdlrBox::HANDLER_TYPE_VIDE => MediaHeaderBox::Vmhd(VmhdBox::default()),
            HdlrBox::HANDLER_TYPE_SOUN => MediaHeaderBox::Smhd(SmhdBox::default()),
            HdlrBox::HANDLER_TYPE_HINT => MediaHeaderBox::Hmhd(HmhdBox::default()),
            _ => MediaHeaderBox::Nmhd(NmhdBox::default()),
        };
        let mut tkhd_box = TkhdBox::new(track_id);
        tkhd_box.volume = config.volume;
        tkhd_box.width = config.width;
        tkhd_box.height = config.height;
        let mut mdhd_box = MdhdBox::new(config.timescale);
        mdhd_box.language = config.language;

        moov.trak_boxes.push(TrakBox {
            tkhd_box: Some(tkhd_box),
            mdia_box: Some(MdiaBox {
                mdhd_box: Some(mdhd_box),
                hdlr_box: Some(HdlrBox {
                    handler_type: config.handler_type,
                    name: vec![0],
                }),
                minf_box: Some(MinfBox {
                    media_header_box: Some(media_header_box),
                    dinf_box: Some(DinfBox::local_file()),
                    stbl_box: Some(StblBox::new(config.sample_entry)),
                    other_boxes: Vec::new(),
                }),
                udta_box: None,
                other_boxes: Vec::new(),
            }),
            ..Default::default()
        });
        moov.mvhd_mut()?.next_track_id = next_track_id(track_id)?;
        if let Some(mvex) = &mut moov.mvex_box {
            mvex.trex_boxes.push(TrexBox::new(track_id));
        }

        tracing::debug!(
            track_id,
            handler_type = ?BoxType::Normal(config.handler_type),
            "added track"
        );
        Ok(track_id)
    }

    /// トラックを削除する
    ///
    /// 対応する trex と、他のトラックの tref 内の参照も取り除かれる
    pub fn remove_track(&mut self, track_id: u32) -> Result<(), FileError> {
        let state = self.editable()?;
        let moov = &mut state.moov;
        let index = moov
            .trak_boxes
            .iter()
            .position(|t| t.track_id() == Some(track_id))
            .ok_or(FileError::TrackNotFound(track_id))?;
        moov.trak_boxes.remove(index);
        if let Some(mvex) = &mut moov.mvex_box {
            mvex.trex_boxes.retain(|t| t.track_id != track_id);
        }
        for trak in &mut moov.trak_boxes {
            if let Some(tref) = &mut trak.tref_box {
                tref.remove_track_id(track_id);
                if tref.references.is_empty() {
                    trak.tref_box = None;
                }
            }
        }
        refresh_movie_duration(moov)?;
        state.open_chunk = None;

        tracing::debug!(track_id, "removed track");
        Ok(())
    }

    /// トラックの末尾にサンプルを追加する
    ///
    /// 同じトラックへの連続した追加は、[`ChunkingPolicy`] の上限まで一つのチャンクにまとめられる
    pub fn add_sample(&mut self, track_id: u32, sample: Sample) -> Result<(), FileError> {
        let state = self.editable()?;
        let size = u32::try_from(sample.data.len())
            .map_err(|_| Error::unsupported("Sample data exceeds 4 GiB"))?;
        let offset = state.append_base + state.append_buffer.len() as u64;
        let max_samples = state.chunking.max_samples_per_chunk;
        let continued = state.open_chunk.filter(|c| {
            c.track_id == track_id
                && c.description_index == sample.description_index
                && c.end == offset
                && c.sample_count < max_samples
        });

        let movie_timescale = state.moov.mvhd()?.timescale;
        let trak = state
            .moov
            .track_mut(track_id)
            .ok_or(FileError::TrackNotFound(track_id))?;
        let stbl = trak.stbl_mut()?;
        let entry_count = stbl.stsd()?.entries.len();
        if sample.description_index.get() as usize > entry_count {
            return Err(Error::invalid_input(format!(
                "Sample description #{} does not exist ({entry_count} entries)",
                sample.description_index
            ))
            .into());
        }
        state
            .append_buffer
            .try_reserve(sample.data.len())
            .map_err(|_| {
                Error::with_reason(ErrorKind::OutOfMemory, "Cannot grow the append buffer")
            })?;

        let placement = match continued {
            Some(_) => ChunkPlacement::CurrentChunk,
            None => ChunkPlacement::NewChunk {
                offset,
                description_index: sample.description_index,
            },
        };
        stbl.append_sample(AppendSample {
            size,
            duration: sample.duration,
            composition_offset: sample.composition_offset,
            is_sync: sample.is_sync,
            placement,
        })?;
        update_track_duration(trak, movie_timescale)?;
        refresh_movie_duration(&mut state.moov)?;
        state.append_buffer.extend_from_slice(&sample.data);

        state.open_chunk = Some(match continued {
            Some(c) => OpenChunk {
                sample_count: c.sample_count + 1,
                end: c.end + size as u64,
                ..c
            },
            None => OpenChunk {
                track_id,
                description_index: sample.description_index,
                sample_count: 1,
                end: offset + size as u64,
            },
        });
        Ok(())
    }

    /// ftyp の major brand を変更する
    ///
    /// 変更後の major brand は compatible brands にも含まれるようになる
    pub fn set_brand(&mut self, brand: Brand, minor_version: u32) -> Result<(), FileError> {
        let state = self.editable()?;
        state
            .ftyp
            .get_or_insert_with(FtypBox::default)
            .set_major_brand(brand, minor_version);
        Ok(())
    }

    /// 全てのトラックの ID を返す
    pub fn track_ids(&self) -> Result<Vec<u32>, FileError> {
        Ok(self
            .state()?
            .moov
            .trak_boxes
            .iter()
            .filter_map(TrakBox::track_id)
            .collect())
    }

    /// 指定されたトラックを返す
    pub fn track(&self, track_id: u32) -> Result<&TrakBox, FileError> {
        self.state()?
            .moov
            .track(track_id)
            .ok_or(FileError::TrackNotFound(track_id))
    }

    /// 指定されたトラックへの可変参照を返す
    pub fn track_mut(&mut self, track_id: u32) -> Result<&mut TrakBox, FileError> {
        let state = self.editable()?;
        state.open_chunk = None;
        state
            .moov
            .track_mut(track_id)
            .ok_or(FileError::TrackNotFound(track_id))
    }

    /// 指定されたサンプルのデータを読み込む
    ///
    /// データは元のファイル、あるいは [`IsoFile::add_sample()`] で追加されたバイト列から取得される
    pub fn sample_data(&mut self, track_id: u32, sample_number: u32) -> Result<Vec<u8>, FileError> {
        let state = self.state_mut()?;
        let stbl = state
            .moov
            .track_mut(track_id)
            .ok_or(FileError::TrackNotFound(track_id))?
            .stbl_mut()?;
        let (Some(offset), Some(size)) = (
            stbl.sample_offset(sample_number),
            stbl.sample_size(sample_number),
        ) else {
            return Err(Error::invalid_input(format!(
                "Sample #{sample_number} does not exist in track {track_id}"
            ))
            .into());
        };

        let mut data = try_vec_with_capacity(size as usize)?;
        copy_media(state, offset, size as u64, &mut data)?;
        Ok(data)
    }

    /// ファイルを書き出す
    ///
    /// 全てのチャンクを moov の後ろの一つの mdat にまとめる。
    /// moov のサイズが mdat の位置を動かし、それにより stco / co64 の選択が変わりうるため、
    /// チャンクオフセットが変化しなくなるまでサイズ計算を繰り返す。
    /// 出力先と同じディレクトリの一時ファイルに全て書きこんだ後で、出力先へ置き換える
    pub fn save<P: AsRef<Path>>(&mut self, path: P, options: SaveOptions) -> Result<(), FileError> {
        let path = path.as_ref();
        let state = self.editable()?;
        if !state.fragments.is_empty() {
            return Err(FileError::Layout(format!(
                "{} movie fragments were not merged into the track tables",
                state.fragments.len()
            )));
        }

        let mut moov = state.moov.clone();
        if options.drop_fragment_extends {
            moov.mvex_box = None;
        }
        let plan = plan_chunks(&mut moov, options.layout)?;

        let mut prefix = Vec::new();
        if let Some(ftyp) = &state.ftyp {
            prefix.extend_from_slice(&ftyp.encode_to_vec()?);
        }
        prefix.extend_from_slice(&encode_boxes(&state.other_boxes)?);
        let payload_size: u64 = plan.iter().map(PlannedChunk::size).sum();
        let mdat_header = BoxHeader {
            box_type: MdatBox::TYPE,
            box_size: BoxSize::with_payload_size(MdatBox::TYPE, payload_size),
        };

        let mut moov_size = moov.encoded_size()?;
        let mut stable = false;
        for iteration in 0..options.max_size_pass_iterations {
            let data_start = (prefix.len() + moov_size + mdat_header.external_size()) as u64;
            assign_chunk_offsets(&mut moov, &plan, data_start)?;
            let new_size = moov.encoded_size()?;
            tracing::debug!(iteration, moov_size = new_size, data_start, "size pass");
            if new_size == moov_size {
                stable = true;
                break;
            }
            moov_size = new_size;
        }
        if !stable {
            return Err(FileError::Layout(format!(
                "chunk offsets did not settle within {} size passes",
                options.max_size_pass_iterations
            )));
        }

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            writer.write_all(&prefix)?;
            writer.write_all(&moov.encode_to_vec()?)?;
            writer.write_all(&mdat_header.encode_to_vec()?)?;
            for chunk in &plan {
                for &(offset, len) in &chunk.pieces {
                    copy_media(state, offset, len, &mut writer)?;
                }
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        let file = temp.persist(path).map_err(|e| e.error)?;
        let len = file.metadata()?.len();

        tracing::info!(
            path = %path.display(),
            size = len,
            tracks = moov.trak_boxes.len(),
            chunks = plan.len(),
            "saved file"
        );

        state.moov = moov;
        state.source = Some(SourceFile {
            path: path.to_path_buf(),
            file,
            len,
        });
        state.append_base = len;
        state.media_data = vec![(
            (prefix.len() + moov_size + mdat_header.external_size()) as u64,
            payload_size,
        )];
        state.append_buffer = Vec::new();
        state.open_chunk = None;
        Ok(())
    }

    /// ハンドルを閉じる
    ///
    /// 以降の操作は全て [`FileError::Closed`] となる
    pub fn close(&mut self) -> Result<(), FileError> {
        let state = self.state.take().ok_or(FileError::Closed)?;
        if let Some(source) = &state.source {
            tracing::debug!(path = %source.path.display(), "closed file");
        }
        Ok(())
    }

    fn state(&self) -> Result<&FileState, FileError> {
        self.state.as_ref().ok_or(FileError::Closed)
    }

    fn state_mut(&mut self) -> Result<&mut FileState, FileError> {
        self.state.as_mut().ok_or(FileError::Closed)
    }

    fn editable(&mut self) -> Result<&mut FileState, FileError> {
        let state = self.state_mut()?;
        if state.mode == OpenMode::ReadOnly {
            return Err(FileError::ReadOnly);
        }
        Ok(state)
    }
}

/// トップレベルのボックスを順に読み込み、moov を返す
///
/// mdat は読み込まずに読み飛ばす。サイズが 0 のボックスはファイルの末尾まで続くものとして扱う
fn read_top_level_boxes(
    file: &mut File,
    len: u64,
    options: OpenOptions,
    state: &mut FileState,
) -> Result<MoovBox, FileError> {
    let mut moov: Option<MoovBox> = None;
    let mut position = 0;
    while position < len {
        let mut header_buf = [0; BoxHeader::MAX_SIZE];
        let available = (len - position).min(BoxHeader::MAX_SIZE as u64) as usize;
        file.seek(SeekFrom::Start(position))?;
        file.read_exact(&mut header_buf[..available])?;
        let (header, _) = BoxHeader::decode(&header_buf[..available])?;
        let box_size = match header.box_size.get() {
            0 => len - position,
            size => size,
        };
        let end = position
            .checked_add(box_size)
            .filter(|&end| end <= len)
            .ok_or_else(|| {
                Error::truncated(format!(
                    "Box at offset {position} declares {box_size} bytes, but the file has {len} bytes"
                ))
                .with_box_type(header.box_type)
            })?;

        match header.box_type {
            MdatBox::TYPE => {
                let header_size = header.external_size() as u64;
                state
                    .media_data
                    .push((position + header_size, box_size.saturating_sub(header_size)));
                tracing::debug!(position, box_size, "recorded media data");
            }
            FreeBox::TYPE => {
                tracing::debug!(
                    box_type = %header.box_type,
                    position,
                    box_size,
                    "skipped top-level box"
                );
            }
            box_type => {
                let bytes = read_box_bytes(file, position, box_size)?;
                match box_type {
                    FtypBox::TYPE => state.ftyp = Some(FtypBox::decode(&bytes)?.0),
                    MoovBox::TYPE => {
                        if moov.is_some() {
                            return Err(Error::with_reason(
                                ErrorKind::DuplicateBox,
                                "Duplicate top-level 'moov' box",
                            )
                            .into());
                        }
                        moov = Some(MoovBox::decode(&bytes)?.0);
                    }
                    MoofBox::TYPE => {
                        let moof = MoofBox::decode(&bytes)?.0;
                        match (&mut moov, options.merge_fragments) {
                            (Some(moov), true) => state.merger.merge(moov, &moof, position)?,
                            (None, true) => {
                                return Err(Error::invalid_file(
                                    "A 'moof' box appeared before the 'moov' box",
                                )
                                .into());
                            }
                            (_, false) => state.fragments.push((position, moof)),
                        }
                    }
                    _ => state.other_boxes.push(parse_box(&bytes)?.0),
                }
            }
        }
        position = end;
    }

    moov.ok_or_else(|| {
        FileError::Box(Error::missing_mandatory_box(
            MoovBox::TYPE,
            BoxType::Normal(*b"file"),
        ))
    })
}

fn read_box_bytes(file: &mut File, position: u64, box_size: u64) -> Result<Vec<u8>, FileError> {
    let size = usize::try_from(box_size)
        .map_err(|_| Error::unsupported(format!("Box of {box_size} bytes cannot be loaded")))?;
    let mut bytes = try_vec_with_capacity(size)?;
    file.seek(SeekFrom::Start(position))?;
    Read::by_ref(file).take(box_size).read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// `offset` から `len` バイトのメディアデータを `writer` へコピーする
fn copy_media<W: Write>(
    state: &FileState,
    offset: u64,
    len: u64,
    writer: &mut W,
) -> Result<(), FileError> {
    if offset >= state.append_base {
        let start = (offset - state.append_base) as usize;
        let data = start
            .checked_add(len as usize)
            .and_then(|end| state.append_buffer.get(start..end))
            .ok_or_else(|| {
                Error::invalid_file(format!(
                    "Media data at {offset} (+{len}) lies outside the appended samples"
                ))
            })?;
        writer.write_all(data)?;
        return Ok(());
    }

    let source = state
        .source
        .as_ref()
        .filter(|s| offset.checked_add(len).is_some_and(|end| end <= s.len))
        .ok_or_else(|| {
            Error::invalid_file(format!(
                "Media data at {offset} (+{len}) lies outside the source file"
            ))
        })?;
    let mut file = &source.file;
    file.seek(SeekFrom::Start(offset))?;
    let copied = std::io::copy(&mut file.take(len), writer)?;
    if copied != len {
        return Err(Error::truncated(format!(
            "Expected {len} bytes of media data at {offset}, but only {copied} bytes were read"
        ))
        .into());
    }
    Ok(())
}

/// 書き出すチャンクとその順序を決める
fn plan_chunks(moov: &mut MoovBox, layout: Layout) -> Result<Vec<PlannedChunk>, Error> {
    let mut plan = Vec::new();
    for (track_index, trak) in moov.trak_boxes.iter_mut().enumerate() {
        let timescale = trak.mdia()?.mdhd()?.timescale;
        let stbl = trak.stbl_mut()?;
        stbl.check_consistency()?;
        match layout {
            Layout::Preserve => plan_preserved(stbl, track_index, timescale, &mut plan)?,
            Layout::Interleaved { chunk_duration } => {
                let limit = duration_in_timescale(chunk_duration, timescale);
                plan_interleaved(stbl, track_index, timescale, limit, &mut plan)?
            }
        }
    }

    match layout {
        Layout::Preserve => plan.sort_by_key(|c| (c.source_offset, c.track_index, c.track_order)),
        Layout::Interleaved { .. } => plan.sort_by(|a, b| {
            let a_time = a.start_time as u128 * b.timescale.get() as u128;
            let b_time = b.start_time as u128 * a.timescale.get() as u128;
            a_time
                .cmp(&b_time)
                .then(a.track_index.cmp(&b.track_index))
                .then(a.track_order.cmp(&b.track_order))
        }),
    }
    Ok(plan)
}

fn plan_preserved(
    stbl: &mut StblBox,
    track_index: usize,
    timescale: NonZeroU32,
    plan: &mut Vec<PlannedChunk>,
) -> Result<(), Error> {
    let mut sample_number = 1;
    for (track_order, chunk) in stbl.chunks()?.into_iter().enumerate() {
        let start_time = stbl.decode_time(sample_number).unwrap_or(0);
        let mut size = 0;
        for n in sample_number..sample_number + chunk.sample_count {
            size += stbl.sample_size(n).unwrap_or(0) as u64;
        }
        plan.push(PlannedChunk {
            track_index,
            track_order,
            description_index: chunk.description_index,
            sample_count: chunk.sample_count,
            start_time,
            timescale,
            source_offset: chunk.offset,
            pieces: vec![(chunk.offset, size)],
        });
        sample_number += chunk.sample_count;
    }
    Ok(())
}

fn plan_interleaved(
    stbl: &mut StblBox,
    track_index: usize,
    timescale: NonZeroU32,
    limit: u64,
    plan: &mut Vec<PlannedChunk>,
) -> Result<(), Error> {
    let mut current: Option<PlannedChunk> = None;
    let mut track_order = 0;
    for n in 1..=stbl.sample_count() {
        let missing = || Error::invalid_file(format!("Sample #{n} is not described by the tables"));
        let offset = stbl.sample_offset(n).ok_or_else(missing)?;
        let size = stbl.sample_size(n).ok_or_else(missing)?;
        let decode_time = stbl.decode_time(n).ok_or_else(missing)?;
        let end_time = decode_time + stbl.sample_duration(n).ok_or_else(missing)? as u64;
        let description_index = stbl.sample_to_chunk(n).ok_or_else(missing)?.description_index;

        // 空でないチャンクは、末尾のサンプルの終了時刻が上限を超えない範囲で延ばす
        let starts_new = current.as_ref().is_none_or(|c| {
            c.description_index != description_index || end_time - c.start_time > limit
        });
        if starts_new {
            plan.extend(current.take());
            current = Some(PlannedChunk {
                track_index,
                track_order,
                description_index,
                sample_count: 0,
                start_time: decode_time,
                timescale,
                source_offset: offset,
                pieces: Vec::new(),
            });
            track_order += 1;
        }
        if let Some(c) = &mut current {
            c.sample_count += 1;
            c.push_piece(offset, size as u64);
        }
    }
    plan.extend(current);
    Ok(())
}

/// `data_start` から順にチャンクを並べた場合のオフセットで、各トラックのチャンク配置を置き換える
fn assign_chunk_offsets(
    moov: &mut MoovBox,
    plan: &[PlannedChunk],
    data_start: u64,
) -> Result<(), Error> {
    let mut per_track: Vec<Vec<(usize, Chunk)>> =
        (0..moov.trak_boxes.len()).map(|_| Vec::new()).collect();
    let mut offset = data_start;
    for planned in plan {
        per_track[planned.track_index].push((
            planned.track_order,
            Chunk {
                offset,
                sample_count: planned.sample_count,
                description_index: planned.description_index,
            },
        ));
        offset += planned.size();
    }
    for (trak, mut chunks) in moov.trak_boxes.iter_mut().zip(per_track) {
        chunks.sort_by_key(|c| c.0);
        let chunks: Vec<Chunk> = chunks.into_iter().map(|c| c.1).collect();
        trak.stbl_mut()?.rechunk(&chunks)?;
    }
    Ok(())
}

fn duration_in_timescale(duration: Duration, timescale: NonZeroU32) -> u64 {
    let ticks = duration.as_nanos() * timescale.get() as u128 / 1_000_000_000;
    u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
}

fn next_track_id(track_id: u32) -> Result<u32, Error> {
    track_id
        .checked_add(1)
        .ok_or_else(|| Error::unsupported("No track ID is left"))
}

fn refresh_movie_duration(moov: &mut MoovBox) -> Result<(), Error> {
    let duration = moov
        .trak_boxes
        .iter()
        .filter_map(|t| t.tkhd_box.as_ref().map(|h| h.duration))
        .max()
        .unwrap_or(0);
    moov.mvhd_mut()?.duration = duration;
    Ok(())
}
