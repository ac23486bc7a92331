//! サンプルテーブルの補助的なボックス群（stsh / stdp / sdtp / padb / stsf）の定義
//!
//! stdp と sdtp は自身のエントリー数を持たないため、エントリー数をボックスの残りサイズから推定する。
//! 推定値と stsz のサンプル数との食い違いは、親の [`StblBox`](crate::boxes::StblBox) が警告ログとして出力する
use crate::{
    BaseBox, BoxHeader, BoxType, Decode, Encode, FullBox, FullBoxFlags, FullBoxHeader, Result,
    boxes::{box_size, copy_payload, encode_all, encode_box, note_trailing_bytes, with_box_type},
    codec::{decode_entries, entry_count_u32, try_push, try_vec_with_capacity},
};

/// [`StshBox`] が保持するエントリー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StshEntry {
    pub shadowed_sample_number: u32,
    pub sync_sample_number: u32,
}

/// [ISO/IEC 14496-12] ShadowSyncSampleBox class (親: [`StblBox`](crate::boxes::StblBox))
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StshBox {
    pub entries: Vec<StshEntry>,
}

impl StshBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stsh");

    fn payload_size(&self) -> usize {
        4 + 4 + self.entries.len() * 8
    }
}

impl Encode for StshBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let count = entry_count_u32(self.entries.len(), "stsh")?;
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += count.encode(&mut buf[offset..])?;
            for entry in &self.entries {
                offset += entry.shadowed_sample_number.encode(&mut buf[offset..])?;
                offset += entry.sync_sample_number.encode(&mut buf[offset..])?;
            }
            Ok(offset)
        })
    }
}

impl Decode for StshBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let count = u32::decode_at(payload, &mut offset)? as usize;
            let entries = decode_entries(payload, &mut offset, count, 8, |buf, offset| {
                Ok(StshEntry {
                    shadowed_sample_number: u32::decode_at(buf, offset)?,
                    sync_sample_number: u32::decode_at(buf, offset)?,
                })
            })?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((Self { entries }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for StshBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for StshBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] DegradationPriorityBox class (親: [`StblBox`](crate::boxes::StblBox))
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StdpBox {
    /// サンプルごとの優先度（エントリー数はボックスサイズから推定される）
    pub priorities: Vec<u16>,
}

impl StdpBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stdp");
}

impl Encode for StdpBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, 4 + self.priorities.len() * 2))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, 4 + self.priorities.len() * 2, buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += encode_all(&self.priorities, &mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for StdpBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let count = (payload.len() - offset) / 2;
            let priorities = decode_entries(payload, &mut offset, count, 2, u16::decode_at)?;
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((Self { priorities }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for StdpBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for StdpBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] SampleDependencyTypeBox class
/// (親: [`StblBox`](crate::boxes::StblBox), [`TrafBox`](crate::boxes::TrafBox))
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SdtpBox {
    /// サンプルごとの依存関係フラグ
    ///
    /// 上位ビットから順に `is_leading` 、 `sample_depends_on` 、
    /// `sample_is_depended_on` 、 `sample_has_redundancy` の 2 ビットずつが並ぶ
    pub entries: Vec<u8>,
}

impl SdtpBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"sdtp");

    /// 指定されたサンプル（0 始まり）が他のサンプルに依存しない（`sample_depends_on == 2`）かどうか
    pub fn is_independent(&self, index: usize) -> Option<bool> {
        self.entries.get(index).map(|e| (e >> 4) & 0b11 == 2)
    }
}

impl Encode for SdtpBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, 4 + self.entries.len()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(Self::TYPE, 4 + self.entries.len(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += self.entries.encode(&mut buf[offset..])?;
            Ok(offset)
        })
    }
}

impl Decode for SdtpBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let entries = copy_payload(&payload[offset..])?;

            Ok((Self { entries }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for SdtpBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for SdtpBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [ISO/IEC 14496-12] PaddingBitsBox class (親: [`StblBox`](crate::boxes::StblBox))
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PadbBox {
    /// サンプルごとのパディングビット数（下位 3 ビットのみが有効）
    pub pads: Vec<u8>,
}

impl PadbBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"padb");

    fn payload_size(&self) -> usize {
        4 + 4 + self.pads.len().div_ceil(2)
    }
}

impl Encode for PadbBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let count = entry_count_u32(self.pads.len(), "padb")?;
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += count.encode(&mut buf[offset..])?;

            // 一バイトに二サンプル分を格納する（上位側が後ろのサンプル）
            for pair in self.pads.chunks(2) {
                let first = pair[0] & 0b111;
                let second = pair.get(1).map_or(0, |p| p & 0b111);
                offset += ((second << 4) | first).encode(&mut buf[offset..])?;
            }
            Ok(offset)
        })
    }
}

impl Decode for PadbBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let count = u32::decode_at(payload, &mut offset)? as usize;
            let bytes = decode_entries(payload, &mut offset, count.div_ceil(2), 1, u8::decode_at)?;

            let mut pads = try_vec_with_capacity(count)?;
            for (i, b) in bytes.iter().enumerate() {
                pads.push(b & 0b111);
                if i * 2 + 1 < count {
                    pads.push((b >> 4) & 0b111);
                }
            }
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((Self { pads }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for PadbBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for PadbBox {
    fn full_box_version(&self) -> u8 {
        0
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(0)
    }
}

/// [`StsfBox`] が保持するエントリー
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StsfEntry {
    pub sample_number: u32,
    pub fragment_sizes: Vec<u16>,
}

/// SampleFragmentBox class (親: [`StblBox`](crate::boxes::StblBox))
///
/// サンプルを複数の断片に分けて格納する場合の、各断片のサイズを保持する
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StsfBox {
    pub entries: Vec<StsfEntry>,
}

impl StsfBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stsf");

    fn payload_size(&self) -> usize {
        4 + 4
            + self
                .entries
                .iter()
                .map(|e| 8 + e.fragment_sizes.len() * 2)
                .sum::<usize>()
    }
}

impl Encode for StsfBox {
    fn encoded_size(&self) -> Result<usize> {
        Ok(box_size(Self::TYPE, self.payload_size()))
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let count = entry_count_u32(self.entries.len(), "stsf")?;
        encode_box(Self::TYPE, self.payload_size(), buf, |buf| {
            let mut offset = FullBoxHeader::from_box(self).encode(buf)?;
            offset += count.encode(&mut buf[offset..])?;
            for entry in &self.entries {
                let fragment_count = entry_count_u32(entry.fragment_sizes.len(), "stsf fragment")?;
                offset += entry.sample_number.encode(&mut buf[offset..])?;
                offset += fragment_count.encode(&mut buf[offset..])?;
                offset += encode_all(&entry.fragment_sizes, &mut buf[offset..])?;
            }
            Ok(offset)
        })
    }
}

impl Decode for StsfBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        with_box_type(Self::TYPE, || {
            let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
            header.box_type.expect(Self::TYPE)?;

            let mut offset = 0;
            let _full_header = FullBoxHeader::decode_at(payload, &mut offset)?;
            let count = u32::decode_at(payload, &mut offset)?;

            let mut entries = Vec::new();
            for _ in 0..count {
                let sample_number = u32::decode_at(payload, &mut offset)?;
                let fragment_count = u32::decode_at(payload, &mut offset)? as usize;
                let fragment_sizes =
                    decode_entries(payload, &mut offset, fragment_count, 2, u16::decode_at)?;
                try_push(
                    &mut entries,
                    StsfEntry {
                        sample_number,
                        fragment_sizes,
                    },
                )?;
            }
            note_trailing_bytes(Self::TYPE, payload.len() - offset);

            Ok((Self { entries }, header.external_size() + payload.len()))
        })
    }
}

impl BaseBox for StsfBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

impl FullBox for StsfBox {
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

    #[test]
    fn padb_packs_two_samples_per_byte() {
        let padb = PadbBox {
            pads: vec![1, 2, 7],
        };
        let bytes = padb.encode_to_vec().expect("encode");
        assert_eq!(bytes.len(), 12 + 4 + 2);
        assert_eq!(&bytes[16..], [0x21, 0x07]);
        assert_eq!(PadbBox::decode(&bytes).expect("decode").0, padb);
    }

    #[test]
    fn stdp_count_is_inferred_from_size() {
        let mut bytes = vec![0, 0, 0, 19];
        bytes.extend_from_slice(b"stdp");
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(&[0, 1, 0, 2, 0, 3, 9]);
        let (stdp, size) = StdpBox::decode(&bytes).expect("decode");
        assert_eq!(size, 19);
        assert_eq!(stdp.priorities, [1, 2, 3]);
    }

    #[test]
    fn sdtp_entries() {
        let sdtp = SdtpBox {
            entries: vec![0b0010_0000, 0b0001_0000],
        };
        assert_eq!(sdtp.is_independent(0), Some(true));
        assert_eq!(sdtp.is_independent(1), Some(false));
        assert_eq!(sdtp.is_independent(2), None);

        let bytes = sdtp.encode_to_vec().expect("encode");
        assert_eq!(SdtpBox::decode(&bytes).expect("decode").0, sdtp);
    }

    #[test]
    fn stsf_round_trip() {
        let stsf = StsfBox {
            entries: vec![StsfEntry {
                sample_number: 3,
                fragment_sizes: vec![100, 200],
            }],
        };
        let bytes = stsf.encode_to_vec().expect("encode");
        assert_eq!(bytes.len(), 12 + 4 + 8 + 4);
        assert_eq!(StsfBox::decode(&bytes).expect("decode").0, stsf);
    }
}
