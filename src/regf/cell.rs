//! Registry cell header decoding.
//!
//! A cell is the hive's only variable-length record: a signed 32-bit length
//! word (sign bit marks allocation, magnitude is the byte length) followed
//! by a 2-byte record-type signature. Grounded in the same "decode a small
//! fixed header, classify a tag field" shape as the FAT back-end's
//! `chain::classify`, adapted to cells instead of FAT entries.

use crate::byte_decoder::{ByteDecoder, Endian};
use crate::error::{ErrorKind, Result};
use crate::image::ImageReader;
use crate::regf::layout::HBIN_SIZE;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CellType {
    Vk,
    Nk,
    Lf,
    Lh,
    Li,
    Ri,
    Sk,
    Db,
    Unknown(u16),
}

impl CellType {
    fn from_signature(sig: u16) -> Self {
        match sig {
            0x6b76 => CellType::Vk,
            0x6b6e => CellType::Nk,
            0x666c => CellType::Lf,
            0x686c => CellType::Lh,
            0x696c => CellType::Li,
            0x6972 => CellType::Ri,
            0x6b73 => CellType::Sk,
            0x6264 => CellType::Db,
            other => CellType::Unknown(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CellType::Vk => "VK",
            CellType::Nk => "NK",
            CellType::Lf => "LF",
            CellType::Lh => "LH",
            CellType::Li => "LI",
            CellType::Ri => "RI",
            CellType::Sk => "SK",
            CellType::Db => "DB",
            CellType::Unknown(_) => "unknown",
        }
    }
}

/// A decoded cell header: allocation status, length, and record-type tag.
#[derive(Clone, Debug)]
pub struct RegfCell {
    pub inode: u64,
    pub length: u32,
    pub is_allocated: bool,
    pub cell_type: CellType,
    pub body: Vec<u8>,
}

/// Loads the cell at byte offset `inum` within the image (hive-relative,
/// exposed as a whole-image offset).
pub fn reg_load_cell(image: &mut dyn ImageReader, base_offset: u64, inum: u64) -> Result<RegfCell> {
    let mut len_buf = [0u8; 4];
    image.read_at(base_offset + inum, &mut len_buf)?;
    let raw_len = i32::from_le_bytes(len_buf);
    let is_allocated = raw_len < 0;
    let length = raw_len.unsigned_abs();

    if length as u64 > HBIN_SIZE as u64 || length < 4 {
        crate::error::bail!(
            ErrorKind::InodeCorrupt,
            "regf cell length",
            format!("inum={} length={}", inum, length)
        );
    }
    let page_offset = inum % HBIN_SIZE as u64;
    if page_offset + length as u64 > HBIN_SIZE as u64 {
        crate::error::bail!(
            ErrorKind::InodeCorrupt,
            "regf cell crosses hbin boundary",
            format!("inum={} length={} page_offset={}", inum, length, page_offset)
        );
    }

    let mut body = vec![0u8; length as usize];
    image.read_at(base_offset + inum, &mut body)?;

    let d = ByteDecoder::new(&body, Endian::Little);
    let sig = d.u16(4).unwrap_or(0);
    let cell_type = CellType::from_signature(sig);

    Ok(RegfCell {
        inode: inum,
        length,
        is_allocated,
        cell_type,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::StreamImageReader;
    use std::io::Cursor;

    fn cell_bytes(raw_len: i32, sig: &[u8; 2], extra: &[u8]) -> Vec<u8> {
        let mut v = raw_len.to_le_bytes().to_vec();
        v.extend_from_slice(sig);
        v.extend_from_slice(extra);
        v
    }

    #[test]
    fn s5_allocated_cell_with_high_bit_reports_length_and_allocated() {
        // raw length word 0x80000030: high bit set -> allocated, magnitude 0x30.
        let mut data = vec![0u8; 0x1000 + 0x30];
        let header = 0x80000030u32.to_le_bytes();
        data[0x1000..0x1004].copy_from_slice(&header);
        data[0x1004..0x1006].copy_from_slice(&0x6b6eu16.to_le_bytes()); // NK
        let mut r = StreamImageReader::new(Cursor::new(data), 0);
        let cell = reg_load_cell(&mut r, 0, 0x1000).unwrap();
        assert!(cell.is_allocated);
        assert_eq!(cell.length, 0x30);
        assert_eq!(cell.cell_type, CellType::Nk);
    }

    #[test]
    fn unallocated_cell_has_positive_raw_length() {
        let bytes = cell_bytes(0x20, b"vk", &[0u8; 0x20 - 6]);
        let mut r = StreamImageReader::new(Cursor::new(bytes), 0);
        let cell = reg_load_cell(&mut r, 0, 0).unwrap();
        assert!(!cell.is_allocated);
        assert_eq!(cell.cell_type, CellType::Vk);
    }

    #[test]
    fn unknown_signature_is_unknown_type() {
        let bytes = cell_bytes(-0x20, b"zz", &[0u8; 0x20 - 6]);
        let mut r = StreamImageReader::new(Cursor::new(bytes), 0);
        let cell = reg_load_cell(&mut r, 0, 0).unwrap();
        assert_eq!(cell.cell_type, CellType::Unknown(0x7a7a));
    }

    #[test]
    fn length_exceeding_hbin_size_is_corrupt() {
        let mut data = vec![0u8; 8];
        data[0..4].copy_from_slice(&(-(HBIN_SIZE as i32 + 4)).to_le_bytes());
        let mut r = StreamImageReader::new(Cursor::new(data.clone()), 0);
        let err = reg_load_cell(&mut r, 0, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InodeCorrupt);
        let _ = &mut data;
    }
}
