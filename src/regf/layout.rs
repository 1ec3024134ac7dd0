//! REGF header parsing and hbin-aligned block geometry.
//!
//! Grounded in the same "parse a small fixed header, derive addressable
//! ranges" shape as `fat::geometry`, but the Registry format needs no
//! lookup table: every field needed to compute block/inode ranges is
//! carried in the 4 KiB-aligned REGF header itself.

use crate::byte_decoder::{ByteDecoder, Endian};
use crate::error::{ErrorKind, Result};
use crate::image::ImageReader;

pub const HBIN_SIZE: u32 = 4096;
pub const REGF_MAGIC: &[u8; 4] = b"regf";
pub const FIRST_HBIN_OFFSET: u64 = HBIN_SIZE as u64;
const HIVE_NAME_LEN: usize = 60;

/// Decoded REGF header fields.
#[derive(Clone, Debug)]
pub struct RegfLayout {
    pub seq1: u32,
    pub seq2: u32,
    pub major: u32,
    pub minor: u32,
    pub first_key_offset: u32,
    pub last_hbin_offset: u32,
    pub hive_name: String,
}

impl RegfLayout {
    pub fn open(image: &mut dyn ImageReader, base_offset: u64) -> Result<Self> {
        let mut header = [0u8; 4096];
        image.read_at(base_offset, &mut header)?;

        if &header[0..4] != REGF_MAGIC {
            crate::error::bail!(ErrorKind::FormatMagic, "REGF header", "magic mismatch");
        }
        let d = ByteDecoder::new(&header, Endian::Little);
        let seq1 = d.u32(4).expect("4096-byte header buffer");
        let seq2 = d.u32(8).expect("4096-byte header buffer");
        let major = d.u32(20).expect("4096-byte header buffer");
        let minor = d.u32(24).expect("4096-byte header buffer");
        let first_key_offset = d.u32(36).expect("4096-byte header buffer");
        let last_hbin_offset = d.u32(40).expect("4096-byte header buffer");

        if last_hbin_offset % HBIN_SIZE != 0 {
            log::warn!("REGF last_hbin_offset {} is not a multiple of {}", last_hbin_offset, HBIN_SIZE);
        }

        let name_bytes = d.bytes(48, HIVE_NAME_LEN).unwrap_or(&[]);
        let hive_name = decode_utf16le_lossy(name_bytes);

        Ok(RegfLayout {
            seq1,
            seq2,
            major,
            minor,
            first_key_offset,
            last_hbin_offset,
            hive_name,
        })
    }

    pub fn synchronized(&self) -> bool {
        self.seq1 == self.seq2
    }
}

/// Decodes a UTF-16LE byte run, trimming the first embedded NUL onward.
/// Invalid code units are replaced rather than failing the whole field,
/// falling back to a lossy decode rather than failing the whole field, since
/// these strings are display-only.
pub fn decode_utf16le_lossy(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::StreamImageReader;
    use std::io::Cursor;

    fn make_header(seq1: u32, seq2: u32, last_hbin: u32, name: &str) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        buf[0..4].copy_from_slice(REGF_MAGIC);
        buf[4..8].copy_from_slice(&seq1.to_le_bytes());
        buf[8..12].copy_from_slice(&seq2.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[24..28].copy_from_slice(&3u32.to_le_bytes());
        buf[36..40].copy_from_slice(&0x20u32.to_le_bytes());
        buf[40..44].copy_from_slice(&last_hbin.to_le_bytes());
        let utf16: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        buf[48..48 + utf16.len()].copy_from_slice(&utf16);
        buf
    }

    #[test]
    fn parses_header_fields_and_synchronized_flag() {
        let buf = make_header(7, 7, 4096 * 3, "SAM");
        let mut r = StreamImageReader::new(Cursor::new(buf), 0);
        let layout = RegfLayout::open(&mut r, 0).unwrap();
        assert!(layout.synchronized());
        assert_eq!(layout.last_hbin_offset, 4096 * 3);
        assert_eq!(layout.hive_name, "SAM");
        assert_eq!(layout.first_key_offset, 0x20);
    }

    #[test]
    fn mismatched_sequences_are_not_synchronized() {
        let buf = make_header(7, 8, 4096, "x");
        let mut r = StreamImageReader::new(Cursor::new(buf), 0);
        let layout = RegfLayout::open(&mut r, 0).unwrap();
        assert!(!layout.synchronized());
    }

    #[test]
    fn bad_magic_is_format_magic_error() {
        let mut buf = vec![0u8; 4096];
        buf[0..4].copy_from_slice(b"NOPE");
        let mut r = StreamImageReader::new(Cursor::new(buf), 0);
        let err = RegfLayout::open(&mut r, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatMagic);
    }
}
