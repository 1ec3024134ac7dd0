//! Registry back-end: the uniform `FileSystem` interface over a hive
//! dispatching `istat` to a per-record-kind renderer the way
//! `jack695-FATForensics`'s volume/dir_entry display code renders each
//! directory-entry kind separately rather than one generic hex dump.

use std::cmp::Ordering;

use crate::byte_decoder::{ByteDecoder, Endian};
use crate::core::{
    Action, BlockFlags, BlockVisitor, DeclaredType, FileSystem, FsInfo, InodeMeta, InodeType, StatSink, WalkFlags,
};
use crate::error::{Error, ErrorKind, Result};
use crate::image::ImageReader;
use crate::regf::cell::{reg_load_cell, CellType, RegfCell};
use crate::regf::layout::{decode_utf16le_lossy, RegfLayout, FIRST_HBIN_OFFSET, HBIN_SIZE};

const HBIN_HEADER_LEN: u64 = 0x20;
const KEY_NAME_MAX: usize = 512;
const CLASS_NAME_MAX: usize = 512;
const ROOT_RECORD_SIGNATURE: u16 = 0x2C;
const FILETIME_EPOCH_OFFSET_100NS: i64 = 116_444_736_000_000_000;

pub struct RegfBackend {
    image: Box<dyn ImageReader>,
    base_offset: u64,
    info: FsInfo,
    layout: RegfLayout,
}

impl RegfBackend {
    pub fn open(mut image: Box<dyn ImageReader>, base_offset: u64) -> Result<Self> {
        log::debug!("opening REGF backend at offset {}", base_offset);
        let layout = RegfLayout::open(image.as_mut(), base_offset)?;
        let image_size = image.len()?.saturating_sub(base_offset);

        let info = FsInfo {
            declared_type: DeclaredType::Reg,
            endian: Endian::Little,
            image_offset: base_offset,
            block_size: HBIN_SIZE,
            first_block: 0,
            last_block: layout.last_hbin_offset as u64,
            last_block_actual: image_size / HBIN_SIZE as u64,
            first_inode: FIRST_HBIN_OFFSET,
            last_inode: layout.last_hbin_offset as u64 + HBIN_SIZE as u64,
            root_inode: FIRST_HBIN_OFFSET + layout.first_key_offset as u64,
        };

        Ok(RegfBackend {
            image,
            base_offset,
            info,
            layout,
        })
    }

    fn read_hbin(&mut self, addr: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; HBIN_SIZE as usize];
        self.image.read_at(self.base_offset + addr, &mut buf)?;
        Ok(buf)
    }

    fn class_name(&mut self, class_offset: u32, class_length: u16) -> Result<Option<String>> {
        if class_offset == 0xFFFF_FFFF || class_length == 0 {
            return Ok(None);
        }
        let len = (class_length as usize).min(CLASS_NAME_MAX);
        let mut raw = vec![0u8; len];
        let addr = self.base_offset + FIRST_HBIN_OFFSET + class_offset as u64 + 4;
        self.image.read_at(addr, &mut raw)?;
        Ok(Some(decode_utf16le_lossy(&raw)))
    }
}

impl FileSystem for RegfBackend {
    fn info(&self) -> &FsInfo {
        &self.info
    }

    fn close(&mut self) -> Result<()> {
        log::debug!("closing REGF backend");
        Ok(())
    }

    fn block_getflags(&mut self, _addr: u64) -> Result<BlockFlags> {
        // Hbins are always allocated and always both metadata and content
        // they hold the page header plus whatever cells live
        // inside it.
        Ok(BlockFlags::ALLOC | BlockFlags::META | BlockFlags::CONTENT)
    }

    fn block_walk(&mut self, start: u64, end: u64, flags: WalkFlags, visitor: &mut dyn BlockVisitor) -> Result<()> {
        let block_flags = BlockFlags::ALLOC | BlockFlags::META | BlockFlags::CONTENT;
        if !flags.admits(block_flags) {
            return Ok(());
        }
        let mut addr = start - (start % HBIN_SIZE as u64);
        while addr <= end {
            let buf = self.read_hbin(addr)?;
            let view = crate::core::BlockView {
                addr,
                flags: block_flags,
                data: &buf,
            };
            match visitor.visit(&view) {
                Action::Continue => {}
                Action::Stop => return Ok(()),
                Action::Error => return Err(Error::new(ErrorKind::WalkRange, "block_walk", "visitor error")),
            }
            addr += HBIN_SIZE as u64;
        }
        Ok(())
    }

    fn inode_open(&mut self, inum: u64) -> Result<InodeMeta> {
        let cell = reg_load_cell(self.image.as_mut(), self.base_offset, inum)?;
        let itype = match cell.cell_type {
            CellType::Vk => InodeType::Regular,
            CellType::Nk => InodeType::Directory,
            _ => InodeType::Virtual,
        };

        let (mtime_secs, mtime_nanos) = if cell.cell_type == CellType::Nk {
            let d = ByteDecoder::new(&cell.body, Endian::Little);
            d.u64(8).map(decode_filetime).unwrap_or((0, 0))
        } else {
            (0, 0)
        };

        Ok(InodeMeta {
            inum,
            itype,
            mode: 0o7777,
            nlink: 1,
            uid: 0,
            gid: 0,
            size: cell.length as u64,
            content: cell.body,
            mtime_secs,
            mtime_nanos,
        })
    }

    fn fsstat(&mut self, out: &mut dyn StatSink) -> Result<()> {
        out.write_line(&format!("File System Type: {}", self.info.declared_type))?;
        out.write_line(&format!("Version: {}.{}", self.layout.major, self.layout.minor))?;
        out.write_line(&format!("Synchronized: {}", if self.layout.synchronized() { "Yes" } else { "No" }))?;
        out.write_line(&format!("Hive Name: {}", self.layout.hive_name))?;
        out.write_line(&format!("First Key Offset: {:#x}", self.layout.first_key_offset))?;
        out.write_line(&format!("Last Hbin Offset: {:#x}", self.layout.last_hbin_offset))?;
        out.write_line(&format!(
            "Hbin Range: {} - {}",
            self.info.first_block, self.info.last_block_actual
        ))?;
        Ok(())
    }

    fn istat(&mut self, out: &mut dyn StatSink, inum: u64, _forced_block_count: u64, time_skew_seconds: i64) -> Result<()> {
        let cell = reg_load_cell(self.image.as_mut(), self.base_offset, inum)?;
        out.write_line(&format!("Cell: {:#x}", inum))?;
        out.write_line(&format!("Allocated: {}", cell.is_allocated))?;
        out.write_line(&format!("Length: {}", cell.length))?;
        out.write_line(&format!("Type: {}", cell.cell_type.name()))?;

        match cell.cell_type {
            CellType::Nk => self.istat_nk(out, &cell, time_skew_seconds)?,
            _ => {}
        }
        Ok(())
    }

    fn name_compare(&self, a: &str, b: &str) -> Ordering {
        a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
    }

    /// Iterates every cell in every hbin page in `[start,end]`, skipping
    /// each page's 32-byte header and walking cells sequentially by
    /// `abs(length)`. ALLOC/UNALLOC is the cell's own allocation bit;
    /// META/CONTENT both always pass.
    fn jentry_walk(&mut self, visitor: &mut dyn BlockVisitor) -> Result<()> {
        let mut hbin_addr = self.info.first_inode;
        let last = self.info.last_inode;
        while hbin_addr < last {
            let mut cell_addr = hbin_addr + HBIN_HEADER_LEN;
            let page_end = hbin_addr + HBIN_SIZE as u64;
            while cell_addr < page_end {
                let cell = match reg_load_cell(self.image.as_mut(), self.base_offset, cell_addr) {
                    Ok(c) => c,
                    Err(_) => break,
                };
                let block_flags = BlockFlags::META
                    | BlockFlags::CONTENT
                    | if cell.is_allocated { BlockFlags::ALLOC } else { BlockFlags::UNALLOC };
                let view = crate::core::BlockView {
                    addr: cell_addr,
                    flags: block_flags,
                    data: &cell.body,
                };
                match visitor.visit(&view) {
                    Action::Continue => {}
                    Action::Stop => return Ok(()),
                    Action::Error => return Err(Error::new(ErrorKind::WalkRange, "jentry_walk", "visitor error")),
                }
                cell_addr += cell.length as u64;
            }
            hbin_addr += HBIN_SIZE as u64;
        }
        Ok(())
    }
}

impl RegfBackend {
    fn istat_nk(&mut self, out: &mut dyn StatSink, cell: &RegfCell, time_skew_seconds: i64) -> Result<()> {
        let d = ByteDecoder::new(&cell.body, Endian::Little);
        let signature_flags = d.u16(6).unwrap_or(0);
        let is_root = signature_flags & ROOT_RECORD_SIGNATURE != 0;
        let parent_offset = d.u32(20).unwrap_or(0);
        let class_offset = d.u32(52).unwrap_or(0xFFFF_FFFF);
        let class_length = d.u16(78).unwrap_or(0);
        let name_length = d.u16(76).unwrap_or(0) as usize;

        out.write_line(&format!("Root Record: {}", is_root))?;
        out.write_line(&format!("Parent Offset: {:#x}", parent_offset))?;

        if let Some(class_name) = self.class_name(class_offset, class_length)? {
            out.write_line(&format!("Class Name: {}", class_name))?;
        }

        let bound = name_length.min(KEY_NAME_MAX).min(cell.body.len().saturating_sub(80));
        if let Some(name_bytes) = cell.body.get(80..80 + bound) {
            let key_name = String::from_utf8_lossy(name_bytes);
            out.write_line(&format!("Key Name: {}", key_name))?;
        }

        let (secs, _) = d.u64(8).map(decode_filetime).unwrap_or((0, 0));
        if time_skew_seconds != 0 {
            out.write_line(&format!("Modified: {} (Adjusted from {})", secs + time_skew_seconds, secs))?;
        } else {
            out.write_line(&format!("Modified: {}", secs))?;
        }
        Ok(())
    }
}

/// Converts a Windows FILETIME (100-ns ticks since 1601-01-01) into
/// Unix seconds + nanoseconds.
fn decode_filetime(ticks: u64) -> (i64, u32) {
    let ticks = ticks as i64 - FILETIME_EPOCH_OFFSET_100NS;
    let secs = ticks.div_euclid(10_000_000);
    let frac_100ns = ticks.rem_euclid(10_000_000);
    (secs, (frac_100ns * 100) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::StreamImageReader;
    use std::io::Cursor;

    fn make_hive(last_hbin: u32, extra_pages: usize) -> Vec<u8> {
        let mut buf = vec![0u8; HBIN_SIZE as usize * (2 + extra_pages)];
        buf[0..4].copy_from_slice(b"regf");
        buf[4..8].copy_from_slice(&1u32.to_le_bytes());
        buf[8..12].copy_from_slice(&1u32.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[24..28].copy_from_slice(&5u32.to_le_bytes());
        buf[36..40].copy_from_slice(&0x20u32.to_le_bytes());
        buf[40..44].copy_from_slice(&last_hbin.to_le_bytes());
        buf
    }

    #[test]
    fn open_computes_inode_and_block_ranges() {
        let data = make_hive(HBIN_SIZE, 0);
        let reader = StreamImageReader::new(Cursor::new(data), 0);
        let backend = RegfBackend::open(Box::new(reader), 0).unwrap();
        assert_eq!(backend.info.first_inode, FIRST_HBIN_OFFSET);
        assert_eq!(backend.info.last_inode, HBIN_SIZE as u64 * 2);
        assert_eq!(backend.info.block_size, HBIN_SIZE);
    }

    #[test]
    fn decode_filetime_matches_known_epoch_delta() {
        // FILETIME for 1601-01-01 plus exactly the epoch offset is the Unix epoch.
        let (secs, nanos) = decode_filetime(FILETIME_EPOCH_OFFSET_100NS as u64);
        assert_eq!(secs, 0);
        assert_eq!(nanos, 0);
    }

    #[test]
    fn fsstat_reports_synchronized_and_hive_name() {
        let mut data = make_hive(HBIN_SIZE, 0);
        let name: Vec<u8> = "SYSTEM".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        data[48..48 + name.len()].copy_from_slice(&name);
        let reader = StreamImageReader::new(Cursor::new(data), 0);
        let mut backend = RegfBackend::open(Box::new(reader), 0).unwrap();
        let mut out = String::new();
        backend.fsstat(&mut out).unwrap();
        assert!(out.contains("Synchronized: true"));
        assert!(out.contains("SYSTEM"));
    }

    #[test]
    fn block_getflags_is_always_alloc_meta_content() {
        let data = make_hive(HBIN_SIZE, 0);
        let reader = StreamImageReader::new(Cursor::new(data), 0);
        let mut backend = RegfBackend::open(Box::new(reader), 0).unwrap();
        let flags = backend.block_getflags(0).unwrap();
        assert!(flags.contains(BlockFlags::ALLOC | BlockFlags::META | BlockFlags::CONTENT));
    }
}
