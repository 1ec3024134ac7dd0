//! FAT back-end: the uniform `FileSystem` interface, built on the standard
//! FAT directory-entry bit layout and attribute flags, adapted onto this
//! crate's block/inode model instead of directory iteration.

use std::cmp::Ordering;

use crate::byte_decoder::{ByteDecoder, Endian};
use crate::core::{
    BlockFlags, BlockVisitor, DeclaredType, FileSystem, FsInfo, InodeMeta, InodeType, StatSink, WalkFlags,
};
use crate::error::{Error, ErrorKind, Result};
use crate::fat::cache::FatCache;
use crate::fat::chain::{get_fat, FatValue};
use crate::fat::geometry::FatGeometry;
use crate::image::ImageReader;

bitflags::bitflags! {
    /// FAT directory-entry attribute bits.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct FileAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
        const LFN = Self::READ_ONLY.bits() | Self::HIDDEN.bits() | Self::SYSTEM.bits() | Self::VOLUME_ID.bits();
    }
}

const DIR_ENTRY_SIZE: u32 = 32;
const DIR_ENTRY_FREE: u8 = 0x00;
const DIR_ENTRY_DELETED: u8 = 0xE5;

/// Small reserved range of special inodes below the first real
/// directory-entry-backed inode. Exact membership past "root is 2" is an
/// range and only give inode 2 concrete semantics.
const RESERVED_INODE_COUNT: u64 = 11;
const ROOT_INODE: u64 = 2;

#[derive(Clone, Copy, Debug)]
struct RawDirEntry {
    name: [u8; 11],
    attr: u8,
    wrt_time: u16,
    wrt_date: u16,
    first_cluster: u32,
    file_size: u32,
}

impl RawDirEntry {
    fn parse(buf: &[u8]) -> Option<Self> {
        let d = ByteDecoder::new(buf, Endian::Little);
        let mut name = [0u8; 11];
        name.copy_from_slice(d.bytes(0, 11)?);
        let attr = d.u8(11)?;
        let wrt_time = d.u16(22)?;
        let wrt_date = d.u16(24)?;
        let clus_lo = d.u16(26)? as u32;
        let clus_hi = d.u16(20)? as u32;
        let file_size = d.u32(28)?;
        Some(RawDirEntry {
            name,
            attr,
            wrt_time,
            wrt_date,
            first_cluster: clus_lo | (clus_hi << 16),
            file_size,
        })
    }

    fn is_free(&self) -> bool {
        self.name[0] == DIR_ENTRY_FREE
    }

    fn is_deleted(&self) -> bool {
        self.name[0] == DIR_ENTRY_DELETED
    }

    fn attributes(&self) -> FileAttributes {
        FileAttributes::from_bits_truncate(self.attr)
    }

    fn short_name(&self) -> String {
        let base = String::from_utf8_lossy(&self.name[0..8]).trim_end().to_string();
        let ext = String::from_utf8_lossy(&self.name[8..11]).trim_end().to_string();
        if ext.is_empty() {
            base
        } else {
            format!("{}.{}", base, ext)
        }
    }
}

pub struct FatBackend {
    image: Box<dyn ImageReader>,
    base_offset: u64,
    info: FsInfo,
    geom: FatGeometry,
    cache: FatCache,
}

impl FatBackend {
    pub fn open(mut image: Box<dyn ImageReader>, base_offset: u64, declared_type: DeclaredType) -> Result<Self> {
        log::debug!("opening FAT backend at offset {}", base_offset);
        let image_size = image.len()?.saturating_sub(base_offset);
        let geom = FatGeometry::open(image.as_mut(), base_offset, declared_type, image_size)?;

        let total_sectors = image_size / geom.sector_size as u64;
        let last_block = if total_sectors == 0 { 0 } else { total_sectors - 1 };
        let last_block_actual = last_block.min(total_sectors.saturating_sub(1));

        let dentry_count = if last_block_actual >= geom.first_data_sector as u64 {
            (last_block_actual - geom.first_data_sector as u64 + 1) * geom.dentry_per_sector() as u64
        } else {
            0
        };
        let last_inode = RESERVED_INODE_COUNT - 1 + dentry_count.max(1) - 1;

        let info = FsInfo {
            declared_type,
            endian: Endian::Big,
            image_offset: base_offset,
            block_size: geom.sector_size,
            first_block: 0,
            last_block,
            last_block_actual,
            first_inode: 0,
            last_inode,
            root_inode: ROOT_INODE,
        };

        let cache = FatCache::new(geom.sector_size);
        Ok(FatBackend {
            image,
            base_offset,
            info,
            geom,
            cache,
        })
    }

    fn read_sector(&mut self, sector: u32, out: &mut [u8]) -> Result<()> {
        let offset = self.base_offset + sector as u64 * self.geom.sector_size as u64;
        self.image.read_at(offset, out)
    }

    fn is_sector_allocated(&mut self, sector: u32) -> Result<bool> {
        if sector < self.geom.first_cluster_sector {
            return Ok(true); // reserved + FATs + fixed root dir
        }
        if sector as u64 > self.info.last_block_actual {
            return Ok(false); // trailing non-clustered tail
        }
        let cluster = self.geom.sector_to_cluster(sector);
        crate::fat::chain::is_cluster_allocated(
            self.image.as_mut(),
            self.base_offset,
            &self.geom,
            &mut self.cache,
            0,
            cluster,
        )
    }

    fn dentry_sector_and_slot(&self, inum: u64) -> Option<(u32, u32)> {
        if inum < RESERVED_INODE_COUNT {
            return None;
        }
        let slot_index = inum - RESERVED_INODE_COUNT;
        let per_sector = self.geom.dentry_per_sector() as u64;
        let sector = self.geom.first_data_sector as u64 + slot_index / per_sector;
        let slot_in_sector = (slot_index % per_sector) as u32;
        Some((sector as u32, slot_in_sector))
    }

    fn read_dentry(&mut self, sector: u32, slot: u32) -> Result<RawDirEntry> {
        let mut buf = vec![0u8; self.geom.sector_size as usize];
        self.read_sector(sector, &mut buf)?;
        let start = (slot * DIR_ENTRY_SIZE) as usize;
        RawDirEntry::parse(&buf[start..start + DIR_ENTRY_SIZE as usize]).ok_or_else(|| {
            Error::new(ErrorKind::InodeCorrupt, "dentry parse", format!("sector={} slot={}", sector, slot))
        })
    }

    fn volume_label(&mut self) -> Result<Option<String>> {
        let mut buf = vec![0u8; self.geom.sector_size as usize];
        self.read_sector(self.geom.root_sector, &mut buf)?;
        let per_sector = self.geom.dentry_per_sector();
        for i in 0..per_sector {
            let start = (i * DIR_ENTRY_SIZE) as usize;
            if let Some(entry) = RawDirEntry::parse(&buf[start..start + DIR_ENTRY_SIZE as usize]) {
                if entry.is_free() {
                    break;
                }
                if entry.attributes().contains(FileAttributes::VOLUME_ID) && !entry.attributes().contains(FileAttributes::LFN) {
                    return Ok(Some(entry.short_name()));
                }
            }
        }
        Ok(None)
    }

    /// Root directory sector range. For FAT12/16 the root is the fixed
    /// range before the cluster heap; for FAT32 `root_sector` names the
    /// root's first cluster and the full extent is found by chasing the
    /// FAT chain with cycle detection.
    fn root_range(&mut self) -> Result<(u32, u32)> {
        if self.info.declared_type != DeclaredType::Fat32 {
            return Ok((self.geom.root_sector, self.geom.first_cluster_sector.saturating_sub(1)));
        }
        let mut visited = std::collections::HashSet::new();
        let mut cluster = self.geom.sector_to_cluster(self.geom.root_sector);
        let mut last_sector = self.geom.root_sector;
        loop {
            if !visited.insert(cluster) {
                log::warn!("FAT32 root chain cycle detected at cluster {}", cluster);
                break;
            }
            let start = self.geom.cluster_to_sector(cluster);
            last_sector = start + self.geom.cluster_size_in_sectors - 1;
            match get_fat(self.image.as_mut(), self.base_offset, &self.geom, &mut self.cache, 0, cluster)? {
                FatValue::Allocated(next) => cluster = next,
                _ => break,
            }
        }
        Ok((self.geom.root_sector, last_sector))
    }
}

impl FileSystem for FatBackend {
    fn info(&self) -> &FsInfo {
        &self.info
    }

    fn close(&mut self) -> Result<()> {
        log::debug!("closing FAT backend");
        Ok(())
    }

    fn block_getflags(&mut self, addr: u64) -> Result<BlockFlags> {
        let addr = addr as u32;
        if (addr as u64) < self.geom.first_data_sector as u64 {
            return Ok(BlockFlags::META | BlockFlags::ALLOC);
        }
        if addr < self.geom.first_cluster_sector {
            return Ok(BlockFlags::CONTENT | BlockFlags::ALLOC);
        }
        let allocated = self.is_sector_allocated(addr)?;
        Ok(BlockFlags::CONTENT | if allocated { BlockFlags::ALLOC } else { BlockFlags::UNALLOC })
    }

    fn block_walk(&mut self, start: u64, end: u64, flags: WalkFlags, visitor: &mut dyn BlockVisitor) -> Result<()> {
        let mut addr = start as u32;
        let end = end as u32;
        let sector_size = self.geom.sector_size as usize;

        // Phase A: pre-data area, aggregated in chunks of up to 8 sectors.
        while addr < self.geom.first_cluster_sector && addr <= end {
            let chunk_end = (addr + 8).min(self.geom.first_cluster_sector).min(end + 1);
            let mut buf = vec![0u8; sector_size * (chunk_end - addr) as usize];
            self.read_sector(addr, &mut buf)?;
            for s in addr..chunk_end {
                let block_flags = if (s as u64) < self.geom.first_data_sector as u64 {
                    BlockFlags::META | BlockFlags::ALLOC
                } else {
                    BlockFlags::CONTENT | BlockFlags::ALLOC
                };
                if flags.admits(block_flags) {
                    let off = (s - addr) as usize * sector_size;
                    let view = crate::core::BlockView {
                        addr: s as u64,
                        flags: block_flags,
                        data: &buf[off..off + sector_size],
                    };
                    match visitor.visit(&view) {
                        crate::core::Action::Continue => {}
                        crate::core::Action::Stop => return Ok(()),
                        crate::core::Action::Error => {
                            return Err(Error::new(ErrorKind::WalkRange, "block_walk", "visitor error"));
                        }
                    }
                }
            }
            addr = chunk_end;
        }

        // Phase B: data area, iterated cluster by cluster.
        let cluster_bytes = self.geom.cluster_size_in_sectors;
        while addr <= end && addr >= self.geom.first_cluster_sector {
            let cluster_base = self.geom.first_cluster_sector
                + ((addr - self.geom.first_cluster_sector) / cluster_bytes) * cluster_bytes;
            let allocated = self.is_sector_allocated(cluster_base)?;
            let cluster_flag = if allocated { BlockFlags::ALLOC } else { BlockFlags::UNALLOC };
            let block_flags = BlockFlags::CONTENT | cluster_flag;
            let chunk_last = (cluster_base + cluster_bytes - 1).min(end);
            let from = addr.max(cluster_base);
            if flags.admits(block_flags) {
                let mut buf = vec![0u8; sector_size * (chunk_last - from + 1) as usize];
                self.read_sector(from, &mut buf)?;
                for s in from..=chunk_last {
                    let off = (s - from) as usize * sector_size;
                    let view = crate::core::BlockView {
                        addr: s as u64,
                        flags: block_flags,
                        data: &buf[off..off + sector_size],
                    };
                    match visitor.visit(&view) {
                        crate::core::Action::Continue => {}
                        crate::core::Action::Stop => return Ok(()),
                        crate::core::Action::Error => {
                            return Err(Error::new(ErrorKind::WalkRange, "block_walk", "visitor error"));
                        }
                    }
                }
            }
            addr = chunk_last + 1;
        }
        Ok(())
    }

    fn inode_open(&mut self, inum: u64) -> Result<InodeMeta> {
        if inum == ROOT_INODE {
            let (start, end) = self.root_range()?;
            let mut content = Vec::new();
            for sector in start..=end {
                let mut buf = vec![0u8; self.geom.sector_size as usize];
                self.read_sector(sector, &mut buf)?;
                content.extend_from_slice(&buf);
            }
            return Ok(InodeMeta {
                inum,
                itype: InodeType::Directory,
                mode: 0o755,
                nlink: 1,
                uid: 0,
                gid: 0,
                size: content.len() as u64,
                content,
                mtime_secs: 0,
                mtime_nanos: 0,
            });
        }
        if inum < RESERVED_INODE_COUNT {
            return Ok(InodeMeta {
                inum,
                itype: InodeType::Virtual,
                mode: 0,
                nlink: 1,
                uid: 0,
                gid: 0,
                size: 0,
                content: Vec::new(),
                mtime_secs: 0,
                mtime_nanos: 0,
            });
        }
        let (sector, slot) = self
            .dentry_sector_and_slot(inum)
            .ok_or_else(|| Error::new(ErrorKind::InodeNumber, "inode_open", format!("inum={}", inum)))?;
        let entry = self.read_dentry(sector, slot)?;
        let attrs = entry.attributes();
        let itype = if entry.is_free() || entry.is_deleted() {
            InodeType::Other
        } else if attrs.contains(FileAttributes::LFN) {
            InodeType::Virtual
        } else if attrs.contains(FileAttributes::DIRECTORY) {
            InodeType::Directory
        } else {
            InodeType::Regular
        };
        let (secs, nanos) = decode_fat_timestamp(entry.wrt_date, entry.wrt_time);
        Ok(InodeMeta {
            inum,
            itype,
            mode: if attrs.contains(FileAttributes::READ_ONLY) { 0o444 } else { 0o644 },
            nlink: 1,
            uid: 0,
            gid: 0,
            size: entry.file_size as u64,
            content: Vec::new(),
            mtime_secs: secs,
            mtime_nanos: nanos,
        })
    }

    fn fsstat(&mut self, out: &mut dyn StatSink) -> Result<()> {
        out.write_line(&format!("File System Type: {}", self.info.declared_type))?;
        out.write_line(&format!(
            "Serial Number: {:02X}{:02X}{:02X}{:02X}",
            self.geom.serial_number[0], self.geom.serial_number[1], self.geom.serial_number[2], self.geom.serial_number[3]
        ))?;
        if let Some(label) = self.volume_label()? {
            out.write_line(&format!("Volume Label: {}", label))?;
        }
        out.write_line(&format!("Sector Size: {}", self.geom.sector_size))?;
        out.write_line(&format!("Cluster Size: {} sectors", self.geom.cluster_size_in_sectors))?;
        out.write_line(&format!("Total Range: {} - {}", self.info.first_block, self.info.last_block_actual))?;
        for i in 0..self.geom.num_fats {
            out.write_line(&format!(
                "* FAT {}: {} - {}",
                i,
                self.geom.fat_start_sector(i),
                self.geom.fat_end_sector(i)
            ))?;
        }
        let (root_start, root_end) = self.root_range()?;
        out.write_line(&format!("Root Directory Range: {} - {}", root_start, root_end))?;
        out.write_line(&format!(
            "Data Area: {} - {}",
            self.geom.first_cluster_sector, self.info.last_block_actual
        ))?;

        let mut bad_clusters = Vec::new();
        for c in 2..=self.geom.last_cluster_number.min(self.geom.cluster_count + 1) {
            if let Ok(FatValue::Bad) =
                get_fat(self.image.as_mut(), self.base_offset, &self.geom, &mut self.cache, 0, c)
            {
                bad_clusters.push(c);
            }
        }
        if !bad_clusters.is_empty() {
            let list = bad_clusters.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", ");
            out.write_line(&format!("Bad Sectors: {} clusters ({})", bad_clusters.len(), list))?;
        }

        out.write_line("FAT Contents (cluster ranges):")?;
        let mut c = 2u32;
        while c <= self.geom.last_cluster_number {
            let start = c;
            let mut end = c;
            loop {
                match get_fat(self.image.as_mut(), self.base_offset, &self.geom, &mut self.cache, 0, end)? {
                    FatValue::Allocated(next) if next == end + 1 && next <= self.geom.last_cluster_number => {
                        end = next;
                    }
                    _ => break,
                }
            }
            let dest = get_fat(self.image.as_mut(), self.base_offset, &self.geom, &mut self.cache, 0, end)?;
            let dest_str = match dest {
                FatValue::Free => "Free".to_string(),
                FatValue::Eof => "EOF".to_string(),
                FatValue::Bad => "BAD".to_string(),
                FatValue::Allocated(next) => next.to_string(),
            };
            if start == end {
                out.write_line(&format!("{} -> {}", start, dest_str))?;
            } else {
                out.write_line(&format!("{}-{} -> {}", start, end, dest_str))?;
            }
            c = end + 1;
        }
        Ok(())
    }

    fn istat(&mut self, out: &mut dyn StatSink, inum: u64, forced_block_count: u64, time_skew_seconds: i64) -> Result<()> {
        out.write_line(&format!("Inode: {}", inum))?;
        let meta = self.inode_open(inum)?;
        let type_str = match meta.itype {
            InodeType::Directory => "Directory",
            InodeType::Regular => "File",
            InodeType::Virtual => "Virtual",
            InodeType::Other => "Other",
        };
        out.write_line(&format!("Type: {}", type_str))?;
        if let Some((sector, slot)) = self.dentry_sector_and_slot(inum) {
            let entry = self.read_dentry(sector, slot)?;
            let attrs = entry.attributes();
            let mut attr_names = Vec::new();
            if attrs.contains(FileAttributes::DIRECTORY) {
                attr_names.push("Directory");
            }
            if attrs.contains(FileAttributes::VOLUME_ID) {
                attr_names.push("Volume Label");
            }
            if attrs.contains(FileAttributes::READ_ONLY) {
                attr_names.push("Read Only");
            }
            if attrs.contains(FileAttributes::HIDDEN) {
                attr_names.push("Hidden");
            }
            if attrs.contains(FileAttributes::SYSTEM) {
                attr_names.push("System");
            }
            if attrs.contains(FileAttributes::ARCHIVE) {
                attr_names.push("Archive");
            }
            if attrs.contains(FileAttributes::LFN) {
                attr_names.push("Long File Name");
            }
            out.write_line(&format!("Attributes: {}", attr_names.join(", ")))?;

            if time_skew_seconds != 0 {
                let adjusted = meta.mtime_secs + time_skew_seconds;
                out.write_line(&format!("Written: {} (Adjusted from {})", adjusted, meta.mtime_secs))?;
            } else {
                out.write_line(&format!("Written: {}", meta.mtime_secs))?;
            }

            let size = if forced_block_count != 0 {
                forced_block_count * self.geom.sector_size as u64
            } else {
                meta.size
            };
            out.write_line(&format!("Size: {}", size))?;

            if !attrs.contains(FileAttributes::LFN) && !attrs.contains(FileAttributes::DIRECTORY) {
                let blocks = if forced_block_count != 0 {
                    forced_block_count
                } else {
                    (entry.file_size as u64).div_ceil(self.geom.sector_size as u64).max(1)
                };
                self.list_file_blocks(out, entry.first_cluster, blocks)?;
            }
        }
        Ok(())
    }

    fn name_compare(&self, a: &str, b: &str) -> Ordering {
        a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
    }
}

impl FatBackend {
    fn list_file_blocks(&mut self, out: &mut dyn StatSink, first_cluster: u32, block_count: u64) -> Result<()> {
        if first_cluster < 2 {
            return Ok(());
        }
        let mut sectors = Vec::new();
        let mut cluster = first_cluster;
        let mut visited = std::collections::HashSet::new();
        'outer: loop {
            if !visited.insert(cluster) {
                log::warn!("cycle detected while listing blocks for cluster {}", cluster);
                break;
            }
            let base = self.geom.cluster_to_sector(cluster);
            for s in base..base + self.geom.cluster_size_in_sectors {
                sectors.push(s);
                if sectors.len() as u64 >= block_count {
                    break 'outer;
                }
            }
            match get_fat(self.image.as_mut(), self.base_offset, &self.geom, &mut self.cache, 0, cluster)? {
                FatValue::Allocated(next) => cluster = next,
                _ => break,
            }
        }
        for chunk in sectors.chunks(8) {
            let line = chunk.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(" ");
            out.write_line(&line)?;
        }
        Ok(())
    }
}

/// Decodes a DOS date/time pair into seconds + nanoseconds since the Unix
/// epoch, the common currency `InodeMeta` uses across back-ends.
fn decode_fat_timestamp(dos_date: u16, dos_time: u16) -> (i64, u32) {
    let year = 1980 + (dos_date >> 9) as i32;
    let month = ((dos_date >> 5) & 0xF) as u32;
    let day = (dos_date & 0x1F) as u32;
    let hour = (dos_time >> 11) as u32;
    let min = ((dos_time >> 5) & 0x3F) as u32;
    let sec = ((dos_time & 0x1F) * 2) as u32;

    #[cfg(feature = "chrono")]
    {
        use chrono::{NaiveDate, NaiveDateTime};
        if let Some(date) = NaiveDate::from_ymd_opt(year, month.max(1), day.max(1)) {
            if let Some(dt) = date.and_hms_opt(hour, min, sec) {
                let dt: NaiveDateTime = dt;
                return (dt.and_utc().timestamp(), 0);
            }
        }
        (0, 0)
    }
    #[cfg(not(feature = "chrono"))]
    {
        let _ = (year, month, day, hour, min, sec);
        (0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dentry_parses_name_and_cluster() {
        let mut buf = [0u8; 32];
        buf[0..11].copy_from_slice(b"HELLO   TXT");
        buf[11] = FileAttributes::ARCHIVE.bits();
        buf[26..28].copy_from_slice(&5u16.to_le_bytes());
        buf[20..22].copy_from_slice(&0u16.to_le_bytes());
        buf[28..32].copy_from_slice(&1234u32.to_le_bytes());
        let entry = RawDirEntry::parse(&buf).unwrap();
        assert_eq!(entry.short_name(), "HELLO.TXT");
        assert_eq!(entry.first_cluster, 5);
        assert_eq!(entry.file_size, 1234);
    }

    #[test]
    fn free_and_deleted_slots_detected() {
        let mut buf = [0u8; 32];
        buf[0] = DIR_ENTRY_FREE;
        assert!(RawDirEntry::parse(&buf).unwrap().is_free());
        buf[0] = DIR_ENTRY_DELETED;
        assert!(RawDirEntry::parse(&buf).unwrap().is_deleted());
    }

    #[test]
    fn decode_fat_timestamp_epoch_1980() {
        let (secs, _) = decode_fat_timestamp(0, 0);
        assert!(secs > 0); // 1980-01-01 is after the Unix epoch
    }
}
