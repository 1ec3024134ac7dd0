//! Fixed-capacity LRU cache of FAT-sector windows.
//!
//! Constant-time LRU over a small number of slots using an integer "time to
//! live" counter per slot, per the design notes: no heap data structures, a
//! tagged-variant slot with an explicit promote/evict primitive. Grounded in
//! a small-buffer-by-hand style, but
//! built around a fixed promote/evict algorithm rather than a generic
//! read buffer.

use crate::error::{ErrorKind, Result};
use crate::image::ImageReader;

/// Number of cache slots. A fixed design constant, matching the "4-8 slots"
/// 4-8 slots is typical for this kind of window cache.
pub const CACHE_SLOTS: usize = 8;

/// Bytes held per slot. Must be at least twice the sector size so the
/// FAT12 straddling case can always rewind by one sector.
pub const FAT_CACHE_BYTES: usize = 4096;

#[derive(Clone)]
struct Slot {
    base_sector: u32,
    buffer: Vec<u8>,
    ttl: u32, // 0 = empty, 1 = most recent, N = least recent, N+1 = evictable
}

impl Slot {
    fn empty() -> Self {
        Slot {
            base_sector: 0,
            buffer: vec![0u8; FAT_CACHE_BYTES],
            ttl: 0,
        }
    }
}

pub struct FatCache {
    slots: [Slot; CACHE_SLOTS],
    sector_size: u32,
    pub hits: u64,
    pub misses: u64,
}

impl FatCache {
    pub fn new(sector_size: u32) -> Self {
        FatCache {
            slots: std::array::from_fn(|_| Slot::empty()),
            sector_size,
            hits: 0,
            misses: 0,
        }
    }

    fn promote(&mut self, hit_index: usize) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.ttl == 0 {
                continue;
            }
            if i == hit_index {
                slot.ttl = 1;
            } else {
                slot.ttl += 1;
            }
        }
    }

    fn find_hit(&self, sector: u32) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.ttl != 0
                && sector >= s.base_sector
                && (sector - s.base_sector) as u64 * self.sector_size as u64 + self.sector_size as u64
                    <= FAT_CACHE_BYTES as u64
        })
    }

    fn find_victim(&self) -> usize {
        self.slots
            .iter()
            .position(|s| s.ttl == 0)
            .unwrap_or_else(|| {
                self.slots
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, s)| s.ttl)
                    .map(|(i, _)| i)
                    .expect("cache has at least one slot")
            })
    }

    /// Returns the slot index whose buffer covers `sector`, loading the
    /// window starting at `sector` on a miss. On read failure the cache
    /// state is left untouched, matching §4.2's "do not mutate on failure".
    pub fn get_index(&mut self, image: &mut dyn ImageReader, base_offset: u64, sector: u32) -> Result<usize> {
        if let Some(idx) = self.find_hit(sector) {
            self.hits += 1;
            self.promote(idx);
            return Ok(idx);
        }
        self.load(image, base_offset, sector)
    }

    /// Unconditionally loads a fresh window with base `sector`, bypassing
    /// the hit check. Used for the FAT12 straddle correction (§4.3), which
    /// needs a window that starts exactly at `sector` rather than whatever
    /// earlier-based window happens to already cover it.
    pub fn force_load(&mut self, image: &mut dyn ImageReader, base_offset: u64, sector: u32) -> Result<usize> {
        self.load(image, base_offset, sector)
    }

    fn load(&mut self, image: &mut dyn ImageReader, base_offset: u64, sector: u32) -> Result<usize> {
        self.misses += 1;
        let victim = self.find_victim();
        let read_offset = base_offset + sector as u64 * self.sector_size as u64;
        let mut buffer = vec![0u8; FAT_CACHE_BYTES];
        image.read_at(read_offset, &mut buffer).map_err(|e| {
            crate::error::Error::new(ErrorKind::ReadError, "FAT cache fill", e.to_string())
        })?;

        let slot = &mut self.slots[victim];
        slot.base_sector = sector;
        slot.buffer = buffer;
        for (i, s) in self.slots.iter_mut().enumerate() {
            if i != victim && s.ttl != 0 {
                s.ttl += 1;
            }
        }
        self.slots[victim].ttl = 1;
        Ok(victim)
    }

    pub fn slot_base(&self, idx: usize) -> u32 {
        self.slots[idx].base_sector
    }

    pub fn slot_bytes(&self, idx: usize) -> &[u8] {
        &self.slots[idx].buffer
    }

    pub fn call_count(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn occupied_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.ttl != 0).count()
    }

    pub fn most_recent_ttl_is_one(&self) -> bool {
        self.slots.iter().any(|s| s.ttl == 1) || self.occupied_slots() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::StreamImageReader;
    use std::io::Cursor;

    fn reader(len: usize) -> StreamImageReader<Cursor<Vec<u8>>> {
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        StreamImageReader::new(Cursor::new(data), 0)
    }

    #[test]
    fn p6_call_count_equals_hits_plus_misses_and_capacity_bounded() {
        let mut r = reader(CACHE_SLOTS * FAT_CACHE_BYTES * 4);
        let mut cache = FatCache::new(512);
        for i in 0..64u32 {
            let sector = (i % (CACHE_SLOTS as u32 * 8)) * 8;
            cache.get_index(&mut r, 0, sector).unwrap();
        }
        assert_eq!(cache.call_count(), cache.hits + cache.misses);
        assert_eq!(cache.call_count(), 64);
        assert!(cache.occupied_slots() <= CACHE_SLOTS);
        assert!(cache.most_recent_ttl_is_one());
    }

    #[test]
    fn repeated_access_is_a_hit() {
        let mut r = reader(FAT_CACHE_BYTES * 4);
        let mut cache = FatCache::new(512);
        cache.get_index(&mut r, 0, 0).unwrap();
        let misses_before = cache.misses;
        cache.get_index(&mut r, 0, 1).unwrap();
        assert_eq!(cache.misses, misses_before);
        assert_eq!(cache.hits, 1);
    }

    #[test]
    fn eviction_happens_past_capacity() {
        let mut r = reader(CACHE_SLOTS * FAT_CACHE_BYTES * 2);
        let mut cache = FatCache::new(512);
        // Each access is far enough apart to guarantee a miss.
        let stride = (FAT_CACHE_BYTES / 512) as u32;
        for i in 0..(CACHE_SLOTS as u32 + 2) {
            cache.get_index(&mut r, 0, i * stride).unwrap();
        }
        assert_eq!(cache.misses, CACHE_SLOTS as u64 + 2);
        assert!(cache.occupied_slots() <= CACHE_SLOTS);
    }
}
