//! The uniform interface every back-end implements, and the façade
//! (`FsHandle`) an image consumer drives.
//!
//! Mirrors a common split between a format-specific parser
//! (`fs::FileSystem`) and the thin, format-agnostic operations built on top
//! of it (`Dir`, `File`): here the split runs the other way, a single
//! `FileSystem` trait is the format-agnostic surface, and `FatBackend` /
//! `RegfBackend` are the format-specific implementations behind it.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;

use crate::byte_decoder::Endian;
use crate::error::{Error, ErrorKind, Result};
use crate::image::ImageReader;

bitflags::bitflags! {
    /// Flags describing one block's allocation/content status.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct BlockFlags: u8 {
        const ALLOC      = 0b0000_0001;
        const UNALLOC    = 0b0000_0010;
        const META       = 0b0000_0100;
        const CONTENT    = 0b0000_1000;
        const RAW_BYTES  = 0b0001_0000;
    }
}

bitflags::bitflags! {
    /// Filter flags passed into `block_walk`; any combination of the
    /// ALLOC/UNALLOC pair and the META/CONTENT pair is legal. When a caller
    /// supplies neither member of a pair, the back-end fills in both.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct WalkFlags: u8 {
        const ALLOC   = 0b0000_0001;
        const UNALLOC = 0b0000_0010;
        const META    = 0b0000_0100;
        const CONTENT = 0b0000_1000;
    }
}

impl WalkFlags {
    /// Fills in both members of a pair when the caller specified neither,
    /// the normalisation every `block_walk` implementation performs first.
    pub fn normalized(self) -> Self {
        let mut f = self;
        if !f.intersects(WalkFlags::ALLOC | WalkFlags::UNALLOC) {
            f |= WalkFlags::ALLOC | WalkFlags::UNALLOC;
        }
        if !f.intersects(WalkFlags::META | WalkFlags::CONTENT) {
            f |= WalkFlags::META | WalkFlags::CONTENT;
        }
        f
    }

    pub fn admits(self, flags: BlockFlags) -> bool {
        let alloc_ok = (self.contains(WalkFlags::ALLOC) && flags.contains(BlockFlags::ALLOC))
            || (self.contains(WalkFlags::UNALLOC) && flags.contains(BlockFlags::UNALLOC));
        let kind_ok = (self.contains(WalkFlags::META) && flags.contains(BlockFlags::META))
            || (self.contains(WalkFlags::CONTENT) && flags.contains(BlockFlags::CONTENT));
        alloc_ok && kind_ok
    }
}

/// One block handed to a `block_walk` visitor.
pub struct BlockView<'a> {
    pub addr: u64,
    pub flags: BlockFlags,
    pub data: &'a [u8],
}

/// What a visitor wants the walk to do next.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Action {
    Continue,
    Stop,
    Error,
}

/// Callback contract for `block_walk`.
pub trait BlockVisitor {
    fn visit(&mut self, block: &BlockView<'_>) -> Action;
}

impl<F: FnMut(&BlockView<'_>) -> Action> BlockVisitor for F {
    fn visit(&mut self, block: &BlockView<'_>) -> Action {
        self(block)
    }
}

/// Semantic type of an inode's backing structure.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum InodeType {
    Regular,
    Directory,
    Virtual,
    Other,
}

/// A metadata view produced by `inode_open`.
#[derive(Clone, Debug)]
pub struct InodeMeta {
    pub inum: u64,
    pub itype: InodeType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub content: Vec<u8>,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
}

/// Opaque byte-oriented sink used by `fsstat`/`istat`, matching the "no
/// concrete stdout/file coupling" external interface called for in §6:
/// anything that can receive formatted text works, a `String` buffer in
/// tests or a process's stdout in a caller.
pub trait StatSink {
    fn write_line(&mut self, line: &str) -> Result<()>;
}

impl StatSink for String {
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.push_str(line);
        self.push('\n');
        Ok(())
    }
}

impl StatSink for Vec<u8> {
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.extend_from_slice(line.as_bytes());
        self.push(b'\n');
        Ok(())
    }
}

/// Declared on-disk format of an image, supplied by the caller at `open`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DeclaredType {
    Fat12,
    Fat16,
    Fat32,
    Reg,
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeclaredType::Fat12 => "FAT12",
            DeclaredType::Fat16 => "FAT16",
            DeclaredType::Fat32 => "FAT32",
            DeclaredType::Reg => "REG",
        };
        f.write_str(s)
    }
}

/// Fields common to every back-end, captured once at `open` time. Geometry
/// fields past this common set live on the concrete back-end; this struct
/// only holds what every format agrees on, mirroring `FsHandle`'s data
/// model in the design document.
#[derive(Clone, Debug)]
pub struct FsInfo {
    pub declared_type: DeclaredType,
    pub endian: Endian,
    pub image_offset: u64,
    pub block_size: u32,
    pub first_block: u64,
    pub last_block: u64,
    pub last_block_actual: u64,
    pub first_inode: u64,
    pub last_inode: u64,
    pub root_inode: u64,
}

impl FsInfo {
    pub fn check_invariants(&self) -> Result<()> {
        if !(self.first_block <= self.last_block_actual && self.last_block_actual <= self.last_block) {
            crate::error::bail!(
                ErrorKind::ArgumentInvalid,
                "FsInfo block range",
                format!(
                    "first={} actual={} last={}",
                    self.first_block, self.last_block_actual, self.last_block
                )
            );
        }
        if !(self.first_inode <= self.root_inode && self.root_inode <= self.last_inode) {
            crate::error::bail!(
                ErrorKind::ArgumentInvalid,
                "FsInfo inode range",
                format!(
                    "first={} root={} last={}",
                    self.first_inode, self.root_inode, self.last_inode
                )
            );
        }
        Ok(())
    }
}

/// The contract every back-end implements, consumed uniformly by upper
/// layers regardless of whether the handle underneath is FAT or Registry.
pub trait FileSystem {
    fn info(&self) -> &FsInfo;

    fn close(&mut self) -> Result<()>;

    fn block_walk(&mut self, start: u64, end: u64, flags: WalkFlags, visitor: &mut dyn BlockVisitor) -> Result<()>;

    fn block_getflags(&mut self, addr: u64) -> Result<BlockFlags>;

    fn inode_open(&mut self, inum: u64) -> Result<InodeMeta>;

    fn fsstat(&mut self, out: &mut dyn StatSink) -> Result<()>;

    fn istat(&mut self, out: &mut dyn StatSink, inum: u64, forced_block_count: u64, time_skew_seconds: i64) -> Result<()>;

    fn name_compare(&self, a: &str, b: &str) -> Ordering {
        a.to_lowercase().cmp(&b.to_lowercase())
    }

    fn jopen(&mut self, _inum: u64) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "jopen", String::new()))
    }

    fn jblk_walk(&mut self, _start: u64, _end: u64, _visitor: &mut dyn BlockVisitor) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "jblk_walk", String::new()))
    }

    fn jentry_walk(&mut self, _visitor: &mut dyn BlockVisitor) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "jentry_walk", String::new()))
    }
}

/// An opened file system. Owns the backend behind a trait object so callers
/// never downcast: every operation dispatches through the `FileSystem`
/// vtable, matching the design note against pointer-aliasing downcasts.
pub struct FsHandle {
    backend: RefCell<Box<dyn FileSystem>>,
    valid: RefCell<bool>,
}

impl FsHandle {
    pub fn new(backend: Box<dyn FileSystem>) -> Result<Self> {
        backend.info().check_invariants()?;
        Ok(FsHandle {
            backend: RefCell::new(backend),
            valid: RefCell::new(true),
        })
    }

    fn check_valid(&self, op: &str) -> Result<()> {
        if !*self.valid.borrow() {
            crate::error::bail!(ErrorKind::ArgumentInvalid, op, "handle closed");
        }
        Ok(())
    }

    pub fn info(&self) -> FsInfo {
        self.backend.borrow().info().clone()
    }

    pub fn close(&self) -> Result<()> {
        self.check_valid("close")?;
        self.backend.borrow_mut().close()?;
        *self.valid.borrow_mut() = false;
        Ok(())
    }

    pub fn block_walk(&self, start: u64, end: u64, flags: WalkFlags, visitor: &mut dyn BlockVisitor) -> Result<()> {
        self.check_valid("block_walk")?;
        let info = self.info();
        if start < info.first_block || end > info.last_block || start > end {
            crate::error::bail!(
                ErrorKind::WalkRange,
                "block_walk",
                format!("start={} end={} valid=[{},{}]", start, end, info.first_block, info.last_block)
            );
        }
        self.backend.borrow_mut().block_walk(start, end, flags.normalized(), visitor)
    }

    pub fn block_getflags(&self, addr: u64) -> Result<BlockFlags> {
        self.check_valid("block_getflags")?;
        self.backend.borrow_mut().block_getflags(addr)
    }

    pub fn inode_open(&self, inum: u64) -> Result<InodeMeta> {
        self.check_valid("inode_open")?;
        let info = self.info();
        if inum < info.first_inode || inum > info.last_inode {
            crate::error::bail!(
                ErrorKind::InodeNumber,
                "inode_open",
                format!("inum={} valid=[{},{}]", inum, info.first_inode, info.last_inode)
            );
        }
        self.backend.borrow_mut().inode_open(inum)
    }

    pub fn fsstat(&self, out: &mut dyn StatSink) -> Result<()> {
        self.check_valid("fsstat")?;
        self.backend.borrow_mut().fsstat(out)
    }

    pub fn istat(&self, out: &mut dyn StatSink, inum: u64, forced_block_count: u64, time_skew_seconds: i64) -> Result<()> {
        self.check_valid("istat")?;
        self.backend.borrow_mut().istat(out, inum, forced_block_count, time_skew_seconds)
    }

    pub fn name_compare(&self, a: &str, b: &str) -> Ordering {
        self.backend.borrow().name_compare(a, b)
    }

    pub fn jopen(&self, inum: u64) -> Result<()> {
        self.backend.borrow_mut().jopen(inum)
    }

    pub fn jblk_walk(&self, start: u64, end: u64, visitor: &mut dyn BlockVisitor) -> Result<()> {
        self.backend.borrow_mut().jblk_walk(start, end, visitor)
    }

    pub fn jentry_walk(&self, visitor: &mut dyn BlockVisitor) -> Result<()> {
        self.backend.borrow_mut().jentry_walk(visitor)
    }
}

/// Opens an image as the declared type, dispatching to the matching
/// back-end. This is `FsCore`'s dispatch-from-declared-type responsibility.
pub fn open(image: Box<dyn ImageReader>, offset: u64, declared_type: DeclaredType) -> Result<FsHandle> {
    let backend: Box<dyn FileSystem> = match declared_type {
        DeclaredType::Fat12 | DeclaredType::Fat16 | DeclaredType::Fat32 => {
            Box::new(crate::fat::backend::FatBackend::open(image, offset, declared_type)?)
        }
        DeclaredType::Reg => Box::new(crate::regf::backend::RegfBackend::open(image, offset)?),
    };
    FsHandle::new(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_flags_normalize_fills_missing_pair() {
        let f = WalkFlags::ALLOC.normalized();
        assert!(f.contains(WalkFlags::ALLOC));
        assert!(!f.contains(WalkFlags::UNALLOC));
        assert!(f.contains(WalkFlags::META));
        assert!(f.contains(WalkFlags::CONTENT));
    }

    #[test]
    fn walk_flags_admits_matches_both_pairs() {
        let f = WalkFlags::ALLOC | WalkFlags::CONTENT;
        assert!(f.admits(BlockFlags::ALLOC | BlockFlags::CONTENT));
        assert!(!f.admits(BlockFlags::UNALLOC | BlockFlags::CONTENT));
        assert!(!f.admits(BlockFlags::ALLOC | BlockFlags::META));
    }
}
