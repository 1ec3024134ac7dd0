#![crate_type = "lib"]
#![crate_name = "forensic_fs_core"]

//! Read-only, structure-aware access to XTAF FAT images and Windows
//! Registry hives through one uniform block/inode interface.
//!
//! An `ImageReader` supplies raw bytes; [`core::open`] inspects the
//! caller-declared type and hands back an [`core::FsHandle`] whose
//! `block_walk`/`inode_open`/`fsstat`/`istat` operations behave the same
//! regardless of which back-end sits underneath.

pub mod byte_decoder;
pub mod core;
pub mod error;
pub mod fat;
pub mod image;
pub mod regf;

pub use crate::core::{
    open, Action, BlockFlags, BlockView, BlockVisitor, DeclaredType, FileSystem, FsHandle, FsInfo, InodeMeta,
    InodeType, StatSink, WalkFlags,
};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::image::{ImageReader, StreamImageReader};
