//! End-to-end scenarios built against synthetic in-memory images, since no
//! bit-exact XTAF/REGF sample images ship with this crate. Each test
//! constructs just enough of an image to exercise one real
//! `open`/`block_walk`/`istat` path through [`forensic_fs_core`].

use std::io::Cursor;

use forensic_fs_core::core::{Action, BlockFlags, WalkFlags};
use forensic_fs_core::{open, DeclaredType, StreamImageReader};

const SECTOR: usize = 512;

/// Builds a FAT16 image matching the S1 known-geometry table entry: a
/// 256 MiB image at partition offset 0x120eb0000, one FAT, 32-sector
/// clusters, 16384 clusters.
fn s1_fat16_image() -> (Vec<u8>, u64) {
    const OFFSET: u64 = 0x120eb0000;
    const IMAGE_SIZE: usize = 268_435_456;
    let mut data = vec![0u8; IMAGE_SIZE];

    data[0..4].copy_from_slice(b"XTAF");
    data[4..8].copy_from_slice(&32u32.to_be_bytes()); // cluster_size_in_sectors
    data[8..12].copy_from_slice(&1u32.to_be_bytes()); // num_fats
    data[12..16].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);

    (data, OFFSET)
}

fn prefixed_image(body: Vec<u8>, offset: u64) -> Vec<u8> {
    let mut full = vec![0u8; offset as usize];
    full.extend_from_slice(&body);
    full
}

#[test]
fn s1_open_fat16_and_read_fsstat() {
    let (body, offset) = s1_fat16_image();
    let full = prefixed_image(body, offset);
    let reader = StreamImageReader::new(Cursor::new(full), 0);
    let handle = open(Box::new(reader), offset, DeclaredType::Fat16).unwrap();

    let info = handle.info();
    assert_eq!(info.root_inode, 2);
    assert_eq!(info.block_size, SECTOR as u32);

    let mut out = String::new();
    handle.fsstat(&mut out).unwrap();
    assert!(out.contains("FAT16"));
    assert!(out.contains("FAT 0: 8 - 71"));
}

#[test]
fn p1_block_getflags_reports_exactly_one_of_alloc_unalloc() {
    let (body, offset) = s1_fat16_image();
    let full = prefixed_image(body, offset);
    let reader = StreamImageReader::new(Cursor::new(full), 0);
    let handle = open(Box::new(reader), offset, DeclaredType::Fat16).unwrap();

    for addr in [0u64, 8, 79, 112] {
        let flags = handle.block_getflags(addr).unwrap();
        let alloc = flags.contains(BlockFlags::ALLOC);
        let unalloc = flags.contains(BlockFlags::UNALLOC);
        assert_ne!(alloc, unalloc, "block {} must be exactly one of alloc/unalloc", addr);
    }
}

#[test]
fn block_walk_visits_every_block_in_ascending_order_then_can_be_stopped() {
    let (body, offset) = s1_fat16_image();
    let full = prefixed_image(body, offset);
    let reader = StreamImageReader::new(Cursor::new(full), 0);
    let handle = open(Box::new(reader), offset, DeclaredType::Fat16).unwrap();

    let mut seen = Vec::new();
    handle
        .block_walk(0, 20, WalkFlags::empty(), &mut |view: &forensic_fs_core::BlockView| {
            seen.push(view.addr);
            Action::Continue
        })
        .unwrap();
    assert_eq!(seen, (0..=20).collect::<Vec<_>>());

    let mut stop_count = 0u32;
    handle
        .block_walk(0, 20, WalkFlags::empty(), &mut |_: &forensic_fs_core::BlockView| {
            stop_count += 1;
            if stop_count == 3 {
                Action::Stop
            } else {
                Action::Continue
            }
        })
        .unwrap();
    assert_eq!(stop_count, 3);
}

#[test]
fn block_walk_rejects_out_of_range_start() {
    let (body, offset) = s1_fat16_image();
    let full = prefixed_image(body, offset);
    let reader = StreamImageReader::new(Cursor::new(full), 0);
    let handle = open(Box::new(reader), offset, DeclaredType::Fat16).unwrap();

    let info = handle.info();
    let err = handle
        .block_walk(info.last_block + 1, info.last_block + 5, WalkFlags::empty(), &mut |_: &forensic_fs_core::BlockView| {
            Action::Continue
        })
        .unwrap_err();
    assert_eq!(err.kind(), forensic_fs_core::ErrorKind::WalkRange);
}

#[test]
fn inode_open_out_of_range_is_inode_number_error() {
    let (body, offset) = s1_fat16_image();
    let full = prefixed_image(body, offset);
    let reader = StreamImageReader::new(Cursor::new(full), 0);
    let handle = open(Box::new(reader), offset, DeclaredType::Fat16).unwrap();

    let info = handle.info();
    let err = handle.inode_open(info.last_inode + 1).unwrap_err();
    assert_eq!(err.kind(), forensic_fs_core::ErrorKind::InodeNumber);
}

fn regf_hive() -> Vec<u8> {
    let mut data = vec![0u8; 4096 * 3];
    data[0..4].copy_from_slice(b"regf");
    data[4..8].copy_from_slice(&3u32.to_le_bytes()); // seq1
    data[8..12].copy_from_slice(&3u32.to_le_bytes()); // seq2
    data[20..24].copy_from_slice(&1u32.to_le_bytes()); // major
    data[24..28].copy_from_slice(&5u32.to_le_bytes()); // minor
    data[36..40].copy_from_slice(&0x20u32.to_le_bytes()); // first_key_offset
    data[40..44].copy_from_slice(&(4096u32 * 2).to_le_bytes()); // last_hbin_offset
    let name: Vec<u8> = "SOFTWARE".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    data[48..48 + name.len()].copy_from_slice(&name);

    // Root NK cell at hbin 1, offset 0x20 within the page (absolute 0x1020).
    let nk_base = 4096 + 0x20;
    let cell_len = 0x60u32;
    data[nk_base..nk_base + 4].copy_from_slice(&(-(cell_len as i32)).to_le_bytes());
    data[nk_base + 4..nk_base + 6].copy_from_slice(&0x6b6eu16.to_le_bytes()); // "nk"
    data[nk_base + 6..nk_base + 8].copy_from_slice(&0x2Cu16.to_le_bytes()); // root record flag
    data[nk_base + 52..nk_base + 56].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // no class name
    data[nk_base + 76..nk_base + 78].copy_from_slice(&3u16.to_le_bytes()); // name length
    data[nk_base + 80..nk_base + 83].copy_from_slice(b"key");

    data
}

#[test]
fn s4_regf_open_and_root_nk_istat() {
    let data = regf_hive();
    let reader = StreamImageReader::new(Cursor::new(data), 0);
    let handle = open(Box::new(reader), 0, DeclaredType::Reg).unwrap();

    let info = handle.info();
    assert_eq!(info.block_size, 4096);
    assert_eq!(info.first_inode, 4096);

    let mut out = String::new();
    handle.istat(&mut out, info.root_inode, 0, 0).unwrap();
    assert!(out.contains("Type: NK"));
    assert!(out.contains("Root Record: true"));
    assert!(out.contains("Key Name: key"));
}

#[test]
fn s5_regf_cell_allocation_bit_and_length() {
    let data = regf_hive();
    let reader = StreamImageReader::new(Cursor::new(data), 0);
    let handle = open(Box::new(reader), 0, DeclaredType::Reg).unwrap();

    let info = handle.info();
    let meta = handle.inode_open(info.root_inode).unwrap();
    assert_eq!(meta.size, 0x60);
}

#[test]
fn regf_block_walk_every_hbin_is_alloc_meta_content() {
    let data = regf_hive();
    let reader = StreamImageReader::new(Cursor::new(data), 0);
    let handle = open(Box::new(reader), 0, DeclaredType::Reg).unwrap();

    let mut count = 0u32;
    handle
        .block_walk(0, 4096 * 2, WalkFlags::empty(), &mut |view: &forensic_fs_core::BlockView| {
            assert!(view.flags.contains(BlockFlags::ALLOC | BlockFlags::META | BlockFlags::CONTENT));
            count += 1;
            Action::Continue
        })
        .unwrap();
    assert_eq!(count, 3);
}

#[test]
fn name_compare_is_case_insensitive_for_fat_and_regf() {
    let (body, offset) = s1_fat16_image();
    let full = prefixed_image(body, offset);
    let reader = StreamImageReader::new(Cursor::new(full), 0);
    let fat_handle = open(Box::new(reader), offset, DeclaredType::Fat16).unwrap();
    assert_eq!(fat_handle.name_compare("ABC", "abc"), std::cmp::Ordering::Equal);

    let data = regf_hive();
    let reg_reader = StreamImageReader::new(Cursor::new(data), 0);
    let reg_handle = open(Box::new(reg_reader), 0, DeclaredType::Reg).unwrap();
    assert_eq!(reg_handle.name_compare("ABC", "abc"), std::cmp::Ordering::Equal);
}

#[test]
fn journal_operations_are_reported_unsupported() {
    let data = regf_hive();
    let reader = StreamImageReader::new(Cursor::new(data), 0);
    let handle = open(Box::new(reader), 0, DeclaredType::Reg).unwrap();
    let err = handle.jopen(0).unwrap_err();
    assert_eq!(err.kind(), forensic_fs_core::ErrorKind::Unsupported);
}
