//! Synthetic disk images shared by the integration tests.
//!
//! Everything is built byte by byte so the expected offsets are known
//! exactly: a small ext2 volume, a FAT16 volume and an MBR wrapper.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

pub const SECTOR: usize = 512;

pub fn put16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn put32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// `unit` repeated out to exactly `len` bytes
pub fn pattern(unit: &[u8], len: usize) -> Vec<u8> {
    unit.iter().copied().cycle().take(len).collect()
}

pub fn write_image(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).expect("write test image");
    path
}

// ============================================================================
// Carving payloads
// ============================================================================

/// JPEG of exactly `len` bytes with no stray 0xFF inside
pub fn jpeg(len: usize, seed: u8) -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8, 0xFF, 0xE0];
    out.extend((0..len - 6).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed) & 0x7F));
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

/// 128 kbps, 44.1 kHz MPEG-1 Layer III frame (417 bytes)
pub fn mp3_frame() -> Vec<u8> {
    let mut out = vec![0xFF, 0xFB, 0x90, 0x44];
    out.resize(417, 0x55);
    out
}

pub fn wav(body: usize) -> Vec<u8> {
    let mut out = b"RIFF".to_vec();
    out.extend_from_slice(&((body + 4) as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend(pattern(b"pcm!", body));
    out
}

/// Single stored entry archive
pub fn tiny_zip(name: &str, data: &[u8]) -> Vec<u8> {
    let crc = crc32fast::hash(data);
    let mut out = Vec::new();

    out.extend_from_slice(&0x0403_4B50u32.to_le_bytes());
    out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(data);

    let cdir = out.len();
    out.extend_from_slice(&0x0201_4B50u32.to_le_bytes());
    out.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&[0; 12]);
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    let cdir_len = out.len() - cdir;

    out.extend_from_slice(&0x0605_4B50u32.to_le_bytes());
    out.extend_from_slice(&[0, 0, 0, 0, 1, 0, 1, 0]);
    out.extend_from_slice(&(cdir_len as u32).to_le_bytes());
    out.extend_from_slice(&(cdir as u32).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

// ============================================================================
// ext2
// ============================================================================

pub const EXT_BLOCK: usize = 1024;
const EXT_BLOCKS: usize = 64;
const EXT_INODES: u32 = 32;
const EXT_INODE_SIZE: usize = 128;
const EXT_INODE_TABLE: usize = 5;

pub const EXT_SECRET_BLOCK: usize = 20;
pub const EXT_NOTES_BLOCK: usize = 21;
pub const EXT_ORPHAN_BLOCK: usize = 23;
pub const EXT_DRAFT_BLOCK: usize = 24;

pub const EXT_NOTES_SIZE: usize = 1500;

pub fn ext_secret() -> Vec<u8> {
    pattern(b"top secret line\n", 700)
}

pub fn ext_orphan() -> Vec<u8> {
    let mut out = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    out.extend(pattern(b"orphaned pixels ", 892));
    out
}

pub fn ext_notes() -> Vec<u8> {
    pattern(b"meeting notes\n", EXT_NOTES_SIZE)
}

/// What is left in the notes file's last block past its size
pub fn ext_notes_slack() -> Vec<u8> {
    pattern(b"stale draft text ", 2 * EXT_BLOCK - EXT_NOTES_SIZE)
}

pub fn ext_draft() -> Vec<u8> {
    pattern(b"draft paragraph\n", 1000)
}

fn ext_inode(image: &mut [u8], ino: usize, mode: u16, size: u32, blocks: &[u32], dtime: u32) {
    let at = EXT_INODE_TABLE * EXT_BLOCK + (ino - 1) * EXT_INODE_SIZE;
    put16(image, at, mode);
    put32(image, at + 4, size);
    put32(image, at + 8, 1_700_000_000);
    put32(image, at + 12, 1_700_000_000);
    put32(image, at + 16, 1_700_000_000);
    put32(image, at + 20, dtime);
    for (i, block) in blocks.iter().enumerate() {
        put32(image, at + 40 + i * 4, *block);
    }
}

fn dir_record(block: &mut [u8], pos: usize, inode: u32, rec_len: u16, name: &str, kind: u8) {
    put32(block, pos, inode);
    put16(block, pos + 4, rec_len);
    block[pos + 6] = name.len() as u8;
    block[pos + 7] = kind;
    block[pos + 8..pos + 8 + name.len()].copy_from_slice(name.as_bytes());
}

/// A 64 KiB ext2 volume.
///
/// ```text
/// /secret.txt          inode 13, deleted, name hidden in ".." slack
/// /notes.txt           inode 12, 1500 bytes, 548 bytes of slack
/// /.Trash-1000/        inode 11
///     draft.txt        inode 15, live
/// (no name)            inode 14, deleted orphan, PNG magic
/// ```
pub fn ext2_volume() -> Vec<u8> {
    let mut image = vec![0u8; EXT_BLOCKS * EXT_BLOCK];

    let sb = 1024;
    put32(&mut image, sb, EXT_INODES);
    put32(&mut image, sb + 4, EXT_BLOCKS as u32);
    put32(&mut image, sb + 20, 1);
    put32(&mut image, sb + 24, 0);
    put32(&mut image, sb + 32, 8192);
    put32(&mut image, sb + 40, EXT_INODES);
    put16(&mut image, sb + 56, 0xEF53);
    put32(&mut image, sb + 76, 1);
    put16(&mut image, sb + 88, EXT_INODE_SIZE as u16);
    // filetype in directory records
    put32(&mut image, sb + 96, 0x0002);

    let gdt = 2 * EXT_BLOCK;
    put32(&mut image, gdt, 3);
    put32(&mut image, gdt + 4, 4);
    put32(&mut image, gdt + 8, EXT_INODE_TABLE as u32);

    // inodes 1-12 and 15 in use, 13 and 14 freed
    let bitmap = 4 * EXT_BLOCK;
    image[bitmap] = 0xFF;
    image[bitmap + 1] = 0x4F;

    let deleted_at = 1_700_000_500;
    ext_inode(&mut image, 2, 0x41ED, EXT_BLOCK as u32, &[9], 0);
    ext_inode(&mut image, 11, 0x41C0, EXT_BLOCK as u32, &[10], 0);
    ext_inode(&mut image, 12, 0x81A4, EXT_NOTES_SIZE as u32, &[21, 22], 0);
    ext_inode(&mut image, 13, 0x81A4, 700, &[EXT_SECRET_BLOCK as u32], deleted_at);
    ext_inode(&mut image, 14, 0x81A4, 900, &[EXT_ORPHAN_BLOCK as u32], deleted_at);
    ext_inode(&mut image, 15, 0x81A4, 1000, &[EXT_DRAFT_BLOCK as u32], 0);

    let root = 9 * EXT_BLOCK;
    let block = &mut image[root..root + EXT_BLOCK];
    dir_record(block, 0, 2, 12, ".", 2);
    // ".." swallowed the record of the deleted file after it
    dir_record(block, 12, 2, 32, "..", 2);
    dir_record(block, 24, 13, 20, "secret.txt", 1);
    dir_record(block, 44, 11, 20, ".Trash-1000", 2);
    dir_record(block, 64, 12, 960, "notes.txt", 1);

    let trash = 10 * EXT_BLOCK;
    let block = &mut image[trash..trash + EXT_BLOCK];
    dir_record(block, 0, 11, 12, ".", 2);
    dir_record(block, 12, 2, 12, "..", 2);
    dir_record(block, 24, 15, 1000, "draft.txt", 1);

    let place = |image: &mut Vec<u8>, at: usize, data: &[u8]| {
        image[at..at + data.len()].copy_from_slice(data);
    };
    place(&mut image, EXT_SECRET_BLOCK * EXT_BLOCK, &ext_secret());
    place(&mut image, EXT_NOTES_BLOCK * EXT_BLOCK, &ext_notes());
    place(
        &mut image,
        EXT_NOTES_BLOCK * EXT_BLOCK + EXT_NOTES_SIZE,
        &ext_notes_slack(),
    );
    place(&mut image, EXT_ORPHAN_BLOCK * EXT_BLOCK, &ext_orphan());
    place(&mut image, EXT_DRAFT_BLOCK * EXT_BLOCK, &ext_draft());
    image
}

// ============================================================================
// FAT16
// ============================================================================

const FAT_RESERVED: usize = 1;
const FAT_SECTORS: usize = 17;
const FAT_ROOT_ENTRIES: usize = 512;
const FAT_CLUSTERS: usize = 4100;
const FAT_ROOT: usize = (FAT_RESERVED + 2 * FAT_SECTORS) * SECTOR;
const FAT_DATA: usize = FAT_ROOT + FAT_ROOT_ENTRIES * 32;

pub const FAT_REPORT_SIZE: usize = 700;

pub fn fat_cluster(cluster: usize) -> usize {
    FAT_DATA + (cluster - 2) * SECTOR
}

pub fn fat_report() -> Vec<u8> {
    pattern(b"quarterly report\n", FAT_REPORT_SIZE)
}

pub fn fat_report_slack() -> Vec<u8> {
    pattern(b"old revision ", 2 * SECTOR - FAT_REPORT_SIZE)
}

pub fn fat_photo() -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8, 0xFF, 0xE1];
    out.extend(pattern(b"exif and scanlines ", 1196));
    out
}

pub fn fat_recycled() -> Vec<u8> {
    pattern(b"binned memo\n", 400)
}

fn set_fat16(image: &mut [u8], cluster: usize, value: u16) {
    for fat in 0..2 {
        let at = (FAT_RESERVED + fat * FAT_SECTORS) * SECTOR + cluster * 2;
        put16(image, at, value);
    }
}

fn short_slot(name: &[u8; 11], attr: u8, cluster: u16, size: u32) -> [u8; 32] {
    let mut slot = [0u8; 32];
    slot[..11].copy_from_slice(name);
    slot[11] = attr;
    // 2023-11-14 22:13:20
    put16(&mut slot, 22, (22 << 11) | (13 << 5) | 10);
    put16(&mut slot, 24, (43 << 9) | (11 << 5) | 14);
    put16(&mut slot, 26, cluster);
    put32(&mut slot, 28, size);
    slot
}

/// A FAT16 volume with 4100 one-sector clusters.
///
/// ```text
/// REPORT.TXT     clusters 2-3, 324 bytes of slack
/// _HOTO.JPG      deleted, cluster 10, chain cleared
/// RECYCLED/      cluster 20
///     DC1.TXT    cluster 21, live
/// ```
pub fn fat16_volume() -> Vec<u8> {
    let total = FAT_DATA / SECTOR + FAT_CLUSTERS;
    let mut image = vec![0u8; total * SECTOR];
    image[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    image[3..11].copy_from_slice(b"MSWIN4.1");
    put16(&mut image, 11, SECTOR as u16);
    image[13] = 1;
    put16(&mut image, 14, FAT_RESERVED as u16);
    image[16] = 2;
    put16(&mut image, 17, FAT_ROOT_ENTRIES as u16);
    put16(&mut image, 19, total as u16);
    image[21] = 0xF8;
    put16(&mut image, 22, FAT_SECTORS as u16);
    image[510] = 0x55;
    image[511] = 0xAA;

    set_fat16(&mut image, 0, 0xFFF8);
    set_fat16(&mut image, 1, 0xFFFF);
    set_fat16(&mut image, 2, 3);
    set_fat16(&mut image, 3, 0xFFFF);
    set_fat16(&mut image, 20, 0xFFFF);
    set_fat16(&mut image, 21, 0xFFFF);

    let mut photo = short_slot(b"PHOTO   JPG", 0x20, 10, 1200);
    photo[0] = 0xE5;
    let slots = [
        short_slot(b"REPORT  TXT", 0x20, 2, FAT_REPORT_SIZE as u32),
        photo,
        short_slot(b"RECYCLED   ", 0x10, 20, 0),
    ];
    for (i, slot) in slots.iter().enumerate() {
        let at = FAT_ROOT + i * 32;
        image[at..at + 32].copy_from_slice(slot);
    }

    let bin = fat_cluster(20);
    let slots = [
        short_slot(b".          ", 0x10, 20, 0),
        short_slot(b"..         ", 0x10, 0, 0),
        short_slot(b"DC1     TXT", 0x20, 21, 400),
    ];
    for (i, slot) in slots.iter().enumerate() {
        let at = bin + i * 32;
        image[at..at + 32].copy_from_slice(slot);
    }

    let report = fat_report();
    let at = fat_cluster(2);
    image[at..at + report.len()].copy_from_slice(&report);
    let slack = fat_report_slack();
    let at = fat_cluster(2) + FAT_REPORT_SIZE;
    image[at..at + slack.len()].copy_from_slice(&slack);

    let photo = fat_photo();
    let at = fat_cluster(10);
    image[at..at + photo.len()].copy_from_slice(&photo);

    let memo = fat_recycled();
    let at = fat_cluster(21);
    image[at..at + memo.len()].copy_from_slice(&memo);
    image
}

// ============================================================================
// MBR
// ============================================================================

/// First partition starts here; later ones follow back to back
pub const FIRST_LBA: usize = 64;

/// Disk image with one primary MBR entry per `(type, volume)` pair
pub fn mbr_disk(volumes: &[(u8, &[u8])]) -> Vec<u8> {
    let mut image = vec![0u8; FIRST_LBA * SECTOR];
    for (slot, (kind, volume)) in volumes.iter().enumerate() {
        let lba = image.len() / SECTOR;
        let sectors = volume.len().div_ceil(SECTOR);
        let at = 446 + slot * 16;
        image[at] = if slot == 0 { 0x80 } else { 0x00 };
        image[at + 4] = *kind;
        put32(&mut image, at + 8, lba as u32);
        put32(&mut image, at + 12, sectors as u32);
        image.extend_from_slice(volume);
        image.resize((lba + sectors) * SECTOR, 0);
    }
    image[510] = 0x55;
    image[511] = 0xAA;
    image
}

/// Byte offset of the `index`-th (0-based) partition built by [`mbr_disk`]
pub fn partition_offset(volumes: &[&[u8]], index: usize) -> u64 {
    let sectors: usize = volumes[..index]
        .iter()
        .map(|v| v.len().div_ceil(SECTOR))
        .sum();
    ((FIRST_LBA + sectors) * SECTOR) as u64
}
