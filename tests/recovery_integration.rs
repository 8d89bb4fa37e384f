//! End-to-end recovery over synthetic ext2 and FAT16 images, bare and
//! behind an MBR.

mod common;

use std::path::Path;

use carvex::status::RecoveryStatus;
use carvex::{FilesystemRecoveryEngine, FileType, RecoveryOptions, Strategy};
use common::*;
use tempfile::tempdir;

fn recover(image: &Path, output: &Path, strategies: &[Strategy]) -> RecoveryStatus {
    let engine = FilesystemRecoveryEngine::new(RecoveryOptions {
        output_dir: output.to_path_buf(),
        strategies: strategies.to_vec(),
        ..Default::default()
    })
    .unwrap();
    engine.recover(image)
}

fn contents(status: &RecoveryStatus) -> Vec<Vec<u8>> {
    status
        .run
        .files
        .iter()
        .map(|f| std::fs::read(&f.path).unwrap())
        .collect()
}

fn methods(status: &RecoveryStatus) -> Vec<&str> {
    status.run.files.iter().map(|f| f.method.as_str()).collect()
}

// ============================================================================
// ext2
// ============================================================================

#[test]
fn ext2_all_strategies() {
    let dir = tempdir().unwrap();
    let image = write_image(dir.path(), "ext2.img", &ext2_volume());
    let status = recover(&image, &dir.path().join("out"), &Strategy::ALL);

    assert!(status.run.complete);
    assert!(!status.failed, "{:?}", status.run.error);
    assert_eq!(status.partitions, vec!["Primary Volume".to_string()]);
    assert_eq!(
        methods(&status),
        vec!["directory_walk", "inode_scan", "file_slack", "recycle_bin"]
    );
    assert_eq!(
        contents(&status),
        vec![ext_secret(), ext_orphan(), ext_notes_slack(), ext_draft()]
    );

    let names: Vec<&str> = status.run.files.iter().map(|f| f.filename.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "deleted_files_recovery_0001.txt",
            "deleted_files_recovery_0002.png",
            "deleted_files_recovery_0003.bin",
            "deleted_files_recovery_0004.txt",
        ]
    );

    // inode 13 shows up again in the inode scan
    let v = status.run.validation;
    assert_eq!(v.total_scanned, 5);
    assert_eq!(v.rejected_duplicate, 1);
    assert_eq!(v.valid_recovered, 4);
    assert_eq!(status.strategy_counts["inode_scan"], 1);
    assert_eq!(status.run.progress, 100.0);
}

#[test]
fn ext2_metadata_survives() {
    let dir = tempdir().unwrap();
    let image = write_image(dir.path(), "ext2.img", &ext2_volume());
    let status = recover(&image, &dir.path().join("out"), &[Strategy::DirectoryWalk]);

    assert_eq!(status.run.files.len(), 1);
    let file = &status.run.files[0];
    assert_eq!(file.offset, (EXT_SECRET_BLOCK * EXT_BLOCK) as u64);
    assert_eq!(file.size, 700);
    assert_eq!(file.file_type, FileType::Document);
    assert_eq!(file.full_hash, blake3::hash(&ext_secret()).to_hex().to_string());

    let source = file.source.as_ref().unwrap();
    assert_eq!(source.inode, Some(13));
    assert_eq!(source.original_name.as_deref(), Some("secret.txt"));
    assert_eq!(source.partition, 0);
    assert_eq!(source.deleted.unwrap().timestamp(), 1_700_000_500);
}

#[test]
fn ext2_slack_offset_points_past_logical_end() {
    let dir = tempdir().unwrap();
    let image = write_image(dir.path(), "ext2.img", &ext2_volume());
    let status = recover(&image, &dir.path().join("out"), &[Strategy::FileSlack]);

    assert_eq!(status.run.files.len(), 1);
    let file = &status.run.files[0];
    assert_eq!(file.offset, (EXT_NOTES_BLOCK * EXT_BLOCK + EXT_NOTES_SIZE) as u64);
    assert_eq!(file.size, 548);
    assert_eq!(file.extension, ".bin");
}

#[test]
fn ext4_group_descriptor_past_volume_end() {
    let dir = tempdir().unwrap();
    let mut volume = ext2_volume();
    let sb = 1024;
    // 64-bit descriptors whose inode table high half is garbage
    put32(&mut volume, sb + 96, 0x0002 | 0x0080);
    put16(&mut volume, sb + 254, 64);
    put32(&mut volume, 2 * EXT_BLOCK + 0x28, 0xFFFF_FFFF);
    let image = write_image(dir.path(), "ext4.img", &volume);
    let status = recover(&image, &dir.path().join("out"), &Strategy::ALL);

    assert!(status.run.complete);
    assert!(!status.failed, "{:?}", status.run.error);
    assert_eq!(status.partitions, vec!["Primary Volume".to_string()]);
    assert!(status.run.files.is_empty());
    assert_eq!(status.run.progress, 100.0);
}

#[test]
fn ext2_behind_mbr() {
    let dir = tempdir().unwrap();
    let volume = ext2_volume();
    let disk = mbr_disk(&[(0x83, &volume)]);
    let image = write_image(dir.path(), "disk.img", &disk);
    let status = recover(&image, &dir.path().join("out"), &[Strategy::DirectoryWalk]);

    let base = partition_offset(&[&volume], 0);
    assert_eq!(status.partitions.len(), 1);
    assert!(status.partitions[0].starts_with("Partition 1: Linux"));
    assert_eq!(status.run.files.len(), 1);
    let file = &status.run.files[0];
    assert_eq!(file.offset, base + (EXT_SECRET_BLOCK * EXT_BLOCK) as u64);
    let source = file.source.as_ref().unwrap();
    assert_eq!(source.partition, 1);
    assert_eq!(source.partition_offset, base);
}

// ============================================================================
// FAT16
// ============================================================================

#[test]
fn fat16_all_strategies() {
    let dir = tempdir().unwrap();
    let image = write_image(dir.path(), "fat.img", &fat16_volume());
    let status = recover(&image, &dir.path().join("out"), &Strategy::ALL);

    assert!(!status.failed, "{:?}", status.run.error);
    // no inode table, so the inode scan contributes nothing
    assert_eq!(methods(&status), vec!["directory_walk", "file_slack", "recycle_bin"]);
    assert_eq!(
        contents(&status),
        vec![fat_photo(), fat_report_slack(), fat_recycled()]
    );

    let photo = &status.run.files[0];
    assert_eq!(photo.filename, "deleted_files_recovery_0001.jpg");
    assert_eq!(photo.mime, "image/jpeg");
    assert_eq!(photo.offset, fat_cluster(10) as u64);
    let source = photo.source.as_ref().unwrap();
    assert_eq!(source.original_name.as_deref(), Some("_HOTO.JPG"));
    assert!(source.modified.is_some());

    let memo = &status.run.files[2];
    assert_eq!(memo.extension, ".txt");
    assert_eq!(
        memo.source.as_ref().unwrap().original_path.as_deref(),
        Some("RECYCLED/DC1.TXT")
    );
}

#[test]
fn fat16_behind_mbr() {
    let dir = tempdir().unwrap();
    let volume = fat16_volume();
    let disk = mbr_disk(&[(0x06, &volume)]);
    let image = write_image(dir.path(), "disk.img", &disk);
    let status = recover(&image, &dir.path().join("out"), &[Strategy::RecycleBin]);

    assert!(status.partitions[0].contains("FAT16"));
    assert_eq!(status.run.files.len(), 1);
    let base = partition_offset(&[&volume], 0);
    assert_eq!(status.run.files[0].offset, base + fat_cluster(21) as u64);
}

// ============================================================================
// Multi-volume and failure paths
// ============================================================================

#[test]
fn every_partition_is_searched() {
    let dir = tempdir().unwrap();
    let ext = ext2_volume();
    let fat = fat16_volume();
    let disk = mbr_disk(&[(0x83, &ext), (0x06, &fat)]);
    let image = write_image(dir.path(), "disk.img", &disk);
    let status = recover(&image, &dir.path().join("out"), &[Strategy::DirectoryWalk]);

    assert_eq!(status.partitions.len(), 2);
    assert_eq!(contents(&status), vec![ext_secret(), fat_photo()]);
    let parts: Vec<usize> = status
        .run
        .files
        .iter()
        .map(|f| f.source.as_ref().unwrap().partition)
        .collect();
    assert_eq!(parts, vec![1, 2]);
    assert_eq!(
        status.run.files[1].source.as_ref().unwrap().partition_offset,
        partition_offset(&[&ext, &fat], 1)
    );
}

#[test]
fn same_volume_twice_is_deduplicated() {
    let dir = tempdir().unwrap();
    let ext = ext2_volume();
    let disk = mbr_disk(&[(0x83, &ext), (0x83, &ext)]);
    let image = write_image(dir.path(), "disk.img", &disk);
    let status = recover(&image, &dir.path().join("out"), &[Strategy::DirectoryWalk]);

    assert_eq!(status.run.files.len(), 1);
    assert_eq!(status.run.validation.rejected_duplicate, 1);
}

#[test]
fn unrecognised_image_fails() {
    let dir = tempdir().unwrap();
    let image = write_image(dir.path(), "blank.img", &vec![0x5Au8; 64 * 1024]);
    let status = recover(&image, &dir.path().join("out"), &Strategy::ALL);

    assert!(status.run.complete);
    assert!(status.failed);
    assert!(status.run.error.unwrap().contains("no valid filesystem"));
    assert!(status.run.files.is_empty());
}

#[test]
fn rerun_replaces_previous_output() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("out");
    let image = write_image(dir.path(), "ext2.img", &ext2_volume());
    let engine = FilesystemRecoveryEngine::new(RecoveryOptions {
        output_dir: out.clone(),
        ..Default::default()
    })
    .unwrap();

    let first = engine.recover(&image);
    std::fs::write(out.join("stray.txt"), b"left over").unwrap();
    let second = engine.recover(&image);

    assert_ne!(first.run.run_id, second.run.run_id);
    let mut on_disk: Vec<String> = std::fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    on_disk.sort();
    let mut expected: Vec<String> = second.run.files.iter().map(|f| f.filename.clone()).collect();
    expected.sort();
    assert_eq!(on_disk, expected);
}
