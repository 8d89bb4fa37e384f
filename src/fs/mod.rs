//! Filesystem metadata layer
//!
//! A narrow capability interface over raw images: partition discovery,
//! directory iteration with allocation flags, inode enumeration and reads
//! from a file's logical or slack extent. Recovery code depends only on the
//! traits here; [`NativeProvider`] binds them to the read-only ext and FAT
//! parsers in this module.

pub mod ext;
pub mod fat;
pub mod partition;

use std::fmt;
use std::io;
use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use partition::Partition;

/// Directory listings larger than this are truncated
pub const MAX_DIR_BYTES: u64 = 64 * 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no recognized filesystem at offset {0}")]
    Unrecognized(u64),

    #[error("corrupt {what}: {detail}")]
    Corrupt { what: &'static str, detail: String },

    #[error("inode {0} is outside the filesystem")]
    InodeOutOfRange(u64),

    #[error("{0} does not support this operation")]
    Unsupported(&'static str),
}

impl FsError {
    pub(crate) fn corrupt(what: &'static str, detail: impl Into<String>) -> Self {
        FsError::Corrupt {
            what,
            detail: detail.into(),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

// ============================================================================
// Image access
// ============================================================================

/// Random-access byte source of known length
pub trait ImageSource: Send + Sync {
    fn len(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`; short reads only at the end.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let n = self.read_at(offset, buf)?;
        if n < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at {} hit end of image", buf.len(), offset),
            ));
        }
        Ok(())
    }
}

impl ImageSource for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(copy_from_slice_at(self, offset, buf))
    }
}

// Callers size their buffers so these never index out of bounds.
pub(crate) fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

pub(crate) fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

pub(crate) fn le64(b: &[u8], at: usize) -> u64 {
    (le32(b, at) as u64) | ((le32(b, at + 4) as u64) << 32)
}

/// Copy from an in-memory image, returning the byte count
pub(crate) fn copy_from_slice_at(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    if start >= data.len() {
        return 0;
    }
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    n
}

/// A byte window of an image: one partition, or the whole image
#[derive(Clone)]
pub struct Volume {
    source: Arc<dyn ImageSource>,
    offset: u64,
    len: u64,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl Volume {
    pub fn new(source: Arc<dyn ImageSource>, offset: u64, len: u64) -> Self {
        let available = source.len().saturating_sub(offset);
        Self {
            source,
            offset,
            len: len.min(available),
        }
    }

    /// Whole image from `offset` to the end
    pub fn at(source: Arc<dyn ImageSource>, offset: u64) -> Self {
        let len = source.len().saturating_sub(offset);
        Self::new(source, offset, len)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(self.len - offset) as usize;
        self.source.read_at(self.offset + offset, &mut buf[..n])
    }

    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let n = self.read_at(offset, buf)?;
        if n < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read past end of volume at {}", offset),
            ));
        }
        Ok(())
    }

    pub fn read_vec(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsKind {
    Ext2,
    Ext3,
    Ext4,
    Fat12,
    Fat16,
    Fat32,
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsKind::Ext2 => "ext2",
            FsKind::Ext3 => "ext3",
            FsKind::Ext4 => "ext4",
            FsKind::Fat12 => "FAT12",
            FsKind::Fat16 => "FAT16",
            FsKind::Fat32 => "FAT32",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Contiguous stretch of a file's data, in volume byte coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub offset: u64,
    pub len: u64,
    /// Hole or unwritten extent: reads as zeros
    pub sparse: bool,
}

impl DataRun {
    pub fn new(offset: u64, len: u64) -> Self {
        Self {
            offset,
            len,
            sparse: false,
        }
    }

    pub fn hole(len: u64) -> Self {
        Self {
            offset: 0,
            len,
            sparse: true,
        }
    }
}

/// Append a run, merging with the previous one when physically adjacent
pub(crate) fn push_run(runs: &mut Vec<DataRun>, run: DataRun) {
    if let Some(last) = runs.last_mut() {
        if last.sparse && run.sparse {
            last.len += run.len;
            return;
        }
        if !last.sparse && !run.sparse && last.offset + last.len == run.offset {
            last.len += run.len;
            return;
        }
    }
    runs.push(run);
}

/// A directory entry joined with its metadata record
#[derive(Debug, Clone)]
pub struct FsEntry {
    /// Inode number, or the entry's virtual address on FAT
    pub inode: u64,
    pub name: String,
    /// Slash-separated path from the root, empty for the root itself
    pub path: String,
    pub kind: EntryKind,
    /// The directory entry is live
    pub name_allocated: bool,
    /// The metadata record is marked in use
    pub meta_allocated: bool,
    /// Logical size in bytes
    pub size: u64,
    pub runs: Vec<DataRun>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub changed: Option<DateTime<Utc>>,
    pub deleted: Option<DateTime<Utc>>,
}

impl FsEntry {
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Metadata says the file was deleted
    pub fn is_deleted(&self) -> bool {
        !self.meta_allocated
    }

    /// Bytes reserved for the file: blocks used times block size
    pub fn allocated_len(&self) -> u64 {
        self.runs.iter().map(|r| r.len).sum()
    }

    pub fn slack_len(&self) -> u64 {
        self.allocated_len().saturating_sub(self.size)
    }

    /// Volume offset of the first byte of data, if it has any
    pub fn first_data_offset(&self) -> Option<u64> {
        self.runs.iter().find(|r| !r.sparse).map(|r| r.offset)
    }

    /// Volume offset of logical position `pos`, if it maps to real blocks
    pub fn offset_of(&self, pos: u64) -> Option<u64> {
        let mut base = 0u64;
        for run in &self.runs {
            if pos < base + run.len {
                return (!run.sparse).then(|| run.offset + (pos - base));
            }
            base += run.len;
        }
        None
    }

    pub(crate) fn child_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.path, name)
        }
    }
}

/// Read `[from + offset, to)` of the run list into `buf`
pub(crate) fn read_runs(
    volume: &Volume,
    runs: &[DataRun],
    from: u64,
    to: u64,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<usize> {
    let mut pos = from.saturating_add(offset);
    if pos >= to {
        return Ok(0);
    }
    let want = (buf.len() as u64).min(to - pos) as usize;
    let mut done = 0usize;
    let mut base = 0u64;

    for run in runs {
        if done == want {
            break;
        }
        let run_end = base + run.len;
        if pos < run_end {
            let within = pos - base;
            let n = ((run.len - within) as usize).min(want - done);
            let dst = &mut buf[done..done + n];
            if run.sparse {
                dst.fill(0);
            } else {
                volume.read_exact_at(run.offset + within, dst)?;
            }
            done += n;
            pos += n as u64;
        }
        base = run_end;
    }
    Ok(done)
}

// ============================================================================
// Capability traits
// ============================================================================

/// One opened filesystem
pub trait FileSystem: Send {
    fn kind(&self) -> FsKind;

    fn volume(&self) -> &Volume;

    /// Allocation unit in bytes (block or cluster)
    fn block_size(&self) -> u64;

    fn root(&self) -> FsResult<FsEntry>;

    /// Children of `dir`, including entries whose names were deleted.
    /// `.` and `..` are not returned.
    fn read_dir(&self, dir: &FsEntry) -> FsResult<Vec<FsEntry>>;

    /// Valid inode numbers, or `None` when the filesystem has no inode table
    fn inode_range(&self) -> Option<RangeInclusive<u64>>;

    fn open_inode(&self, inode: u64) -> FsResult<FsEntry>;

    /// Read from the file's logical extent `[0, size)`
    fn read_file_at(&self, entry: &FsEntry, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let end = entry.size.min(entry.allocated_len());
        Ok(read_runs(self.volume(), &entry.runs, 0, end, offset, buf)?)
    }

    /// Read from the slack extent `[size, allocated)`
    fn read_slack_at(&self, entry: &FsEntry, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        Ok(read_runs(
            self.volume(),
            &entry.runs,
            entry.size,
            entry.allocated_len(),
            offset,
            buf,
        )?)
    }
}

/// Volume and filesystem discovery for an image
pub trait MetadataProvider: Send + Sync {
    /// Partition table entries; empty when the image has no table
    fn partitions(&self, source: &Arc<dyn ImageSource>) -> Vec<Partition>;

    fn open_filesystem(&self, volume: Volume) -> FsResult<Box<dyn FileSystem>>;
}

/// Built-in MBR/GPT, ext2/3/4 and FAT12/16/32 support
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeProvider;

impl MetadataProvider for NativeProvider {
    fn partitions(&self, source: &Arc<dyn ImageSource>) -> Vec<Partition> {
        partition::read_table(source.as_ref())
    }

    fn open_filesystem(&self, volume: Volume) -> FsResult<Box<dyn FileSystem>> {
        let offset = volume.offset();
        if ext::probe(&volume) {
            return Ok(Box::new(ext::ExtFs::open(volume)?));
        }
        if fat::probe(&volume) {
            return Ok(Box::new(fat::FatFs::open(volume)?));
        }
        Err(FsError::Unrecognized(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_runs(size: u64, runs: Vec<DataRun>) -> FsEntry {
        FsEntry {
            inode: 12,
            name: "f".into(),
            path: "f".into(),
            kind: EntryKind::File,
            name_allocated: true,
            meta_allocated: true,
            size,
            runs,
            modified: None,
            accessed: None,
            created: None,
            changed: None,
            deleted: None,
        }
    }

    #[test]
    fn volume_reads_are_windowed() {
        let data: Vec<u8> = (0..=255u8).collect();
        let volume = Volume::new(Arc::new(data), 100, 50);
        let mut buf = [0u8; 10];
        assert_eq!(volume.read_at(0, &mut buf).unwrap(), 10);
        assert_eq!(buf[0], 100);
        assert_eq!(volume.read_at(45, &mut buf).unwrap(), 5);
        assert_eq!(volume.read_at(50, &mut buf).unwrap(), 0);
    }

    #[test]
    fn runs_merge_when_adjacent() {
        let mut runs = Vec::new();
        push_run(&mut runs, DataRun::new(0, 1024));
        push_run(&mut runs, DataRun::new(1024, 1024));
        push_run(&mut runs, DataRun::hole(1024));
        push_run(&mut runs, DataRun::hole(1024));
        push_run(&mut runs, DataRun::new(8192, 1024));
        assert_eq!(
            runs,
            vec![DataRun::new(0, 2048), DataRun::hole(2048), DataRun::new(8192, 1024)]
        );
    }

    #[test]
    fn logical_and_slack_reads_split_at_size() {
        let mut data = vec![0u8; 4096];
        data[1024..2048].fill(b'A');
        data[3072..4096].fill(b'B');
        let volume = Volume::at(Arc::new(data), 0);
        let entry = entry_with_runs(1500, vec![DataRun::new(1024, 1024), DataRun::new(3072, 1024)]);
        assert_eq!(entry.slack_len(), 548);
        assert_eq!(entry.offset_of(1030), Some(3078));

        let mut buf = vec![0u8; 2000];
        let n = read_runs(&volume, &entry.runs, 0, entry.size, 0, &mut buf).unwrap();
        assert_eq!(n, 1500);
        assert!(buf[..1024].iter().all(|b| *b == b'A'));
        assert!(buf[1024..1500].iter().all(|b| *b == b'B'));

        let n = read_runs(&volume, &entry.runs, entry.size, entry.allocated_len(), 0, &mut buf)
            .unwrap();
        assert_eq!(n, 548);
        assert!(buf[..548].iter().all(|b| *b == b'B'));
    }

    #[test]
    fn holes_read_as_zeros() {
        let data = vec![0xFFu8; 2048];
        let volume = Volume::at(Arc::new(data), 0);
        let runs = vec![DataRun::hole(512), DataRun::new(0, 512)];
        let mut buf = vec![1u8; 1024];
        let n = read_runs(&volume, &runs, 0, 1024, 0, &mut buf).unwrap();
        assert_eq!(n, 1024);
        assert!(buf[..512].iter().all(|b| *b == 0));
        assert!(buf[512..].iter().all(|b| *b == 0xFF));
    }
}
