//! Dedup module - Two-tier content addressing for recovered files
//!
//! A quick key (size + xxh3 of the head and tail windows) rejects obvious
//! repeats before any bytes are copied. Survivors are streamed to disk
//! through [`HashingWriter`], which produces the blake3 digest used for the
//! final check without a second read.
//!
//! One [`Deduplicator`] lives for one engine run and is driven from a single
//! scanning thread.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::Result;
use xxhash_rust::xxh3::Xxh3;

/// Bytes taken from each end of a region for the quick key
pub const DEFAULT_QUICK_WINDOW: usize = 4096;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Size plus xxh3 of head and tail windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuickKey {
    pub size: u64,
    pub digest: u64,
}

impl QuickKey {
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.digest)
    }
}

/// blake3 digest of the full content
pub type FullHash = [u8; 32];

pub fn full_hash_hex(hash: &FullHash) -> String {
    hex::encode(hash)
}

/// Quick key from already-read head and tail windows.
///
/// When the region is no larger than one window, pass the whole region as
/// `head` and an empty `tail`.
pub fn quick_key(size: u64, head: &[u8], tail: &[u8]) -> QuickKey {
    let mut hasher = Xxh3::new();
    hasher.update(&size.to_le_bytes());
    hasher.update(head);
    hasher.update(tail);
    QuickKey {
        size,
        digest: hasher.digest(),
    }
}

/// Byte ranges `(head, tail)` a quick key covers for a region of `size` bytes
pub fn quick_windows(size: u64, window: usize) -> ((u64, u64), (u64, u64)) {
    let window = window as u64;
    if size <= window * 2 {
        ((0, size), (size, size))
    } else {
        ((0, window), (size - window, size))
    }
}

/// Quick key for an in-memory region
pub fn quick_key_for_slice(data: &[u8], window: usize) -> QuickKey {
    let ((h0, h1), (t0, t1)) = quick_windows(data.len() as u64, window);
    quick_key(
        data.len() as u64,
        &data[h0 as usize..h1 as usize],
        &data[t0 as usize..t1 as usize],
    )
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Unique { quick: QuickKey, full: FullHash },
    QuickDuplicate,
    FullDuplicate,
}

impl DedupOutcome {
    pub fn is_unique(&self) -> bool {
        matches!(self, DedupOutcome::Unique { .. })
    }
}

/// Per-run dedup index
#[derive(Debug, Clone)]
pub struct Deduplicator {
    window: usize,
    quick_seen: HashSet<QuickKey>,
    full_seen: HashSet<FullHash>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_QUICK_WINDOW)
    }
}

impl Deduplicator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            quick_seen: HashSet::new(),
            full_seen: HashSet::new(),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn reset(&mut self) {
        self.quick_seen.clear();
        self.full_seen.clear();
    }

    /// Number of committed files
    pub fn len(&self) -> usize {
        self.full_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.full_seen.is_empty()
    }

    pub fn is_quick_duplicate(&self, key: &QuickKey) -> bool {
        self.quick_seen.contains(key)
    }

    pub fn is_full_duplicate(&self, hash: &FullHash) -> bool {
        self.full_seen.contains(hash)
    }

    /// Commit both keys. Returns false (and commits nothing) if the full hash
    /// was already present.
    pub fn register(&mut self, quick: QuickKey, full: FullHash) -> bool {
        if !self.full_seen.insert(full) {
            return false;
        }
        self.quick_seen.insert(quick);
        true
    }

    /// Check and register an in-memory region in one step.
    pub fn check_and_register(&mut self, data: &[u8]) -> DedupOutcome {
        let quick = quick_key_for_slice(data, self.window);
        if self.is_quick_duplicate(&quick) {
            return DedupOutcome::QuickDuplicate;
        }
        let full = *blake3::hash(data).as_bytes();
        if self.register(quick, full) {
            DedupOutcome::Unique { quick, full }
        } else {
            DedupOutcome::FullDuplicate
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// What a [`HashingWriter`] saw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDigest {
    pub hash: FullHash,
    pub written: u64,
    /// Every byte written was zero (wiped or never-written blocks)
    pub all_zero: bool,
}

/// Writer adapter that hashes everything passing through it
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: blake3::Hasher,
    written: u64,
    all_zero: bool,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            written: 0,
            all_zero: true,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and hand back the inner writer with the digest.
    pub fn finish(mut self) -> io::Result<(W, StreamDigest)> {
        self.inner.flush()?;
        let digest = StreamDigest {
            hash: *self.hasher.finalize().as_bytes(),
            written: self.written,
            all_zero: self.all_zero,
        };
        Ok((self.inner, digest))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        let chunk = &buf[..n];
        self.hasher.update(chunk);
        if self.all_zero && chunk.iter().any(|b| *b != 0) {
            self.all_zero = false;
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hex blake3 of a file on disk
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn quick_key_covers_whole_small_region() {
        let data = vec![7u8; 100];
        let ((h0, h1), (t0, t1)) = quick_windows(100, 4096);
        assert_eq!((h0, h1), (0, 100));
        assert_eq!(t0, t1);
        assert_eq!(quick_key_for_slice(&data, 4096), quick_key(100, &data, &[]));
    }

    #[test]
    fn quick_key_ignores_middle_of_large_region() {
        let mut a = vec![1u8; 20_000];
        let b = a.clone();
        a[10_000] = 99;
        assert_eq!(quick_key_for_slice(&a, 4096), quick_key_for_slice(&b, 4096));
        assert_ne!(blake3::hash(&a), blake3::hash(&b));
    }

    #[test]
    fn size_is_part_of_quick_key() {
        let a = vec![0u8; 10];
        let b = vec![0u8; 11];
        assert_ne!(quick_key_for_slice(&a, 4096), quick_key_for_slice(&b, 4096));
    }

    #[test]
    fn check_and_register_flags_repeats() {
        let mut dedup = Deduplicator::default();
        let data = b"recovered bytes".repeat(50);

        assert!(dedup.check_and_register(&data).is_unique());
        assert_eq!(dedup.check_and_register(&data), DedupOutcome::QuickDuplicate);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn full_collision_commits_nothing() {
        let mut dedup = Deduplicator::new(16);
        let data = vec![3u8; 64];
        let quick_a = quick_key_for_slice(&data, 16);
        let full = *blake3::hash(&data).as_bytes();
        assert!(dedup.register(quick_a, full));

        let quick_b = QuickKey { size: 64, digest: quick_a.digest ^ 1 };
        assert!(!dedup.register(quick_b, full));
        assert!(!dedup.is_quick_duplicate(&quick_b));
    }

    #[test]
    fn reset_forgets_everything() {
        let mut dedup = Deduplicator::default();
        dedup.check_and_register(b"abc");
        dedup.reset();
        assert!(dedup.is_empty());
        assert!(dedup.check_and_register(b"abc").is_unique());
    }

    #[test]
    fn hashing_writer_matches_one_shot_hash() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let mut writer = HashingWriter::new(Vec::new());
        for chunk in data.chunks(4096) {
            writer.write_all(chunk).unwrap();
        }
        let (inner, digest) = writer.finish().unwrap();
        assert_eq!(inner, data);
        assert_eq!(digest.written, data.len() as u64);
        assert_eq!(&digest.hash, blake3::hash(&data).as_bytes());
        assert!(!digest.all_zero);
    }

    #[test]
    fn hashing_writer_detects_zero_content() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(&[0u8; 1000]).unwrap();
        let (_, digest) = writer.finish().unwrap();
        assert!(digest.all_zero);
    }

    #[test]
    fn hash_file_matches_blake3() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"carved bytes").unwrap();
        assert_eq!(hash_file(&path).unwrap(), blake3::hash(b"carved bytes").to_hex().to_string());
        assert_eq!(
            full_hash_hex(blake3::hash(b"carved bytes").as_bytes()),
            hash_file(&path).unwrap()
        );
    }
}
