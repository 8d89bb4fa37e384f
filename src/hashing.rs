//! Evidence image hashing.
//!
//! One sequential pass feeds MD5, SHA-1, SHA-256 and BLAKE3 together, so the
//! acquisition digests come out of a single read of the image.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::evidence::image_len;
use crate::progress::{ProgressTracker, TimeEstimate, DEFAULT_REFRESH};

const READ_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDigests {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub blake3: String,
    pub bytes: u64,
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Default)]
pub struct HashStatusBoard {
    run_id: RwLock<Option<Uuid>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    in_progress: AtomicBool,
    complete: AtomicBool,
    bytes_processed: AtomicU64,
    total_bytes: AtomicU64,
    times: RwLock<TimeEstimate>,
    error: RwLock<Option<String>>,
    digests: RwLock<Option<ImageDigests>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashStatus {
    pub run_id: Option<Uuid>,
    pub image: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
    pub in_progress: bool,
    pub complete: bool,
    pub error: Option<String>,
    pub progress: f64,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    #[serde(flatten)]
    pub times: TimeEstimate,
    pub digests: Option<ImageDigests>,
}

impl HashStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self, run_id: Uuid) {
        *self.run_id.write() = Some(run_id);
        *self.started_at.write() = Some(Utc::now());
        *self.times.write() = TimeEstimate::default();
        *self.error.write() = None;
        *self.digests.write() = None;
        self.bytes_processed.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.complete.store(false, Ordering::Relaxed);
        self.in_progress.store(true, Ordering::Release);
    }

    fn finish(&self, outcome: std::result::Result<ImageDigests, String>) {
        match outcome {
            Ok(digests) => *self.digests.write() = Some(digests),
            Err(e) => *self.error.write() = Some(e),
        }
        self.in_progress.store(false, Ordering::Relaxed);
        self.complete.store(true, Ordering::Release);
    }

    pub fn snapshot(&self, image: &Path) -> HashStatus {
        let processed = self.bytes_processed.load(Ordering::Relaxed);
        let total = self.total_bytes.load(Ordering::Relaxed);
        let complete = self.complete.load(Ordering::Acquire);
        let progress = if complete && self.error.read().is_none() {
            100.0
        } else if total == 0 {
            0.0
        } else {
            processed.min(total) as f64 * 100.0 / total as f64
        };
        HashStatus {
            run_id: *self.run_id.read(),
            image: image.to_path_buf(),
            started_at: *self.started_at.read(),
            in_progress: self.in_progress.load(Ordering::Acquire),
            complete,
            error: self.error.read().clone(),
            progress,
            bytes_processed: processed,
            total_bytes: total,
            times: self.times.read().clone(),
            digests: self.digests.read().clone(),
        }
    }
}

// ============================================================================
// Hasher
// ============================================================================

pub struct ImageHasher {
    status: std::sync::Arc<HashStatusBoard>,
    eta_refresh: Duration,
}

impl Default for ImageHasher {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH)
    }
}

impl ImageHasher {
    pub fn new(eta_refresh: Duration) -> Self {
        Self {
            status: std::sync::Arc::new(HashStatusBoard::new()),
            eta_refresh,
        }
    }

    pub fn status(&self) -> std::sync::Arc<HashStatusBoard> {
        std::sync::Arc::clone(&self.status)
    }

    /// Hash the image at `path`. Failures land in the snapshot's `error`.
    pub fn hash(&self, path: &Path) -> HashStatus {
        let run_id = Uuid::new_v4();
        self.status.begin(run_id);
        tracing::info!(%run_id, image = %path.display(), "Hashing image");

        match self.digest(path) {
            Ok(digests) => {
                tracing::info!(
                    %run_id,
                    md5 = %digests.md5,
                    sha1 = %digests.sha1,
                    sha256 = %digests.sha256,
                    bytes = digests.bytes,
                    "Hashing complete"
                );
                self.status.finish(Ok(digests));
            }
            Err(e) => {
                tracing::error!(%run_id, error = %e, "Hashing failed");
                self.status.finish(Err(e.to_string()));
            }
        }
        self.status.snapshot(path)
    }

    fn digest(&self, path: &Path) -> Result<ImageDigests> {
        let open_err = |source| Error::Image {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(open_err)?;
        let total = image_len(&file).map_err(open_err)?;
        self.status.total_bytes.store(total, Ordering::Relaxed);

        let mut md5 = md5::Context::new();
        let mut sha1 = Sha1::new();
        let mut sha256 = Sha256::new();
        let mut blake3 = blake3::Hasher::new();
        let mut tracker = ProgressTracker::new(self.eta_refresh);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut done = 0u64;

        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            md5.consume(chunk);
            sha1.update(chunk);
            sha256.update(chunk);
            blake3.update(chunk);
            done += n as u64;

            self.status.bytes_processed.store(done, Ordering::Relaxed);
            if let Some(times) = tracker.update(done, total) {
                *self.status.times.write() = times.clone();
            }
        }
        *self.status.times.write() = tracker.finish().clone();

        Ok(ImageDigests {
            md5: format!("{:x}", md5.compute()),
            sha1: hex::encode(sha1.finalize()),
            sha256: hex::encode(sha256.finalize()),
            blake3: blake3.finalize().to_hex().to_string(),
            bytes: done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::io::Write;

    #[test]
    fn known_vectors() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let status = ImageHasher::default().hash(file.path());
        assert!(status.complete);
        assert_eq!(status.progress, 100.0);
        let digests = status.digests.unwrap();
        assert_eq!(digests.md5, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(digests.sha1, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            digests.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digests.blake3, blake3::hash(b"abc").to_hex().to_string());
        assert_eq!(digests.bytes, 3);
    }

    #[test]
    fn multi_chunk_images_match_one_shot_digests() {
        let data: Vec<u8> = (0..(READ_CHUNK * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();

        let status = ImageHasher::default().hash(file.path());
        let digests = status.digests.unwrap();
        assert_eq!(digests.sha1, hex::encode(Sha1::digest(&data)));
        assert_eq!(digests.sha256, hex::encode(Sha256::digest(&data)));
        assert_eq!(status.bytes_processed, data.len() as u64);
    }

    #[test]
    fn missing_image_is_reported() {
        let status = ImageHasher::default().hash(Path::new("/nonexistent/disk.img"));
        assert!(status.complete);
        assert!(status.digests.is_none());
        assert!(status.error.unwrap().contains("/nonexistent/disk.img"));
    }
}
