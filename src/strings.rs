//! Printable string extraction.
//!
//! One pass over the mapped image collects runs of printable ASCII
//! (0x20..=0x7E) at least `min_len` bytes long. Every run is counted; only
//! the first `preview_limit` are kept, with their image offsets.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::evidence::EvidenceImage;
use crate::progress::{ProgressTracker, TimeEstimate, DEFAULT_REFRESH};

pub const DEFAULT_MIN_LEN: usize = 4;
pub const DEFAULT_PREVIEW_LIMIT: usize = 200;

fn is_printable(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

/// Every maximal printable run with its offset, empty runs included
fn runs(data: &[u8]) -> impl Iterator<Item = (u64, &[u8])> {
    let mut offset = 0u64;
    data.split(|&b| !is_printable(b)).map(move |run| {
        let at = offset;
        offset += run.len() as u64 + 1;
        (at, run)
    })
}

/// Printable runs of at least `min_len` bytes, in image order
pub fn printable_runs(data: &[u8], min_len: usize) -> impl Iterator<Item = (u64, &[u8])> {
    let min_len = min_len.max(1);
    runs(data).filter(move |(_, run)| run.len() >= min_len)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringsOptions {
    pub min_len: usize,
    pub preview_limit: usize,
    pub eta_refresh: Duration,
}

impl Default for StringsOptions {
    fn default() -> Self {
        Self {
            min_len: DEFAULT_MIN_LEN,
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            eta_refresh: DEFAULT_REFRESH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundString {
    pub offset: u64,
    pub text: String,
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Default)]
pub struct StringsStatusBoard {
    run_id: RwLock<Option<Uuid>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    in_progress: AtomicBool,
    complete: AtomicBool,
    bytes_processed: AtomicU64,
    total_bytes: AtomicU64,
    strings_found: AtomicU64,
    times: RwLock<TimeEstimate>,
    error: RwLock<Option<String>>,
    preview: RwLock<Vec<FoundString>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringsStatus {
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
    pub strings_found: u64,
    pub preview: Vec<FoundString>,
}

impl StringsStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self, run_id: Uuid) {
        *self.run_id.write() = Some(run_id);
        *self.started_at.write() = Some(Utc::now());
        *self.times.write() = TimeEstimate::default();
        *self.error.write() = None;
        self.preview.write().clear();
        self.bytes_processed.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.strings_found.store(0, Ordering::Relaxed);
        self.complete.store(false, Ordering::Relaxed);
        self.in_progress.store(true, Ordering::Release);
    }

    fn record(&self, offset: u64, run: &[u8], preview_limit: usize) {
        self.strings_found.fetch_add(1, Ordering::Relaxed);
        let mut preview = self.preview.write();
        if preview.len() < preview_limit {
            preview.push(FoundString {
                offset,
                text: String::from_utf8_lossy(run).into_owned(),
            });
        }
    }

    fn finish(&self, error: Option<String>) {
        *self.error.write() = error;
        self.in_progress.store(false, Ordering::Relaxed);
        self.complete.store(true, Ordering::Release);
    }

    pub fn snapshot(&self, image: &Path) -> StringsStatus {
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
        StringsStatus {
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
            strings_found: self.strings_found.load(Ordering::Relaxed),
            preview: self.preview.read().clone(),
        }
    }
}

// ============================================================================
// Extractor
// ============================================================================

pub struct StringExtractor {
    options: StringsOptions,
    status: Arc<StringsStatusBoard>,
}

impl Default for StringExtractor {
    fn default() -> Self {
        Self::new(StringsOptions::default())
    }
}

impl StringExtractor {
    pub fn new(options: StringsOptions) -> Self {
        Self {
            options,
            status: Arc::new(StringsStatusBoard::new()),
        }
    }

    pub fn options(&self) -> &StringsOptions {
        &self.options
    }

    pub fn status(&self) -> Arc<StringsStatusBoard> {
        Arc::clone(&self.status)
    }

    /// Extract strings from the image at `path`. Failures land in the
    /// snapshot's `error`.
    pub fn extract(&self, path: &Path) -> StringsStatus {
        let run_id = Uuid::new_v4();
        self.status.begin(run_id);
        tracing::info!(
            %run_id,
            image = %path.display(),
            min_len = self.options.min_len,
            "Extracting strings"
        );

        match self.scan(path) {
            Ok(()) => {
                tracing::info!(
                    %run_id,
                    strings = self.status.strings_found.load(Ordering::Relaxed),
                    "String extraction complete"
                );
                self.status.finish(None);
            }
            Err(e) => {
                tracing::error!(%run_id, error = %e, "String extraction failed");
                self.status.finish(Some(e.to_string()));
            }
        }
        self.status.snapshot(path)
    }

    fn scan(&self, path: &Path) -> Result<()> {
        let image = EvidenceImage::open(path)?;
        let data = image.as_bytes();
        let total = data.len() as u64;
        self.status.total_bytes.store(total, Ordering::Relaxed);

        let min_len = self.options.min_len.max(1);
        let step = (total / 200).max(1);
        let mut next_update = step;
        let mut tracker = ProgressTracker::new(self.options.eta_refresh);

        for (offset, run) in runs(data) {
            if run.len() >= min_len {
                self.status.record(offset, run, self.options.preview_limit);
            }
            let done = (offset + run.len() as u64).min(total);
            if done >= next_update {
                self.status.bytes_processed.store(done, Ordering::Relaxed);
                if let Some(times) = tracker.update(done, total) {
                    *self.status.times.write() = times.clone();
                }
                next_update = done + step;
            }
        }

        self.status.bytes_processed.store(total, Ordering::Relaxed);
        *self.status.times.write() = tracker.finish().clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn texts(data: &[u8], min_len: usize) -> Vec<(u64, String)> {
        printable_runs(data, min_len)
            .map(|(at, run)| (at, String::from_utf8_lossy(run).into_owned()))
            .collect()
    }

    fn image(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file
    }

    #[test]
    fn short_runs_are_skipped() {
        let data = b"\x00abc\x00abcd\x01\x02hello world\xff";
        assert_eq!(
            texts(data, 4),
            vec![(5, "abcd".to_string()), (11, "hello world".to_string())]
        );
        assert_eq!(texts(data, 5).len(), 1);
        assert_eq!(texts(data, 1).len(), 3);
    }

    #[test]
    fn control_bytes_split_runs() {
        assert_eq!(
            texts(b"line one\nline two\t!", 4),
            vec![(0, "line one".to_string()), (9, "line two".to_string())]
        );
    }

    #[test]
    fn run_touching_the_end_is_kept() {
        let data = b"\x00\x00\x00TAILDATA";
        assert_eq!(texts(data, 4), vec![(3, "TAILDATA".to_string())]);

        let status = StringExtractor::default().extract(image(data).path());
        assert_eq!(status.strings_found, 1);
        assert_eq!(status.preview[0].offset, 3);
    }

    #[test]
    fn preview_is_capped_but_every_string_is_counted() {
        let mut data = Vec::new();
        for i in 0..250 {
            data.extend(format!("string-{:03}", i).as_bytes());
            data.push(0);
        }

        let status = StringExtractor::default().extract(image(&data).path());
        assert!(status.complete);
        assert_eq!(status.error, None);
        assert_eq!(status.progress, 100.0);
        assert_eq!(status.bytes_processed, data.len() as u64);
        assert_eq!(status.strings_found, 250);
        assert_eq!(status.preview.len(), DEFAULT_PREVIEW_LIMIT);
        assert_eq!(status.preview[0].text, "string-000");
        assert_eq!(status.preview[199].text, "string-199");
        assert_eq!(status.preview[1].offset, 11);
    }

    #[test]
    fn min_len_option_applies_to_extraction() {
        let extractor = StringExtractor::new(StringsOptions {
            min_len: 8,
            ..Default::default()
        });
        let status = extractor.extract(image(b"short\x00much longer\x00").path());
        assert_eq!(status.strings_found, 1);
        assert_eq!(status.preview[0].text, "much longer");
    }

    #[test]
    fn unreadable_image_is_reported() {
        let status = StringExtractor::default().extract(Path::new("/nonexistent/disk.img"));
        assert!(status.complete);
        assert!(!status.in_progress);
        assert!(status.error.unwrap().contains("/nonexistent/disk.img"));
        assert_eq!(status.strings_found, 0);
    }
}
