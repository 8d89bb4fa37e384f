//! File carving module - Recover files from raw disk images by signature.
//!
//! Scans a memory-mapped image once per distinct header byte sequence,
//! validating every hit against each format registered under that header
//! and persisting the first accepted region.
//!
//! # Design
//!
//! - **mmap**: Zero-copy access to multi-GB images via `memmap2`
//! - **Header groups**: Formats sharing magic bytes (the ZIP family, the
//!   `ftyp` brands) are tried in registration order at each hit, so the
//!   specific container wins over its generic form
//! - **One-byte advance**: After every hit the scan resumes one byte later,
//!   never past the accepted region, so overlapping and nested signatures
//!   are still found
//! - **Dedup before copy**: A quick head/tail key rejects repeats before any
//!   bytes are written; the full blake3 comes from the write itself
//!
//! **Destructive:** every [`Carver::carve`] call starts by emptying the
//! output directory.

pub mod signatures;
pub mod validate;

use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use memchr::memmem;
use uuid::Uuid;

use crate::core::{notify, FileCallback, RecoveredFile};
use crate::dedup::{
    full_hash_hex, quick_key_for_slice, Deduplicator, HashingWriter, StreamDigest,
    DEFAULT_QUICK_WINDOW,
};
use crate::error::Result;
use crate::evidence::EvidenceImage;
use crate::output::{OutputArea, RunHandle};
use crate::progress::{ProgressTracker, DEFAULT_REFRESH};
use crate::recover::sniff::mime_for_extension;
use crate::status::{CarveStatus, CarveStatusBoard};
use signatures::{builtin_signatures, HeaderGroup, SignatureCatalog, SignatureDescriptor, Structure};
use validate::{ContentValidator, Rejection, ValidationOptions, Verdict};

/// Global floor applied on top of per-format minimums
pub const DEFAULT_MIN_SIZE: u64 = 128;

/// Options for a carve operation
#[derive(Debug, Clone)]
pub struct CarveOptions {
    /// Output directory for carved files (emptied at run start)
    pub output_dir: PathBuf,
    /// Minimum file size to extract (skip tiny fragments)
    pub min_size: u64,
    /// Decode image candidates before accepting them
    pub decode_images: bool,
    /// Minimum interval between ETA recomputations
    pub eta_refresh: Duration,
    /// Head/tail window for the quick dedup key
    pub quick_window: usize,
    /// Per-format replacement for the catalog's size bound
    pub max_size_override: HashMap<String, u64>,
}

impl Default for CarveOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("carved"),
            min_size: DEFAULT_MIN_SIZE,
            decode_images: false,
            eta_refresh: DEFAULT_REFRESH,
            quick_window: DEFAULT_QUICK_WINDOW,
            max_size_override: HashMap::new(),
        }
    }
}

/// How a run ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Finished,
    /// A newer run took over the output directory
    Superseded,
}

/// Outcome of one header hit
enum Step {
    Continue,
    Superseded,
}

enum Persisted {
    Stored,
    Duplicate,
    Superseded,
}

/// Per-run mutable state, owned by the scanning thread
struct ScanState {
    handle: RunHandle,
    dedup: Deduplicator,
    tracker: ProgressTracker,
    counter: u64,
    /// Accepted MP3 regions; frame headers inside them are not new streams
    mp3_regions: Vec<(usize, usize)>,
}

impl ScanState {
    fn inside_mp3(&self, start: usize) -> bool {
        self.mp3_regions
            .iter()
            .any(|&(s, e)| start >= s && start < e)
    }
}

/// The file carver engine
pub struct Carver {
    options: CarveOptions,
    catalog: SignatureCatalog,
    validator: ContentValidator,
    output: OutputArea,
    status: Arc<CarveStatusBoard>,
    callback: Option<FileCallback>,
}

impl Carver {
    pub fn new(options: CarveOptions) -> Self {
        let mut descriptors = builtin_signatures();
        for desc in &mut descriptors {
            let bound = options
                .max_size_override
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(desc.name));
            if let Some((_, max_size)) = bound {
                desc.max_size = *max_size;
            }
        }

        Self {
            catalog: SignatureCatalog::new(descriptors),
            validator: ContentValidator::new(ValidationOptions {
                decode_images: options.decode_images,
            }),
            output: OutputArea::new(&options.output_dir),
            status: Arc::new(CarveStatusBoard::new()),
            callback: None,
            options,
        }
    }

    /// Register a hook run after each carved file is committed
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RecoveredFile) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn options(&self) -> &CarveOptions {
        &self.options
    }

    pub fn catalog(&self) -> &SignatureCatalog {
        &self.catalog
    }

    /// Live status for pollers
    pub fn status(&self) -> Arc<CarveStatusBoard> {
        Arc::clone(&self.status)
    }

    /// Carve `image_path` for the named formats (an empty selection means
    /// every format in the catalog).
    ///
    /// Never fails: errors land in the returned snapshot's `error` field.
    pub fn carve<I, S>(&self, image_path: &Path, formats: I) -> CarveStatus
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut selected: Vec<String> = formats
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        if selected.is_empty() {
            selected = self.catalog.names().map(str::to_string).collect();
        }

        let run_id = Uuid::new_v4();
        self.status.begin(run_id, 0);
        tracing::info!(
            %run_id,
            image = %image_path.display(),
            formats = selected.len(),
            output = %self.options.output_dir.display(),
            "Starting carve"
        );

        match self.run(image_path, &selected) {
            Ok(RunEnd::Finished) => {
                let snap = self.status.snapshot();
                tracing::info!(
                    %run_id,
                    files = snap.run.files_found,
                    duplicates = snap.run.validation.rejected_duplicate,
                    elapsed = %snap.run.times.elapsed,
                    "Carve complete"
                );
                snap
            }
            Ok(RunEnd::Superseded) => {
                tracing::debug!(%run_id, "Carve superseded by a newer run");
                self.status.snapshot()
            }
            Err(e) => {
                tracing::error!(%run_id, error = %e, "Carve failed");
                self.status.run().finish(Some(e.to_string()));
                self.status.snapshot()
            }
        }
    }

    fn run(&self, image_path: &Path, selected: &[String]) -> Result<RunEnd> {
        let handle = self.output.begin_run()?;
        let image = EvidenceImage::open(image_path)?;
        let data = image.as_bytes();
        let total = data.len() as u64;
        self.status.set_total_bytes(total);

        let groups = self.catalog.all_headers_for(selected);
        let work = total * groups.len() as u64;
        let mut scan = ScanState {
            handle,
            dedup: Deduplicator::new(self.options.quick_window),
            tracker: ProgressTracker::new(self.options.eta_refresh),
            counter: 0,
            mp3_regions: Vec::new(),
        };

        for (index, group) in groups.iter().enumerate() {
            let names: Vec<&str> = group.candidates.iter().map(|d| d.name).collect();
            self.status.set_format(&names.join("/"));
            let done_before = index as u64 * total;

            let finder = memmem::Finder::new(group.header);
            let mut pos = 0usize;
            while let Some(found) = finder.find(&data[pos..]) {
                let hit = pos + found;
                pos = hit + 1;
                let Some(start) = hit.checked_sub(group.header_offset) else {
                    continue;
                };

                if let Step::Superseded = self.try_hit(group, data, start, &mut scan) {
                    return Ok(RunEnd::Superseded);
                }

                let processed = done_before + hit as u64;
                self.status.set_position(start as u64, processed, work);
                if let Some(times) = scan.tracker.update(processed, work) {
                    self.status.run().set_times(times);
                }
            }
            self.status.set_position(total, done_before + total, work);
        }

        self.status.run().set_times(scan.tracker.finish());
        self.status.run().finish(None);
        Ok(RunEnd::Finished)
    }

    /// Try every format registered under the header at `start`
    fn try_hit(
        &self,
        group: &HeaderGroup<'_>,
        data: &[u8],
        start: usize,
        scan: &mut ScanState,
    ) -> Step {
        if group.candidates.iter().all(|d| d.structure == Structure::Mp3) && scan.inside_mp3(start) {
            return Step::Continue;
        }
        let stats = self.status.run().stats();
        stats.scanned();

        let mut undersized = false;
        for desc in &group.candidates {
            let end = match self.validator.validate(desc, data, start) {
                Ok(Verdict::Accept { end }) => end as usize,
                Ok(Verdict::Reject(reason)) => {
                    tracing::trace!(format = desc.name, offset = start, ?reason, "Candidate rejected");
                    undersized |= reason == Rejection::TooSmall;
                    continue;
                }
                Err(e) => {
                    tracing::debug!(format = desc.name, offset = start, error = %e, "Validation error");
                    continue;
                }
            };
            if ((end - start) as u64) < self.options.min_size {
                undersized = true;
                continue;
            }

            return match self.persist(desc, data, start, end, scan) {
                Ok(Persisted::Stored) | Ok(Persisted::Duplicate) => Step::Continue,
                Ok(Persisted::Superseded) => Step::Superseded,
                Err(e) => {
                    tracing::debug!(format = desc.name, offset = start, error = %e, "Skipping candidate");
                    stats.invalid();
                    Step::Continue
                }
            };
        }

        if undersized {
            stats.empty();
        } else {
            stats.invalid();
        }
        Step::Continue
    }

    fn persist(
        &self,
        desc: &SignatureDescriptor,
        data: &[u8],
        start: usize,
        end: usize,
        scan: &mut ScanState,
    ) -> Result<Persisted> {
        let stats = self.status.run().stats();
        let region = &data[start..end];
        let size = region.len() as u64;

        let quick = quick_key_for_slice(region, scan.dedup.window());
        if scan.dedup.is_quick_duplicate(&quick) {
            stats.duplicate();
            tracing::trace!(format = desc.name, offset = start, "Quick-key duplicate");
            return Ok(Persisted::Duplicate);
        }

        let (temp, file) = scan.handle.create_temp()?;
        let digest = match stream_out(region, file) {
            Ok(digest) => digest,
            Err(e) => {
                scan.handle.discard(&temp);
                return Err(e.into());
            }
        };

        if !scan.dedup.register(quick, digest.hash) {
            scan.handle.discard(&temp);
            stats.duplicate();
            tracing::trace!(format = desc.name, offset = start, "Full-hash duplicate");
            return Ok(Persisted::Duplicate);
        }

        let id = scan.counter + 1;
        let filename = format!(
            "{}-{:08x}-{}-{}{}",
            id,
            start,
            size,
            desc.file_tag(),
            desc.extension
        );
        let path = match scan.handle.commit(&temp, &filename) {
            Ok(Some(path)) => path,
            Ok(None) => return Ok(Persisted::Superseded),
            Err(e) => {
                scan.handle.discard(&temp);
                return Err(e.into());
            }
        };
        scan.counter = id;
        stats.recovered();

        if desc.structure == Structure::Mp3 {
            scan.mp3_regions.push((start, end));
        }

        let file = RecoveredFile {
            id,
            filename,
            path,
            offset: start as u64,
            size,
            quick_hash: quick.to_hex(),
            full_hash: full_hash_hex(&digest.hash),
            method: desc.name.to_string(),
            file_type: desc.file_type,
            mime: mime_for_extension(desc.extension),
            extension: desc.extension.to_string(),
            created_at: Utc::now(),
            source: None,
        };
        tracing::debug!(
            file = %file.filename,
            format = desc.name,
            offset = start,
            size,
            "Carved file"
        );
        self.status.run().push_file(file.clone());
        notify(self.callback.as_ref(), &file);
        Ok(Persisted::Stored)
    }
}

/// Write `region` through a hashing writer, returning its digest
fn stream_out(region: &[u8], file: std::fs::File) -> std::io::Result<StreamDigest> {
    let mut writer = HashingWriter::new(BufWriter::new(file));
    writer.write_all(region)?;
    let (_, digest) = writer.finish()?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carve::validate::mp3;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    fn jpeg_blob(len: usize, seed: u8) -> Vec<u8> {
        let mut blob = vec![0xFF, 0xD8, 0xFF, 0xE0];
        blob.extend((0..len - 6).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed) & 0x7F));
        blob.extend_from_slice(&[0xFF, 0xD9]);
        blob
    }

    fn write_image(dir: &TempDir, data: &[u8]) -> PathBuf {
        let path = dir.path().join("disk.img");
        std::fs::write(&path, data).unwrap();
        path
    }

    fn carver(dir: &TempDir) -> Carver {
        Carver::new(CarveOptions {
            output_dir: dir.path().join("carved"),
            ..Default::default()
        })
    }

    // =====================================================================
    // Naming and bookkeeping
    // =====================================================================

    #[test]
    fn carved_filename_embeds_counter_offset_size_and_tag() {
        let dir = tempdir().unwrap();
        let mut image = vec![0u8; 100];
        image.extend(jpeg_blob(2902, 1));
        image.resize(4000, 0);
        let path = write_image(&dir, &image);

        let status = carver(&dir).carve(&path, ["JPEG"]);
        assert!(status.run.complete);
        assert_eq!(status.run.error, None);
        assert_eq!(status.run.files.len(), 1);
        let file = &status.run.files[0];
        assert_eq!(file.filename, "1-00000064-2902-jpeg.jpeg");
        assert_eq!(file.method, "JPEG");
        assert_eq!(file.mime, "image/jpeg");
        assert!(file.path.exists());
        assert_eq!(status.run.validation.valid_recovered, 1);
        assert_eq!(status.run.progress, 100.0);
    }

    #[test]
    fn empty_selection_means_all_formats() {
        let dir = tempdir().unwrap();
        let mut image = jpeg_blob(3000, 2);
        image.resize(5000, 0);
        let path = write_image(&dir, &image);

        let status = carver(&dir).carve(&path, Vec::<String>::new());
        assert_eq!(status.run.files_found, 1);
    }

    #[test]
    fn missing_image_fails_the_run() {
        let dir = tempdir().unwrap();
        let status = carver(&dir).carve(&dir.path().join("nope.img"), ["JPEG"]);
        assert!(status.run.complete);
        assert!(!status.run.in_progress);
        assert!(status.run.error.unwrap().contains("nope.img"));
    }

    #[test]
    fn callback_sees_every_file_and_failures_are_ignored() {
        let dir = tempdir().unwrap();
        let mut image = jpeg_blob(2500, 3);
        image.extend(vec![0u8; 500]);
        image.extend(jpeg_blob(2600, 9));
        let path = write_image(&dir, &image);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let carver = carver(&dir).with_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("store unavailable")
        });
        let status = carver.carve(&path, ["jpeg"]);
        assert_eq!(status.run.files_found, 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn write_failure_skips_only_that_candidate() {
        let dir = tempdir().unwrap();
        let mut image = jpeg_blob(2500, 3);
        image.resize(3000, 0);
        image.extend(jpeg_blob(2600, 9));
        image.resize(6000, 0);
        image.extend(jpeg_blob(2700, 5));
        image.resize(9000, 0);
        let path = write_image(&dir, &image);

        // occupy the second file's final name with a non-empty directory
        let carver = carver(&dir).with_callback(|file: &RecoveredFile| {
            if file.id == 1 {
                let blocker = file.path.with_file_name("2-00000bb8-2600-jpeg.jpeg");
                std::fs::create_dir_all(blocker.join("inner"))?;
            }
            Ok(())
        });
        let status = carver.carve(&path, ["JPEG"]);

        assert!(status.run.complete);
        assert_eq!(status.run.error, None);
        let offsets: Vec<u64> = status.run.files.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 6000]);
        assert_eq!(status.run.files[1].filename, "2-00001770-2700-jpeg.jpeg");
        assert_eq!(status.run.validation.total_scanned, 3);
        assert_eq!(status.run.validation.rejected_invalid, 1);

        let partials = std::fs::read_dir(dir.path().join("carved"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with(".partial-"))
            .count();
        assert_eq!(partials, 0);
    }

    #[test]
    fn max_size_override_bounds_footer_search() {
        let dir = tempdir().unwrap();
        let mut image = jpeg_blob(3000, 4);
        image.resize(4000, 0);
        let path = write_image(&dir, &image);

        let mut overrides = HashMap::new();
        overrides.insert("jpeg".to_string(), 2500u64);
        let carver = Carver::new(CarveOptions {
            output_dir: dir.path().join("carved"),
            max_size_override: overrides,
            ..Default::default()
        });
        let status = carver.carve(&path, ["JPEG"]);
        assert_eq!(status.run.files_found, 0);
        assert_eq!(status.run.validation.rejected_invalid, 1);
    }

    // =====================================================================
    // Shared headers and nested streams
    // =====================================================================

    #[test]
    fn office_container_beats_generic_zip() {
        use crate::carve::validate::zip::build_stored_zip;
        let dir = tempdir().unwrap();
        let filler = vec![b'w'; 4096];
        let docx = build_stored_zip(&[
            ("[Content_Types].xml", b"<Types/>".as_slice()),
            ("word/document.xml", filler.as_slice()),
        ]);
        let mut image = vec![0u8; 64];
        image.extend(&docx);
        image.resize(image.len() + 256, 0);
        let path = write_image(&dir, &image);

        let status = carver(&dir).carve(&path, ["ZIP", "DOCX"]);
        assert_eq!(status.run.files.len(), 1);
        assert_eq!(status.run.files[0].method, "DOCX");
        assert_eq!(status.run.files[0].extension, ".docx");
    }

    #[test]
    fn frames_inside_an_accepted_stream_are_not_restarted() {
        let dir = tempdir().unwrap();
        let mut image = vec![0u8; 32];
        for _ in 0..20 {
            image.extend(mp3::frame(9, false));
        }
        image.resize(image.len() + 64, 0);
        let path = write_image(&dir, &image);

        let status = carver(&dir).carve(&path, ["MP3"]);
        assert_eq!(status.run.files.len(), 1);
        assert_eq!(status.run.files[0].offset, 32);
        assert_eq!(status.run.files[0].size, 20 * 417);
    }

    #[test]
    fn stale_run_stops_without_touching_output() {
        let dir = tempdir().unwrap();
        let carver = carver(&dir);
        let mut handle = carver.output.begin_run().unwrap();
        let (temp, _file) = handle.create_temp().unwrap();
        // a second run supersedes the first handle
        carver.output.begin_run().unwrap();
        assert!(handle.commit(&temp, "late.jpeg").unwrap().is_none());
        assert!(!carver.options.output_dir.join("late.jpeg").exists());
    }
}
