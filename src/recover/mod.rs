//! Filesystem recovery module - Deleted files from filesystem metadata
//!
//! Opens every partition of an image (or the whole image when there is no
//! table), then runs the recovery strategies one after another on each
//! filesystem. Every candidate goes through the same pipeline:
//!
//! 1. Size floor
//! 2. Quick key from head and tail reads
//! 3. Stream to a temp file through the hashing writer
//! 4. Wiped-content and full-hash checks
//! 5. Extension sniffing, commit, status and callback
//!
//! **Destructive:** every [`FilesystemRecoveryEngine::recover`] call starts
//! by emptying the output directory.

pub mod sniff;
pub mod strategies;

use std::io::{BufWriter, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::carve::signatures::SignatureCatalog;
use crate::core::{notify, FileCallback, FileType, RecoveredFile, SourceMetadata, Strategy};
use crate::dedup::{
    full_hash_hex, quick_key, quick_windows, Deduplicator, HashingWriter, StreamDigest,
    DEFAULT_QUICK_WINDOW,
};
use crate::error::{Error, Result};
use crate::evidence::EvidenceImage;
use crate::fs::{FileSystem, FsError, ImageSource, MetadataProvider, NativeProvider, Volume};
use crate::output::{OutputArea, RunHandle};
use crate::progress::{ProgressTracker, DEFAULT_REFRESH};
use crate::status::{RecoveryStatus, RecoveryStatusBoard};
use strategies::{Candidate, RecycleMatcher, Scope, DEFAULT_MAX_DEPTH, DEFAULT_RECYCLE_PATTERNS};

/// Candidates at or below this many bytes are rejected as empty
pub const DEFAULT_MIN_SIZE: u64 = 128;

const COPY_CHUNK: usize = 64 * 1024;
const PRIMARY_VOLUME: &str = "Primary Volume";

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Output directory (emptied at run start)
    pub output_dir: PathBuf,
    pub min_size: u64,
    /// Head/tail window for the quick dedup key
    pub quick_window: usize,
    /// Directory depth limit for tree walks
    pub max_depth: usize,
    /// Trash directory name patterns (regex, case-insensitive)
    pub recycle_patterns: Vec<String>,
    /// Strategies to run, in order
    pub strategies: Vec<Strategy>,
    pub eta_refresh: Duration,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recovered"),
            min_size: DEFAULT_MIN_SIZE,
            quick_window: DEFAULT_QUICK_WINDOW,
            max_depth: DEFAULT_MAX_DEPTH,
            recycle_patterns: DEFAULT_RECYCLE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            strategies: Strategy::ALL.to_vec(),
            eta_refresh: DEFAULT_REFRESH,
        }
    }
}

/// A filesystem opened for this run
struct Target {
    partition: usize,
    offset: u64,
    label: String,
    fs: Box<dyn FileSystem>,
}

enum RunEnd {
    Finished,
    Superseded,
}

enum Outcome {
    Stored,
    Rejected,
    Superseded,
}

struct RunState {
    handle: RunHandle,
    dedup: Deduplicator,
    counter: u64,
}

pub struct FilesystemRecoveryEngine {
    options: RecoveryOptions,
    provider: Arc<dyn MetadataProvider>,
    recycle: RecycleMatcher,
    output: OutputArea,
    status: Arc<RecoveryStatusBoard>,
    callback: Option<FileCallback>,
}

impl FilesystemRecoveryEngine {
    /// Engine backed by the built-in partition and filesystem parsers
    pub fn new(options: RecoveryOptions) -> Result<Self> {
        Self::with_provider(options, Arc::new(NativeProvider))
    }

    pub fn with_provider(
        options: RecoveryOptions,
        provider: Arc<dyn MetadataProvider>,
    ) -> Result<Self> {
        let recycle = RecycleMatcher::new(&options.recycle_patterns)?;
        Ok(Self {
            output: OutputArea::new(&options.output_dir),
            status: Arc::new(RecoveryStatusBoard::new()),
            callback: None,
            provider,
            recycle,
            options,
        })
    }

    /// Register a hook run after each recovered file is committed
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RecoveredFile) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn options(&self) -> &RecoveryOptions {
        &self.options
    }

    pub fn status(&self) -> Arc<RecoveryStatusBoard> {
        Arc::clone(&self.status)
    }

    /// Recover deleted files from the image at `image_path`.
    ///
    /// Never fails: a fatal error marks the returned snapshot `failed`.
    pub fn recover(&self, image_path: &Path) -> RecoveryStatus {
        let run_id = Uuid::new_v4();
        self.status.begin(run_id);
        tracing::info!(
            %run_id,
            image = %image_path.display(),
            output = %self.options.output_dir.display(),
            "Starting deleted file recovery"
        );

        match self.run(image_path) {
            Ok(RunEnd::Finished) => {
                let snap = self.status.snapshot();
                tracing::info!(
                    %run_id,
                    files = snap.run.files_found,
                    scanned = snap.run.validation.total_scanned,
                    duplicates = snap.run.validation.rejected_duplicate,
                    elapsed = %snap.run.times.elapsed,
                    "Recovery complete"
                );
                snap
            }
            Ok(RunEnd::Superseded) => {
                tracing::debug!(%run_id, "Recovery superseded by a newer run");
                self.status.snapshot()
            }
            Err(e) => {
                tracing::error!(%run_id, error = %e, "Recovery failed");
                self.status.fail(e.to_string());
                self.status.snapshot()
            }
        }
    }

    fn run(&self, image_path: &Path) -> Result<RunEnd> {
        let handle = self.output.begin_run()?;
        let image: Arc<dyn ImageSource> = Arc::new(EvidenceImage::open(image_path)?);

        self.status.set_message("Reading partition table");
        let targets = self.open_targets(&image)?;

        let steps = (targets.len() * self.options.strategies.len()) as u64;
        let mut tracker = ProgressTracker::new(self.options.eta_refresh);
        let mut state = RunState {
            handle,
            dedup: Deduplicator::new(self.options.quick_window),
            counter: 0,
        };

        let mut step = 0u64;
        for target in &targets {
            self.status.set_partition(&target.label);
            for &strategy in &self.options.strategies {
                self.status.set_strategy(Some(strategy));
                self.status
                    .set_message(format!("Running {} on {}", strategy, target.label));
                tracing::debug!(partition = %target.label, %strategy, "Running strategy");

                let scope = Scope {
                    fs: target.fs.as_ref(),
                    min_size: self.options.min_size,
                    max_depth: self.options.max_depth,
                    recycle: &self.recycle,
                };
                let flow = strategies::run(strategy, &scope, &mut |candidate: Candidate| {
                    self.process(&mut state, target, candidate)
                });
                if flow.is_break() {
                    return Ok(RunEnd::Superseded);
                }

                step += 1;
                self.status.run().set_progress(step, steps);
                if let Some(times) = tracker.update(step, steps) {
                    self.status.run().set_times(times);
                }
            }
        }

        self.status.set_strategy(None);
        self.status.run().set_times(tracker.finish());
        self.status.set_message(format!(
            "Recovery complete: {} files recovered",
            self.status.run().files_found()
        ));
        self.status.run().finish(None);
        Ok(RunEnd::Finished)
    }

    /// Open a filesystem on every partition, falling back to offset 0
    fn open_targets(&self, image: &Arc<dyn ImageSource>) -> Result<Vec<Target>> {
        let partitions = self.provider.partitions(image);
        let mut labels: Vec<String> = partitions.iter().map(|p| p.label()).collect();
        if partitions.is_empty() {
            labels.push(PRIMARY_VOLUME.to_string());
        }
        self.status.set_partitions(labels);

        let mut targets = Vec::new();
        for partition in &partitions {
            let label = partition.label();
            let volume = Volume::new(Arc::clone(image), partition.offset, partition.len);
            if let Some(target) = self.open_target(partition.index, label, volume) {
                targets.push(target);
            }
        }

        if targets.is_empty() {
            let volume = Volume::at(Arc::clone(image), 0);
            if let Some(target) = self.open_target(0, PRIMARY_VOLUME.to_string(), volume) {
                targets.push(target);
            }
        }

        if targets.is_empty() {
            return Err(Error::NoFilesystem);
        }
        Ok(targets)
    }

    fn open_target(&self, partition: usize, label: String, volume: Volume) -> Option<Target> {
        let offset = volume.offset();
        self.status.set_partition(&label);
        match self.provider.open_filesystem(volume) {
            Ok(fs) => {
                tracing::info!(partition = %label, kind = %fs.kind(), "Opened filesystem");
                Some(Target {
                    partition,
                    offset,
                    label,
                    fs,
                })
            }
            Err(e) => {
                tracing::warn!(partition = %label, error = %e, "Cannot open filesystem");
                None
            }
        }
    }

    /// Run one candidate through the pipeline; only a superseded run stops the walk
    fn process(&self, state: &mut RunState, target: &Target, candidate: Candidate) -> ControlFlow<()> {
        match self.recover_candidate(state, target, &candidate) {
            Ok(Outcome::Superseded) => ControlFlow::Break(()),
            Ok(Outcome::Stored) | Ok(Outcome::Rejected) => ControlFlow::Continue(()),
            Err(e) => {
                tracing::debug!(
                    strategy = %candidate.strategy,
                    inode = candidate.entry.inode,
                    path = %candidate.entry.path,
                    error = %e,
                    "Skipping candidate"
                );
                self.status.push_error(format!(
                    "{}: inode {} on {}: {}",
                    candidate.strategy, candidate.entry.inode, target.label, e
                ));
                ControlFlow::Continue(())
            }
        }
    }

    fn recover_candidate(
        &self,
        state: &mut RunState,
        target: &Target,
        candidate: &Candidate,
    ) -> Result<Outcome> {
        let stats = self.status.run().stats();
        stats.scanned();

        let fs = target.fs.as_ref();
        let size = candidate.len();
        if size <= self.options.min_size {
            stats.empty();
            return Ok(Outcome::Rejected);
        }

        let ((h0, h1), (t0, t1)) = quick_windows(size, state.dedup.window());
        let head = read_range(fs, candidate, h0, h1)?;
        let tail = read_range(fs, candidate, t0, t1)?;
        let quick = quick_key(size, &head, &tail);
        if state.dedup.is_quick_duplicate(&quick) {
            stats.duplicate();
            return Ok(Outcome::Rejected);
        }

        let (temp, file) = state.handle.create_temp()?;
        let digest = match copy_out(fs, candidate, size, file) {
            Ok(digest) => digest,
            Err(e) => {
                state.handle.discard(&temp);
                return Err(e);
            }
        };
        if digest.all_zero {
            state.handle.discard(&temp);
            stats.invalid();
            tracing::trace!(inode = candidate.entry.inode, "Wiped content");
            return Ok(Outcome::Rejected);
        }
        if !state.dedup.register(quick, digest.hash) {
            state.handle.discard(&temp);
            stats.duplicate();
            return Ok(Outcome::Rejected);
        }

        let detected = sniff::detect(&head, candidate.original_name(), SignatureCatalog::builtin());
        let id = state.counter + 1;
        let filename = format!("deleted_files_recovery_{:04}{}", id, detected.extension);
        let Some(path) = state.handle.commit(&temp, &filename)? else {
            return Ok(Outcome::Superseded);
        };
        state.counter = id;
        stats.recovered();
        self.status.count_strategy(candidate.strategy);

        let entry = &candidate.entry;
        let volume_offset = fs.volume().offset();
        let file = RecoveredFile {
            id,
            filename,
            path,
            offset: volume_offset + candidate.volume_offset().unwrap_or(0),
            size,
            quick_hash: quick.to_hex(),
            full_hash: full_hash_hex(&digest.hash),
            method: candidate.strategy.as_str().to_string(),
            file_type: FileType::from_extension(&detected.extension),
            mime: detected.mime,
            extension: detected.extension,
            created_at: Utc::now(),
            source: Some(SourceMetadata {
                partition: target.partition,
                partition_offset: target.offset,
                inode: Some(entry.inode),
                original_name: (!entry.name.is_empty()).then(|| entry.name.clone()),
                original_path: (!entry.path.is_empty()).then(|| entry.path.clone()),
                modified: entry.modified,
                accessed: entry.accessed,
                created: entry.created,
                changed: entry.changed,
                deleted: entry.deleted,
            }),
        };
        tracing::debug!(
            file = %file.filename,
            strategy = %candidate.strategy,
            inode = entry.inode,
            size,
            "Recovered file"
        );
        self.status.run().push_file(file.clone());
        notify(self.callback.as_ref(), &file);
        Ok(Outcome::Stored)
    }
}

/// Read `[from, to)` of the candidate in full
fn read_range(fs: &dyn FileSystem, candidate: &Candidate, from: u64, to: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; (to - from) as usize];
    let mut done = 0usize;
    while done < buf.len() {
        let n = candidate.read_at(fs, from + done as u64, &mut buf[done..])?;
        if n == 0 {
            return Err(short_read(from + done as u64));
        }
        done += n;
    }
    Ok(buf)
}

/// Stream the candidate into `file`, hashing as it goes
fn copy_out(
    fs: &dyn FileSystem,
    candidate: &Candidate,
    size: u64,
    file: std::fs::File,
) -> Result<StreamDigest> {
    let mut writer = HashingWriter::new(BufWriter::new(file));
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut pos = 0u64;
    while pos < size {
        let want = ((size - pos) as usize).min(buf.len());
        let n = candidate.read_at(fs, pos, &mut buf[..want])?;
        if n == 0 {
            return Err(short_read(pos));
        }
        writer.write_all(&buf[..n])?;
        pos += n as u64;
    }
    let (_, digest) = writer.finish()?;
    Ok(digest)
}

fn short_read(at: u64) -> Error {
    Error::Fs(FsError::corrupt("extent", format!("data ends early at {}", at)))
}
