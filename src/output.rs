//! Output area for recovered files.
//!
//! **Destructive:** [`OutputArea::begin_run`] deletes everything already in
//! the output directory. Results never accumulate across runs.
//!
//! Each run gets a generation number. Files are written to a `.partial`
//! temp name and only renamed into place by [`RunHandle::commit`], which
//! first checks that its generation is still the newest. A run abandoned in
//! favour of a newer one therefore cannot leave files behind in the new
//! run's directory: its commits turn into deletes.
//!
//! Generations are counted per canonical directory across the whole
//! process, so two engines aimed at the same directory supersede each
//! other. Separate processes sharing a directory are not coordinated.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{Error, Result};

const PARTIAL_PREFIX: &str = ".partial-";

/// The process-wide generation counter for a canonical directory
fn shared_generation(canonical: &Path) -> Arc<AtomicU64> {
    static COUNTERS: OnceLock<Mutex<HashMap<PathBuf, Arc<AtomicU64>>>> = OnceLock::new();
    let mut counters = COUNTERS.get_or_init(Default::default).lock();
    Arc::clone(counters.entry(canonical.to_path_buf()).or_default())
}

/// A directory an engine writes its results into
#[derive(Debug, Clone)]
pub struct OutputArea {
    root: PathBuf,
}

impl OutputArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Newest generation started on this directory, 0 before any run
    pub fn current_generation(&self) -> u64 {
        fs::canonicalize(&self.root)
            .map(|canonical| shared_generation(&canonical).load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Start a new run: invalidate older handles, then empty the directory.
    pub fn begin_run(&self) -> Result<RunHandle> {
        if self.root.parent().is_none() || self.root.as_os_str().is_empty() {
            return Err(Error::UnsafeOutputDir(self.root.clone()));
        }
        let map_err = |source| Error::OutputDir {
            path: self.root.clone(),
            source,
        };
        fs::create_dir_all(&self.root).map_err(map_err)?;
        let latest = shared_generation(&fs::canonicalize(&self.root).map_err(map_err)?);
        let generation = latest.fetch_add(1, Ordering::AcqRel) + 1;

        let mut removed = 0usize;
        for entry in fs::read_dir(&self.root).map_err(map_err)? {
            let entry = entry.map_err(map_err)?;
            let path = entry.path();
            if entry.file_type().map_err(map_err)?.is_dir() {
                fs::remove_dir_all(&path).map_err(map_err)?;
            } else {
                fs::remove_file(&path).map_err(map_err)?;
            }
            removed += 1;
        }

        tracing::debug!(
            output = %self.root.display(),
            generation,
            removed,
            "Cleared output directory"
        );

        Ok(RunHandle {
            root: self.root.clone(),
            generation,
            latest,
            temp_seq: 0,
        })
    }
}

/// Write access to the output area for one run
#[derive(Debug)]
pub struct RunHandle {
    root: PathBuf,
    generation: u64,
    latest: Arc<AtomicU64>,
    temp_seq: u64,
}

impl RunHandle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once a newer run has started on the same area
    pub fn is_current(&self) -> bool {
        self.latest.load(Ordering::Acquire) == self.generation
    }

    /// Create a fresh temp file for streaming a candidate out.
    pub fn create_temp(&mut self) -> io::Result<(PathBuf, File)> {
        self.temp_seq += 1;
        let path = self.root.join(format!(
            "{}{}-{}",
            PARTIAL_PREFIX, self.generation, self.temp_seq
        ));
        let file = File::create(&path)?;
        Ok((path, file))
    }

    /// Move a finished temp file to its final name.
    ///
    /// Returns `None` (after deleting the temp file) when this run has been
    /// superseded.
    pub fn commit(&self, temp: &Path, name: &str) -> io::Result<Option<PathBuf>> {
        if !self.is_current() {
            self.discard(temp);
            return Ok(None);
        }
        let dest = self.root.join(name);
        fs::rename(temp, &dest)?;
        Ok(Some(dest))
    }

    /// Delete a temp file, ignoring one that is already gone.
    pub fn discard(&self, temp: &Path) {
        if let Err(e) = fs::remove_file(temp) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %temp.display(), error = %e, "Failed to remove temp file");
            }
        }
    }
}
