//! Live status records for running engines.
//!
//! Each board has one writer (the engine's worker thread) and any number of
//! pollers. Counters are relaxed atomics and strings sit behind short-lived
//! `parking_lot` locks, so a poller never blocks the scan for longer than a
//! clone. Fields are updated independently: a snapshot may show
//! `files_found` bumped before `current_offset` moves. That is fine for
//! display and must not drive decisions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{format_offset, RecoveredFile, Strategy};
use crate::progress::TimeEstimate;

/// Most recent per-candidate error messages kept for display
pub const MAX_ERRORS: usize = 100;

// ============================================================================
// Validation tallies
// ============================================================================

#[derive(Debug, Default)]
pub struct ValidationCounters {
    total_scanned: AtomicU64,
    rejected_empty: AtomicU64,
    rejected_duplicate: AtomicU64,
    rejected_invalid: AtomicU64,
    valid_recovered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStats {
    pub total_scanned: u64,
    pub rejected_empty: u64,
    pub rejected_duplicate: u64,
    pub rejected_invalid: u64,
    pub valid_recovered: u64,
}

impl ValidationCounters {
    pub fn reset(&self) {
        for counter in [
            &self.total_scanned,
            &self.rejected_empty,
            &self.rejected_duplicate,
            &self.rejected_invalid,
            &self.valid_recovered,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn scanned(&self) {
        self.total_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn empty(&self) {
        self.rejected_empty.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate(&self) {
        self.rejected_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalid(&self) {
        self.rejected_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recovered(&self) {
        self.valid_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ValidationStats {
        ValidationStats {
            total_scanned: self.total_scanned.load(Ordering::Relaxed),
            rejected_empty: self.rejected_empty.load(Ordering::Relaxed),
            rejected_duplicate: self.rejected_duplicate.load(Ordering::Relaxed),
            rejected_invalid: self.rejected_invalid.load(Ordering::Relaxed),
            valid_recovered: self.valid_recovered.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Shared run state
// ============================================================================

/// Fields every engine run publishes
#[derive(Debug, Default)]
pub struct RunState {
    run_id: RwLock<Option<Uuid>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    in_progress: AtomicBool,
    complete: AtomicBool,
    /// Hundredths of a percent
    progress: AtomicU32,
    files_found: AtomicU64,
    times: RwLock<TimeEstimate>,
    error: RwLock<Option<String>>,
    files: RwLock<Vec<RecoveredFile>>,
    stats: ValidationCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub in_progress: bool,
    pub complete: bool,
    pub error: Option<String>,
    /// Percent complete, 0.0 to 100.0
    pub progress: f64,
    pub files_found: u64,
    #[serde(flatten)]
    pub times: TimeEstimate,
    pub validation: ValidationStats,
    #[serde(rename = "found_files")]
    pub files: Vec<RecoveredFile>,
}

impl RunState {
    /// Reset everything for a fresh run
    pub fn begin(&self, run_id: Uuid) {
        *self.run_id.write() = Some(run_id);
        *self.started_at.write() = Some(Utc::now());
        *self.times.write() = TimeEstimate::default();
        *self.error.write() = None;
        self.files.write().clear();
        self.stats.reset();
        self.files_found.store(0, Ordering::Relaxed);
        self.progress.store(0, Ordering::Relaxed);
        self.complete.store(false, Ordering::Relaxed);
        self.in_progress.store(true, Ordering::Release);
    }

    pub fn run_id(&self) -> Option<Uuid> {
        *self.run_id.read()
    }

    pub fn stats(&self) -> &ValidationCounters {
        &self.stats
    }

    pub fn set_progress(&self, done: u64, total: u64) {
        let permyriad = if total == 0 {
            0
        } else {
            ((done.min(total) as u128 * 10_000) / total as u128) as u32
        };
        self.progress.store(permyriad, Ordering::Relaxed);
    }

    pub fn set_times(&self, times: &TimeEstimate) {
        *self.times.write() = times.clone();
    }

    pub fn push_file(&self, file: RecoveredFile) {
        self.files.write().push(file);
        self.files_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn files_found(&self) -> u64 {
        self.files_found.load(Ordering::Relaxed)
    }

    /// Mark the run finished; an error message marks it failed.
    pub fn finish(&self, error: Option<String>) {
        let ok = error.is_none();
        *self.error.write() = error;
        if ok {
            self.progress.store(10_000, Ordering::Relaxed);
        }
        self.in_progress.store(false, Ordering::Relaxed);
        self.complete.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: *self.run_id.read(),
            started_at: *self.started_at.read(),
            in_progress: self.in_progress.load(Ordering::Acquire),
            complete: self.complete.load(Ordering::Acquire),
            error: self.error.read().clone(),
            progress: self.progress.load(Ordering::Relaxed) as f64 / 100.0,
            files_found: self.files_found.load(Ordering::Relaxed),
            times: self.times.read().clone(),
            validation: self.stats.snapshot(),
            files: self.files.read().clone(),
        }
    }
}

// ============================================================================
// Carver
// ============================================================================

#[derive(Debug, Default)]
pub struct CarveStatusBoard {
    run: RunState,
    current_offset: AtomicU64,
    bytes_processed: AtomicU64,
    total_bytes: AtomicU64,
    current_format: RwLock<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarveStatus {
    #[serde(flatten)]
    pub run: RunSnapshot,
    /// Formatted `0x%08X`
    pub current_offset: String,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    pub current_format: String,
}

impl CarveStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&self) -> &RunState {
        &self.run
    }

    pub fn begin(&self, run_id: Uuid, total_bytes: u64) {
        self.run.begin(run_id);
        self.current_offset.store(0, Ordering::Relaxed);
        self.bytes_processed.store(0, Ordering::Relaxed);
        self.total_bytes.store(total_bytes, Ordering::Relaxed);
        self.current_format.write().clear();
    }

    pub fn set_total_bytes(&self, total: u64) {
        self.total_bytes.store(total, Ordering::Relaxed);
    }

    pub fn set_format(&self, name: &str) {
        let mut current = self.current_format.write();
        current.clear();
        current.push_str(name);
    }

    /// Record scan position. `processed` counts bytes scanned across all
    /// header passes so far, out of `work` in total.
    pub fn set_position(&self, offset: u64, processed: u64, work: u64) {
        self.current_offset.store(offset, Ordering::Relaxed);
        self.bytes_processed.store(processed, Ordering::Relaxed);
        self.run.set_progress(processed, work);
    }

    pub fn snapshot(&self) -> CarveStatus {
        CarveStatus {
            run: self.run.snapshot(),
            current_offset: format_offset(self.current_offset.load(Ordering::Relaxed)),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            current_format: self.current_format.read().clone(),
        }
    }
}

// ============================================================================
// Filesystem recovery
// ============================================================================

#[derive(Debug, Default)]
pub struct RecoveryStatusBoard {
    run: RunState,
    failed: AtomicBool,
    message: RwLock<String>,
    current_partition: RwLock<String>,
    current_strategy: RwLock<Option<Strategy>>,
    partitions: RwLock<Vec<String>>,
    strategy_counts: [AtomicU64; 4],
    errors: RwLock<VecDeque<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStatus {
    #[serde(flatten)]
    pub run: RunSnapshot,
    pub failed: bool,
    pub message: String,
    pub current_partition: String,
    pub current_strategy: Option<Strategy>,
    pub partitions: Vec<String>,
    /// Files recovered per strategy tag
    pub strategy_counts: BTreeMap<String, u64>,
    pub errors: Vec<String>,
}

fn strategy_slot(strategy: Strategy) -> usize {
    match strategy {
        Strategy::DirectoryWalk => 0,
        Strategy::InodeScan => 1,
        Strategy::FileSlack => 2,
        Strategy::RecycleBin => 3,
    }
}

impl RecoveryStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&self) -> &RunState {
        &self.run
    }

    pub fn begin(&self, run_id: Uuid) {
        self.run.begin(run_id);
        self.failed.store(false, Ordering::Relaxed);
        for count in &self.strategy_counts {
            count.store(0, Ordering::Relaxed);
        }
        self.current_partition.write().clear();
        *self.current_strategy.write() = None;
        self.partitions.write().clear();
        self.errors.write().clear();
        self.set_message("Starting deleted file recovery");
    }

    pub fn set_message(&self, message: impl Into<String>) {
        *self.message.write() = message.into();
    }

    pub fn set_partitions(&self, descriptions: Vec<String>) {
        *self.partitions.write() = descriptions;
    }

    pub fn set_partition(&self, description: &str) {
        *self.current_partition.write() = description.to_string();
    }

    pub fn set_strategy(&self, strategy: Option<Strategy>) {
        *self.current_strategy.write() = strategy;
    }

    pub fn count_strategy(&self, strategy: Strategy) {
        self.strategy_counts[strategy_slot(strategy)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn strategy_count(&self, strategy: Strategy) -> u64 {
        self.strategy_counts[strategy_slot(strategy)].load(Ordering::Relaxed)
    }

    pub fn push_error(&self, message: impl Into<String>) {
        let mut errors = self.errors.write();
        if errors.len() == MAX_ERRORS {
            errors.pop_front();
        }
        errors.push_back(message.into());
    }

    /// Mark the run failed with a fatal error
    pub fn fail(&self, error: String) {
        self.failed.store(true, Ordering::Relaxed);
        self.set_message(format!("Recovery failed: {}", error));
        self.run.finish(Some(error));
    }

    pub fn snapshot(&self) -> RecoveryStatus {
        let strategy_counts = Strategy::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), self.strategy_count(*s)))
            .collect();
        RecoveryStatus {
            run: self.run.snapshot(),
            failed: self.failed.load(Ordering::Relaxed),
            message: self.message.read().clone(),
            current_partition: self.current_partition.read().clone(),
            current_strategy: *self.current_strategy.read(),
            partitions: self.partitions.read().clone(),
            strategy_counts,
            errors: self.errors.read().iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_reset_on_begin() {
        let board = CarveStatusBoard::new();
        board.run().stats().scanned();
        board.run().stats().duplicate();
        board.begin(Uuid::new_v4(), 1000);

        let snap = board.snapshot();
        assert_eq!(snap.run.validation, ValidationStats::default());
        assert!(snap.run.in_progress);
        assert!(!snap.run.complete);
        assert_eq!(snap.total_bytes, 1000);
    }

    #[test]
    fn position_drives_percent_and_offset() {
        let board = CarveStatusBoard::new();
        board.begin(Uuid::new_v4(), 4000);
        board.set_position(100, 1000, 4000);

        let snap = board.snapshot();
        assert_eq!(snap.current_offset, "0x00000064");
        assert!((snap.run.progress - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn finish_with_error_keeps_progress() {
        let board = CarveStatusBoard::new();
        board.begin(Uuid::new_v4(), 100);
        board.set_position(10, 10, 100);
        board.run().finish(Some("mmap failed".into()));

        let snap = board.snapshot();
        assert!(snap.run.complete);
        assert!(!snap.run.in_progress);
        assert_eq!(snap.run.error.as_deref(), Some("mmap failed"));
        assert!((snap.run.progress - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn error_list_is_bounded() {
        let board = RecoveryStatusBoard::new();
        board.begin(Uuid::new_v4());
        for i in 0..(MAX_ERRORS + 5) {
            board.push_error(format!("error {}", i));
        }
        let snap = board.snapshot();
        assert_eq!(snap.errors.len(), MAX_ERRORS);
        assert_eq!(snap.errors[0], "error 5");
    }

    #[test]
    fn strategy_tallies_are_keyed_by_tag() {
        let board = RecoveryStatusBoard::new();
        board.begin(Uuid::new_v4());
        board.count_strategy(Strategy::InodeScan);
        board.count_strategy(Strategy::InodeScan);
        board.count_strategy(Strategy::RecycleBin);

        let snap = board.snapshot();
        assert_eq!(snap.strategy_counts["inode_scan"], 2);
        assert_eq!(snap.strategy_counts["recycle_bin"], 1);
        assert_eq!(snap.strategy_counts["directory_walk"], 0);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let board = RecoveryStatusBoard::new();
        board.begin(Uuid::new_v4());
        board.fail("no valid filesystem found".into());

        let json = serde_json::to_value(board.snapshot()).unwrap();
        assert_eq!(json["complete"], true);
        assert_eq!(json["failed"], true);
        assert_eq!(json["error"], "no valid filesystem found");
        assert!(json["remaining"].is_string());
        assert!(json["validation"]["total_scanned"].is_u64());
    }
}
