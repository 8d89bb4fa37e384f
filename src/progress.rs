//! Elapsed / remaining time estimation for long scans.
//!
//! Estimates come from overall progress rather than instantaneous rate:
//! `estimated_total = elapsed / fraction_done`, `remaining = estimated_total
//! - elapsed`, floored at zero. Recomputation is throttled so the scanning
//! loop can call [`ProgressTracker::update`] as often as it likes.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Default minimum interval between estimate refreshes
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(2);

/// Shown while no estimate is possible yet
pub const UNKNOWN: &str = "---";

/// Human-readable timing strings published to status records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEstimate {
    pub elapsed: String,
    pub estimated_total: String,
    pub remaining: String,
}

impl Default for TimeEstimate {
    fn default() -> Self {
        Self {
            elapsed: format_duration(Duration::ZERO),
            estimated_total: UNKNOWN.to_string(),
            remaining: UNKNOWN.to_string(),
        }
    }
}

/// `(estimated_total, remaining)` for `done` of `total` units after `elapsed`.
///
/// `None` until some progress has been made.
pub fn estimate(elapsed: Duration, done: u64, total: u64) -> Option<(Duration, Duration)> {
    if done == 0 || total == 0 {
        return None;
    }
    let fraction = (done as f64 / total as f64).min(1.0);
    let estimated_total = Duration::from_secs_f64(elapsed.as_secs_f64() / fraction);
    let remaining = estimated_total.saturating_sub(elapsed);
    Some((estimated_total, remaining))
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    started: Instant,
    refresh: Duration,
    last_refresh: Option<Instant>,
    current: TimeEstimate,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH)
    }
}

impl ProgressTracker {
    pub fn new(refresh: Duration) -> Self {
        Self {
            started: Instant::now(),
            refresh,
            last_refresh: None,
            current: TimeEstimate::default(),
        }
    }

    /// Restart the clock for a new run
    pub fn restart(&mut self) {
        self.started = Instant::now();
        self.last_refresh = None;
        self.current = TimeEstimate::default();
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn current(&self) -> &TimeEstimate {
        &self.current
    }

    /// Recompute if the refresh interval has passed. Returns the new
    /// estimate when it changed.
    pub fn update(&mut self, done: u64, total: u64) -> Option<&TimeEstimate> {
        self.update_at(Instant::now(), done, total)
    }

    pub fn update_at(&mut self, now: Instant, done: u64, total: u64) -> Option<&TimeEstimate> {
        if let Some(last) = self.last_refresh {
            if now.saturating_duration_since(last) < self.refresh {
                return None;
            }
        }
        self.last_refresh = Some(now);
        let elapsed = now.saturating_duration_since(self.started);
        self.current = match estimate(elapsed, done, total) {
            Some((estimated_total, remaining)) => TimeEstimate {
                elapsed: format_duration(elapsed),
                estimated_total: format_duration(estimated_total),
                remaining: format_duration(remaining),
            },
            None => TimeEstimate {
                elapsed: format_duration(elapsed),
                ..TimeEstimate::default()
            },
        };
        Some(&self.current)
    }

    /// Final figures: total equals elapsed, nothing remaining.
    pub fn finish(&mut self) -> &TimeEstimate {
        let elapsed = format_duration(self.elapsed());
        self.current = TimeEstimate {
            estimated_total: elapsed.clone(),
            elapsed,
            remaining: format_duration(Duration::ZERO),
        };
        &self.current
    }
}

/// Format duration for display
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
