//! Progress tracking for long-running bulk runs.
//!
//! The tracker observes terminal results and keeps running counts, the
//! lifetime throughput, and a trailing-window throughput that drives the
//! ETA. It never influences scheduling. Methods ending in `_at` take an
//! explicit instant so callers and tests control the clock.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::TerminalResult;

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TRAILING_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_PERCENTAGE_STEP: f64 = 10.0;

/// Running counts and throughput for one run.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_expected: Option<u64>,
    succeeded: u64,
    failed: u64,
    skipped: u64,
    start_time: Instant,
    recent: VecDeque<Instant>,
    trailing_window: Duration,
    last_update: Instant,
    update_interval: Duration,
    last_reported_percentage: f64,
    min_percentage_step: f64,
}

/// Point-in-time view of a tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Items that finished (success or error)
    pub completed: u64,
    /// Successful items
    pub succeeded: u64,
    /// Failed items
    pub failed: u64,
    /// Items skipped as already recorded or duplicate
    pub skipped: u64,
    /// Expected total, if known
    pub total_expected: Option<u64>,
    /// Time since the tracker started
    pub elapsed: Duration,
    /// Completions per second since start
    pub lifetime_rate: f64,
    /// Completions per second over the trailing window
    pub trailing_rate: f64,
    /// Estimated time remaining
    pub eta: Option<Duration>,
}

impl ProgressTracker {
    /// Create a tracker with custom cadence and trailing window.
    pub fn new(update_interval: Duration, min_percentage_step: f64, trailing_window: Duration) -> Self {
        let now = Instant::now();
        Self {
            total_expected: None,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            start_time: now,
            recent: VecDeque::new(),
            trailing_window,
            last_update: now,
            update_interval,
            last_reported_percentage: 0.0,
            min_percentage_step,
        }
    }

    /// Set the expected number of items, if known up front.
    pub fn with_total(mut self, total_expected: Option<u64>) -> Self {
        self.total_expected = total_expected;
        self
    }

    /// Restart the clock at `now`.
    pub fn restart_at(&mut self, now: Instant) {
        self.start_time = now;
        self.last_update = now;
        self.recent.clear();
    }

    /// Record a terminal result.
    pub fn observe(&mut self, result: &TerminalResult) {
        self.observe_at(result, Instant::now());
    }

    /// Record a terminal result completed at `now`.
    pub fn observe_at(&mut self, result: &TerminalResult, now: Instant) {
        if result.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.recent.push_back(now);
        self.evict(now);
    }

    /// Count items skipped without execution.
    pub fn record_skipped(&mut self, count: u64) {
        self.skipped = self.skipped.saturating_add(count);
    }

    /// Items that reached a terminal result in this run.
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Successful items.
    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    /// Failed items.
    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Skipped items.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Completion percentage (0-100), when the total is known.
    pub fn percentage(&self) -> Option<f64> {
        let total = self.total_expected?;
        if total == 0 {
            return Some(100.0);
        }
        let done = self.completed() + self.skipped;
        Some((done as f64 / total as f64 * 100.0).min(100.0))
    }

    /// Completions per second since start.
    pub fn lifetime_rate_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.start_time).as_secs_f64();
        if elapsed > 0.0 {
            self.completed() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Completions per second over the trailing window ending at `now`.
    pub fn trailing_rate_at(&self, now: Instant) -> f64 {
        let span = now
            .saturating_duration_since(self.start_time)
            .min(self.trailing_window)
            .as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        let in_window = self
            .recent
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.trailing_window)
            .count();
        in_window as f64 / span
    }

    /// Estimated time remaining from the trailing rate.
    pub fn estimate_remaining_at(&self, now: Instant) -> Option<Duration> {
        let total = self.total_expected?;
        let remaining = total.saturating_sub(self.completed() + self.skipped);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        let rate = self.trailing_rate_at(now);
        if rate > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / rate))
        } else {
            None
        }
    }

    /// Whether a progress line should be emitted based on time or percentage.
    pub fn should_emit_update_at(&self, now: Instant) -> bool {
        if self.completed() == 0 {
            return false;
        }

        let percentage_jump = self
            .percentage()
            .map(|pct| pct - self.last_reported_percentage >= self.min_percentage_step)
            .unwrap_or(false);

        percentage_jump || now.saturating_duration_since(self.last_update) >= self.update_interval
    }

    /// Call after emitting a progress line to reset timers and cached percentage.
    pub fn mark_emitted_at(&mut self, now: Instant) {
        self.last_update = now;
        if let Some(pct) = self.percentage() {
            self.last_reported_percentage = pct;
        }
    }

    /// Point-in-time view.
    pub fn snapshot_at(&self, now: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed(),
            succeeded: self.succeeded,
            failed: self.failed,
            skipped: self.skipped,
            total_expected: self.total_expected,
            elapsed: now.saturating_duration_since(self.start_time),
            lifetime_rate: self.lifetime_rate_at(now),
            trailing_rate: self.trailing_rate_at(now),
            eta: self.estimate_remaining_at(now),
        }
    }

    /// Human-readable progress line for logging.
    pub fn format_progress_at(&self, now: Instant) -> String {
        let mut parts = vec![format!(
            "[PROGRESS] {} done ({} ok, {} error)",
            self.completed(),
            self.succeeded,
            self.failed
        )];

        if let Some(total) = self.total_expected {
            parts.push(format!("of {total}"));
        }
        if let Some(pct) = self.percentage() {
            parts.push(format!("- {pct:.1}% complete"));
        }
        if self.skipped > 0 {
            parts.push(format!("({} skipped)", self.skipped));
        }

        let rate = self.trailing_rate_at(now);
        if rate > 0.0 {
            parts.push(format!("at {:.1} items/sec", rate));
        }
        if let Some(remaining) = self.estimate_remaining_at(now) {
            parts.push(format!("- ~{} remaining", format_duration(remaining)));
        }

        parts.join(" ")
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) >= self.trailing_window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(
            DEFAULT_UPDATE_INTERVAL,
            DEFAULT_PERCENTAGE_STEP,
            DEFAULT_TRAILING_WINDOW,
        )
    }
}

/// Compact duration for progress lines ("45s", "12m", "1.5h").
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
