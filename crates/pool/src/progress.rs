//! Pool statistics

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

use servprobe_common::{FingerprintResult, MatchResult};

/// Counters updated by the workers as requests finish.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    open: AtomicUsize,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub open: usize,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished request; `Err` counts as failed.
    pub fn record(&self, outcome: &FingerprintResult<MatchResult>) {
        match outcome {
            Ok(result) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                if result.is_open() {
                    self.open.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            open: self.open.load(Ordering::Relaxed),
        }
    }

    pub fn print_summary(&self) {
        let stats = self.snapshot();
        info!("Match Summary:");
        info!("  Submitted: {}", stats.submitted);
        info!("  Completed: {}", stats.completed);
        info!("  Failed: {}", stats.failed);
        info!("  Open: {}", stats.open);
        if stats.submitted > 0 {
            info!(
                "  Success rate: {:.1}%",
                (stats.completed as f64 / stats.submitted as f64) * 100.0
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servprobe_common::{FingerprintError, PortState};

    #[test]
    fn counters_track_outcomes() {
        let tracker = ProgressTracker::new();
        for _ in 0..3 {
            tracker.increment_submitted();
        }
        tracker.record(&Ok(MatchResult::new("h", 22, PortState::Open)));
        tracker.record(&Ok(MatchResult::new("h", 23, PortState::Closed)));
        tracker.record(&Err(FingerprintError::Cancelled));

        assert_eq!(
            tracker.snapshot(),
            PoolStats {
                submitted: 3,
                completed: 2,
                failed: 1,
                open: 1,
            }
        );
        tracker.print_summary();
    }
}
