//! Transaction counters for a runtime
//!
//! # Memory Ordering
//!
//! All counters use Relaxed ordering. They are observational only and do not
//! synchronize any other memory; approximate cross-thread totals are fine.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a runtime
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
    total_retried: AtomicU64,
}

impl MetricsRecorder {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a level starting
    pub fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a level committing (outermost or joined)
    pub fn record_commit(&self) {
        self.finish_one();
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a level aborting
    pub fn record_abort(&self) {
        self.finish_one();
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an abort that never started a level (pre-aborted or rejected)
    pub fn record_skipped(&self) {
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retry of an outermost level
    pub fn record_retry(&self) {
        self.total_retried.fetch_add(1, Ordering::Relaxed);
    }

    fn finish_one(&self) {
        // Saturating decrement
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
    }

    /// Snapshot of the counters
    pub fn snapshot(&self) -> TransactionMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);

        TransactionMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            total_retried: self.total_retried.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }
}

/// Transaction metrics
///
/// Every nesting level counts, so a two-level nest that commits adds two
/// starts and two commits.
#[derive(Debug, Clone, Default)]
pub struct TransactionMetrics {
    /// Levels currently running, across all threads
    pub active_count: u64,
    /// Levels started
    pub total_started: u64,
    /// Levels committed (outermost commits and joins)
    pub total_committed: u64,
    /// Levels aborted, including work skipped because it was aborted before start
    pub total_aborted: u64,
    /// Outermost levels rolled back and re-run by the retry policy
    pub total_retried: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Total levels that completed (committed + aborted)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_aborted
    }

    /// Abort rate (aborted / started)
    pub fn abort_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_aborted as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_recorder_is_zero() {
        let metrics = MetricsRecorder::new().snapshot();
        assert_eq!(metrics.active_count, 0);
        assert_eq!(metrics.total_started, 0);
        assert_eq!(metrics.commit_rate, 0.0);
        assert_eq!(metrics.abort_rate(), 0.0);
    }

    #[test]
    fn test_start_commit_abort() {
        let recorder = MetricsRecorder::new();
        for _ in 0..4 {
            recorder.record_start();
        }
        recorder.record_commit();
        recorder.record_commit();
        recorder.record_commit();
        recorder.record_abort();

        let metrics = recorder.snapshot();
        assert_eq!(metrics.active_count, 0);
        assert_eq!(metrics.total_completed(), 4);
        assert_eq!(metrics.commit_rate, 0.75);
        assert_eq!(metrics.abort_rate(), 0.25);
    }

    #[test]
    fn test_active_count_saturates() {
        let recorder = MetricsRecorder::new();
        recorder.record_abort();
        assert_eq!(recorder.snapshot().active_count, 0);
    }

    #[test]
    fn test_skipped_and_retried() {
        let recorder = MetricsRecorder::new();
        recorder.record_skipped();
        recorder.record_retry();
        let metrics = recorder.snapshot();
        assert_eq!(metrics.total_aborted, 1);
        assert_eq!(metrics.total_started, 0);
        assert_eq!(metrics.total_retried, 1);
    }
}
