//! Pipeline counters.
//!
//! A dropped frame or failed poll never stops the pipeline, but it must be
//! observable. Every drop path increments a counter here; the supervisor
//! logs a snapshot periodically.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

// ============================================================================
// PollerStats
// ============================================================================

/// Shared atomic counters for the whole pipeline.
///
/// Cheap to clone behind an `Arc`; every increment uses relaxed ordering
/// since counters carry no synchronization role.
#[derive(Debug, Default)]
pub struct PollerStats {
    /// Successful route polls.
    pub polls_ok: AtomicU64,
    /// Failed route polls (transient or expired).
    pub polls_failed: AtomicU64,
    /// Frames decoded into typed values.
    pub frames_decoded: AtomicU64,
    /// Frames dropped with a decode error.
    pub decode_errors: AtomicU64,
    /// Positions parsed from event payloads.
    pub positions_parsed: AtomicU64,
    /// Positions dropped by the bounds filter.
    pub positions_out_of_bounds: AtomicU64,
    /// Positions dropped as duplicates.
    pub positions_duplicate: AtomicU64,
    /// Non-empty position batches flushed to the sink.
    pub flushes: AtomicU64,
    /// Completed credential renewals.
    pub renewals: AtomicU64,
    /// Session reconnect attempts.
    pub reconnects: AtomicU64,
}

impl PollerStats {
    /// Creates zeroed counters.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments a counter by one.
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to a counter.
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Logs a one-line snapshot of all counters.
    pub fn log_snapshot(&self) {
        info!(
            polls_ok = self.polls_ok.load(Ordering::Relaxed),
            polls_failed = self.polls_failed.load(Ordering::Relaxed),
            frames = self.frames_decoded.load(Ordering::Relaxed),
            decode_errors = self.decode_errors.load(Ordering::Relaxed),
            positions = self.positions_parsed.load(Ordering::Relaxed),
            out_of_bounds = self.positions_out_of_bounds.load(Ordering::Relaxed),
            duplicates = self.positions_duplicate.load(Ordering::Relaxed),
            flushes = self.flushes.load(Ordering::Relaxed),
            renewals = self.renewals.load(Ordering::Relaxed),
            reconnects = self.reconnects.load(Ordering::Relaxed),
            "pipeline stats"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let stats = PollerStats::new();
        assert_eq!(stats.polls_ok.load(Ordering::Relaxed), 0);
        assert_eq!(stats.decode_errors.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_bump_and_add() {
        let stats = PollerStats::new();
        PollerStats::bump(&stats.flushes);
        PollerStats::add(&stats.positions_parsed, 12);

        assert_eq!(stats.flushes.load(Ordering::Relaxed), 1);
        assert_eq!(stats.positions_parsed.load(Ordering::Relaxed), 12);
    }
}
