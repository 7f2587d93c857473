//! Per-cycle counters and structured metric events
//!
//! Everything the fabric recovers from locally is surfaced here instead of
//! becoming control behavior: saturation, late frames, window drops, replays,
//! tamper attempts, budget overruns. Counters are O(1) to update, allocation
//! free, and emitted as one structured `tracing` event at cycle close. There
//! is no export surface; collectors tail the log.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use crate::wire::CycleId;

/// Rolling counters for the aggregator. All updates are O(1).
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    /// Cycles opened since start.
    pub cycles: u64,
    /// Task frames dispatched.
    pub tasks_dispatched: u64,
    /// Result frames accepted into the current cycle.
    pub results_accepted: u64,
    /// Result frames that were duplicates of an accepted block.
    pub duplicates: u64,
    /// Result frames linearly dependent on earlier arrivals.
    pub dependents: u64,
    /// Results for `current − 1`, recorded but not decoded.
    pub late_results: u64,
    /// Results older than `current − 1`, dropped.
    pub stale_dropped: u64,
    /// Frames outside the reorder window.
    pub window_dropped: u64,
    /// Cycles that failed to reach rank `m` by deadline.
    pub undecodable_cycles: u64,
    /// Decodes delivered with a saturated basis.
    pub tainted_decodes: u64,
    /// Saturation events reported by workers (any flag bit).
    pub saturated_blocks: u64,
    /// Decode wall time of the last decoded cycle, microseconds.
    pub last_decode_us: u64,
    /// Worst decode wall time seen, microseconds.
    pub max_decode_us: u64,
    /// Cycles whose synchronous work exceeded the CPU budget.
    pub budget_overruns: u64,
    /// Commits applied.
    pub commits_applied: u64,
    /// Commit tokens rejected as replayed or stale.
    pub replays_rejected: u64,
    /// Commit tokens from unauthorized keys.
    pub unauthorized_rejected: u64,
    /// Commit tokens with bad signatures.
    pub bad_signatures: u64,
    /// Resyncs served or applied.
    pub resyncs: u64,
}

impl CycleStats {
    pub const fn new() -> Self {
        CycleStats {
            cycles: 0,
            tasks_dispatched: 0,
            results_accepted: 0,
            duplicates: 0,
            dependents: 0,
            late_results: 0,
            stale_dropped: 0,
            window_dropped: 0,
            undecodable_cycles: 0,
            tainted_decodes: 0,
            saturated_blocks: 0,
            last_decode_us: 0,
            max_decode_us: 0,
            budget_overruns: 0,
            commits_applied: 0,
            replays_rejected: 0,
            unauthorized_rejected: 0,
            bad_signatures: 0,
            resyncs: 0,
        }
    }

    /// Record decode wall time.
    #[inline]
    pub fn record_decode(&mut self, us: u64) {
        self.last_decode_us = us;
        if us > self.max_decode_us {
            self.max_decode_us = us;
        }
    }

    /// Emit the cycle-close event.
    pub fn emit(&self, cycle: CycleId) {
        tracing::info!(
            cycle = cycle.as_u64(),
            cycles = self.cycles,
            dispatched = self.tasks_dispatched,
            accepted = self.results_accepted,
            duplicates = self.duplicates,
            dependents = self.dependents,
            late = self.late_results,
            stale = self.stale_dropped,
            window_dropped = self.window_dropped,
            undecodable = self.undecodable_cycles,
            tainted = self.tainted_decodes,
            saturated = self.saturated_blocks,
            decode_us = self.last_decode_us,
            decode_us_max = self.max_decode_us,
            budget_overruns = self.budget_overruns,
            commits = self.commits_applied,
            replays = self.replays_rejected,
            unauthorized = self.unauthorized_rejected,
            bad_signatures = self.bad_signatures,
            resyncs = self.resyncs,
            "cycle closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_timer_tracks_the_maximum() {
        let mut s = CycleStats::new();
        s.record_decode(120);
        s.record_decode(80);
        assert_eq!(s.last_decode_us, 80);
        assert_eq!(s.max_decode_us, 120);
    }
}
