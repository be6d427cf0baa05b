use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time snapshot of the tick scheduler's counters, exposed for
/// observability (logging/metrics), not used in any control-flow
/// decision. Taken via `Scheduler::stats()` in `txpromise-core`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Number of `(fn, args)` pairs currently queued in `deferredCallbacks`.
    pub pending_callbacks: usize,
    /// Current value of `numScheduledCalls`.
    pub scheduled_calls: u64,
    /// Total micro-tick passes drained since process start.
    pub total_passes: u64,
    /// Total host tasks (`physicalTick` invocations) since process start.
    pub total_physical_ticks: u64,
    /// Wall-clock time this snapshot was taken.
    pub captured_at: DateTime<Utc>,
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self {
            pending_callbacks: 0,
            scheduled_calls: 0,
            total_passes: 0,
            total_physical_ticks: 0,
            captured_at: Utc::now(),
        }
    }
}

/// Point-in-time snapshot of a scope's bookkeeping state, for
/// observability and for assertions in tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeStats {
    pub id: crate::ScopeId,
    pub ref_count: u32,
    pub is_global: bool,
    pub unhandled_count: usize,
    /// Wall-clock time this snapshot was taken.
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_stats_default_has_zeroed_counters() {
        let stats = SchedulerStats::default();
        assert_eq!(stats.pending_callbacks, 0);
        assert_eq!(stats.scheduled_calls, 0);
    }

    #[test]
    fn scope_stats_snapshot_matches_field_by_field() {
        let now = Utc::now();
        let expected = ScopeStats {
            id: crate::ScopeId::ROOT,
            ref_count: 1,
            is_global: true,
            unhandled_count: 0,
            captured_at: now,
        };
        let actual = ScopeStats { captured_at: now, ..expected.clone() };
        similar_asserts::assert_eq!(actual, expected);
    }
}
