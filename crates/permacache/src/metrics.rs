//! Per-function cache counters.
//!
//! Every wrapper owns a [`FunctionStats`] and bumps it as decisions are
//! taken; [`Memoized::stats`](crate::Memoized::stats) exposes a consistent
//! [`StatsSnapshot`]. Every invocation of the wrapped function is timed, so
//! the snapshot can report how much latency the cache is saving. Counters
//! are plain atomics: cheap enough to leave always on, with no sampling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct FunctionStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    background_refreshes: AtomicU64,
    recomputations: AtomicU64,
    wait_timeouts: AtomicU64,
    size_limit_rejections: AtomicU64,
    serialization_errors: AtomicU64,
    invocations: AtomicU64,
    invoke_nanos: AtomicU64,
}

impl FunctionStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_background_refresh(&self) {
        self.background_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recomputation(&self) {
        self.recomputations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_size_limit_rejection(&self) {
        self.size_limit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_serialization_error(&self) {
        self.serialization_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invocation(&self, elapsed: Duration) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.invoke_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
            recomputations: self.recomputations.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            size_limit_rejections: self.size_limit_rejections.load(Ordering::Relaxed),
            serialization_errors: self.serialization_errors.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            invoke_time: Duration::from_nanos(self.invoke_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// A point-in-time view of one function's cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Fresh values served from the cache.
    pub hits: u64,
    /// Calls that found no usable entry.
    pub misses: u64,
    /// Stale values returned under the serve-stale policy.
    pub stale_served: u64,
    /// Fire-and-forget recomputations dispatched.
    pub background_refreshes: u64,
    /// Invocations of the wrapped function on behalf of the cache.
    pub recomputations: u64,
    /// Waits on another producer that hit the deadline.
    pub wait_timeouts: u64,
    /// Values returned uncached because they exceeded the size limit.
    pub size_limit_rejections: u64,
    /// Values returned uncached because they could not be serialized.
    pub serialization_errors: u64,
    /// Invocations of the wrapped function, on any path.
    pub invocations: u64,
    /// Wall-clock time spent inside the wrapped function, summed over
    /// [`invocations`](Self::invocations).
    pub invoke_time: Duration,
}

impl StatsSnapshot {
    /// Cache accesses that consulted an entry, fresh or stale.
    pub fn total_calls(&self) -> u64 {
        self.hits + self.misses + self.stale_served
    }

    /// Fraction of lookups served from the cache, in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_calls();
        if total == 0 {
            0.0
        } else {
            (self.hits + self.stale_served) as f64 / total as f64
        }
    }

    /// Mean wall-clock cost of one invocation of the wrapped function.
    pub fn avg_invoke_latency(&self) -> Duration {
        if self.invocations == 0 {
            Duration::ZERO
        } else {
            self.invoke_time / self.invocations as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counts() {
        let stats = FunctionStats::default();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_stale_served();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.total_calls(), 4);
        assert!((snapshot.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_stats_have_zero_hit_rate() {
        assert_eq!(StatsSnapshot::default().hit_rate(), 0.0);
        assert_eq!(StatsSnapshot::default().avg_invoke_latency(), Duration::ZERO);
    }

    #[test]
    fn invocation_latency_averages() {
        let stats = FunctionStats::default();
        stats.record_invocation(Duration::from_millis(30));
        stats.record_invocation(Duration::from_millis(10));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.invocations, 2);
        assert_eq!(snapshot.invoke_time, Duration::from_millis(40));
        assert_eq!(snapshot.avg_invoke_latency(), Duration::from_millis(20));
    }
}
