//! Batch pipeline and index read counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Counters shared by every shard and bucket worker of one index.
#[derive(Debug, Default)]
pub struct IndexMetrics {
    commits: AtomicU64,
    items_committed: AtomicU64,
    keys_written: AtomicU64,
    forced_commits: AtomicU64,
    commit_failures: AtomicU64,
    commit_latency_us_total: AtomicU64,
    commit_latency_us_max: AtomicU64,
    enqueued: AtomicU64,
    pending_hits: AtomicU64,
    store_reads: AtomicU64,
    store_hits: AtomicU64,
    stopped_workers: AtomicU64,
    held_back: AtomicU64,
    dropped_unlogged: AtomicU64,
}

/// Point-in-time copy of [`IndexMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IndexMetricsSnapshot {
    pub commits: u64,
    pub items_committed: u64,
    /// Distinct keys written; below `items_committed` when a batch held
    /// several updates of one key.
    pub keys_written: u64,
    pub forced_commits: u64,
    pub commit_failures: u64,
    pub commit_latency_us_total: u64,
    pub commit_latency_us_max: u64,
    pub enqueued: u64,
    /// Reads answered from enqueued but uncommitted entries.
    pub pending_hits: u64,
    pub store_reads: u64,
    pub store_hits: u64,
    pub stopped_workers: u64,
    /// Items drained before their log record was flushed and kept back.
    pub held_back: u64,
    /// Items discarded at shutdown because their record never reached the
    /// log.
    pub dropped_unlogged: u64,
}

impl IndexMetrics {
    pub(crate) fn record_commit(&self, items: usize, keys: usize, forced: bool, latency: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.items_committed
            .fetch_add(items as u64, Ordering::Relaxed);
        self.keys_written.fetch_add(keys as u64, Ordering::Relaxed);
        if forced {
            self.forced_commits.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.commit_latency_us_total
            .fetch_add(micros, Ordering::Relaxed);
        self.commit_latency_us_max
            .fetch_max(micros, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_worker_stopped(&self) {
        self.stopped_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_held_back(&self) {
        self.held_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_unlogged(&self, items: usize) {
        self.dropped_unlogged
            .fetch_add(items as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pending_hit(&self) {
        self.pending_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_read(&self, hit: bool) {
        self.store_reads.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.store_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> IndexMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        IndexMetricsSnapshot {
            commits: load(&self.commits),
            items_committed: load(&self.items_committed),
            keys_written: load(&self.keys_written),
            forced_commits: load(&self.forced_commits),
            commit_failures: load(&self.commit_failures),
            commit_latency_us_total: load(&self.commit_latency_us_total),
            commit_latency_us_max: load(&self.commit_latency_us_max),
            enqueued: load(&self.enqueued),
            pending_hits: load(&self.pending_hits),
            store_reads: load(&self.store_reads),
            store_hits: load(&self.store_hits),
            stopped_workers: load(&self.stopped_workers),
            held_back: load(&self.held_back),
            dropped_unlogged: load(&self.dropped_unlogged),
        }
    }
}
