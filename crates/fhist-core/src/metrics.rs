//! Duplicate-check, writer and recovery counters.

use std::sync::atomic::{AtomicU64, Ordering};

use fhist_cache::CacheHierarchySnapshot;
use fhist_index::IndexMetricsSnapshot;
use fhist_types::DedupOutcome;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct CoreMetrics {
    added: AtomicU64,
    duplicates: AtomicU64,
    retries: AtomicU64,
    passes: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    log_reads: AtomicU64,
    requeries: AtomicU64,
    appended: AtomicU64,
    query_errors: AtomicU64,
    replay_scanned: AtomicU64,
    replay_confirmed: AtomicU64,
    replay_missing: AtomicU64,
    replay_repaired: AtomicU64,
    rebuild_records: AtomicU64,
}

/// Point-in-time copy of [`CoreMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CoreMetricsSnapshot {
    pub added: u64,
    pub duplicates: u64,
    pub retries: u64,
    pub passes: u64,
    /// Queries answered from the L1 status cache.
    pub l1_hits: u64,
    /// Confirmatory reads answered from the L2 offset cache.
    pub l2_hits: u64,
    pub log_reads: u64,
    /// Flush-and-requery rounds made by the log writer.
    pub requeries: u64,
    pub appended: u64,
    pub query_errors: u64,
    pub replay_scanned: u64,
    pub replay_confirmed: u64,
    pub replay_missing: u64,
    pub replay_repaired: u64,
    pub rebuild_records: u64,
}

/// Everything a store reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreMetricsSnapshot {
    pub core: CoreMetricsSnapshot,
    pub index: IndexMetricsSnapshot,
    pub caches: CacheHierarchySnapshot,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CoreMetrics {
    pub(crate) fn record_outcome(&self, outcome: DedupOutcome) {
        bump(match outcome {
            DedupOutcome::Added => &self.added,
            DedupOutcome::Duplicate => &self.duplicates,
            DedupOutcome::Retry => &self.retries,
            DedupOutcome::Pass => &self.passes,
        });
    }

    pub(crate) fn record_l1_hit(&self) {
        bump(&self.l1_hits);
    }

    pub(crate) fn record_l2_hit(&self) {
        bump(&self.l2_hits);
    }

    pub(crate) fn record_log_read(&self) {
        bump(&self.log_reads);
    }

    pub(crate) fn record_requery(&self) {
        bump(&self.requeries);
    }

    pub(crate) fn record_append(&self) {
        bump(&self.appended);
    }

    pub(crate) fn record_query_error(&self) {
        bump(&self.query_errors);
    }

    pub(crate) fn record_replay(&self, scanned: u64, confirmed: u64, missing: u64, repaired: u64) {
        self.replay_scanned.fetch_add(scanned, Ordering::Relaxed);
        self.replay_confirmed.fetch_add(confirmed, Ordering::Relaxed);
        self.replay_missing.fetch_add(missing, Ordering::Relaxed);
        self.replay_repaired.fetch_add(repaired, Ordering::Relaxed);
    }

    pub(crate) fn record_rebuild(&self, records: u64) {
        self.rebuild_records.fetch_add(records, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CoreMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CoreMetricsSnapshot {
            added: load(&self.added),
            duplicates: load(&self.duplicates),
            retries: load(&self.retries),
            passes: load(&self.passes),
            l1_hits: load(&self.l1_hits),
            l2_hits: load(&self.l2_hits),
            log_reads: load(&self.log_reads),
            requeries: load(&self.requeries),
            appended: load(&self.appended),
            query_errors: load(&self.query_errors),
            replay_scanned: load(&self.replay_scanned),
            replay_confirmed: load(&self.replay_confirmed),
            replay_missing: load(&self.replay_missing),
            replay_repaired: load(&self.replay_repaired),
            rebuild_records: load(&self.rebuild_records),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_land_in_their_counters() {
        let metrics = CoreMetrics::default();
        for outcome in [
            DedupOutcome::Added,
            DedupOutcome::Added,
            DedupOutcome::Duplicate,
            DedupOutcome::Retry,
            DedupOutcome::Pass,
        ] {
            metrics.record_outcome(outcome);
        }
        let snap = metrics.snapshot();
        assert_eq!((snap.added, snap.duplicates, snap.retries, snap.passes), (2, 1, 1, 1));

        let json = serde_json::to_value(snap).expect("json");
        assert_eq!(json["added"], 2);
    }
}
