//! The duplicate-check protocol.
//!
//! Given a routed hash and a [`QueryMode`], the stored offset list for the
//! hash's key is resolved through the index, then every offset in it is
//! confirmed against the log because keys are truncated hashes and may be
//! shared by several records:
//!
//! 1. No offsets: a search is a [`DedupOutcome::Pass`]; an insert enqueues
//!    `[offset]` and is [`DedupOutcome::Added`].
//! 2. For each stored offset, in order, read the hash recorded there. A
//!    read past the visible end of the log is a [`DedupOutcome::Retry`]; a
//!    matching hash is a [`DedupOutcome::Duplicate`]; a different hash
//!    moves on to the next offset.
//! 3. No offset matched: a search is a `Pass`; an insert adds its offset
//!    to the list, enqueues it and is `Added`.
//!
//! `Pass` and `Retry` never touch the index. Read errors are returned as
//! errors and never mapped to an outcome.

use fhist_cache::HashByOffsetCache;
use fhist_error::{HistoryError, Result};
use fhist_index::IndexShard;
use fhist_log::{HashAt, HashSource};
use fhist_types::{DedupOutcome, Offsets, QueryMode, Route};
use tracing::trace;

use crate::DISPATCH_TARGET;
use crate::metrics::CoreMetrics;

/// Protocol state borrowed from one shard worker.
#[derive(Debug, Clone, Copy)]
pub struct DuplicateCheck<'a> {
    pub shard: &'a IndexShard,
    pub l2: &'a HashByOffsetCache,
    pub metrics: &'a CoreMetrics,
}

impl DuplicateCheck<'_> {
    /// Classify `hash` (already routed to `route`) under `mode`.
    pub fn classify<S>(
        &self,
        source: &mut S,
        route: &Route,
        hash: &str,
        mode: QueryMode,
    ) -> Result<DedupOutcome>
    where
        S: HashSource + ?Sized,
    {
        mode.validate()?;
        let stored = self.shard.get(route, mode)?;

        for &offset in &stored {
            match self.hash_at(source, route, offset)? {
                HashAt::Eof => {
                    trace!(
                        target: DISPATCH_TARGET,
                        hash,
                        offset,
                        "referenced record not visible yet"
                    );
                    return Ok(DedupOutcome::Retry);
                }
                HashAt::Hash(found) if found == hash => return Ok(DedupOutcome::Duplicate),
                HashAt::Hash(_) => {}
            }
        }

        let QueryMode::Insert(offset) = mode else {
            return Ok(DedupOutcome::Pass);
        };
        let updated = with_offset(&stored, offset)?;
        self.shard.enqueue(route, hash, updated)?;
        Ok(DedupOutcome::Added)
    }

    fn hash_at<S>(&self, source: &mut S, route: &Route, offset: u64) -> Result<HashAt>
    where
        S: HashSource + ?Sized,
    {
        if let Some(hash) = self.l2.get(route.shard, &offset) {
            self.metrics.record_l2_hit();
            return Ok(HashAt::Hash(hash));
        }
        self.metrics.record_log_read();
        let read = source.read_hash_at(offset)?;
        if let HashAt::Hash(hash) = &read {
            self.l2.set(route.shard, offset, hash.clone());
        }
        Ok(read)
    }
}

/// `stored` plus `offset`, kept ascending. The writer hands out growing
/// offsets, so this is an append except when repair reinserts an older
/// record.
fn with_offset(stored: &Offsets, offset: u64) -> Result<Offsets> {
    match stored.binary_search(&offset) {
        Ok(_) => Err(HistoryError::internal(format!(
            "offset {offset} already indexed under another hash"
        ))),
        Err(pos) => {
            let mut updated = stored.clone();
            updated.insert(pos, offset);
            Ok(updated)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use fhist_cache::CacheHierarchy;
    use fhist_index::{IndexMetrics, MemoryBackend, ShardBackend};
    use fhist_types::{BucketLayout, CacheConfig, HistoryConfig, LogWatermark, OffsetBase, ShardId};

    use super::*;

    /// Log stand-in: records by offset, with everything at or past
    /// `visible_end` not yet flushed.
    #[derive(Default)]
    struct FakeLog {
        records: HashMap<u64, String>,
        visible_end: u64,
        reads: usize,
    }

    impl FakeLog {
        fn write(&mut self, offset: u64, hash: &str) {
            self.records.insert(offset, hash.to_owned());
        }

        fn flush_all(&mut self) {
            self.visible_end = u64::MAX;
        }
    }

    impl HashSource for FakeLog {
        fn read_hash_at(&mut self, offset: u64) -> Result<HashAt> {
            self.reads += 1;
            if offset >= self.visible_end {
                return Ok(HashAt::Eof);
            }
            self.records.get(&offset).map_or_else(
                || Err(HistoryError::log_corrupt(offset, "no record starts here")),
                |hash| Ok(HashAt::Hash(hash.clone())),
            )
        }
    }

    struct Fixture {
        shard: IndexShard,
        caches: Arc<CacheHierarchy>,
        metrics: CoreMetrics,
        layout: BucketLayout,
    }

    impl Fixture {
        fn new() -> Self {
            let config = HistoryConfig::default();
            let layout = config.layout();
            let shard_id = ShardId::from_hex_char(b'a').expect("hex");
            let backend: Arc<dyn ShardBackend> = Arc::new(MemoryBackend::new(shard_id, layout));
            let caches = Arc::new(CacheHierarchy::new(&CacheConfig::default()));
            let shard = IndexShard::open(
                backend,
                layout,
                OffsetBase::Hex,
                &config.batch,
                Arc::clone(&caches),
                Arc::new(IndexMetrics::default()),
                &LogWatermark::unbounded(),
            )
            .expect("open shard");
            Self {
                shard,
                caches,
                metrics: CoreMetrics::default(),
                layout,
            }
        }

        fn check(&self) -> DuplicateCheck<'_> {
            DuplicateCheck {
                shard: &self.shard,
                l2: &self.caches.l2,
                metrics: &self.metrics,
            }
        }

        fn classify(&self, log: &mut FakeLog, hash: &str, mode: QueryMode) -> DedupOutcome {
            let route = self.layout.route(hash).expect("route");
            self.check()
                .classify(log, &route, hash, mode)
                .expect("classify")
        }

        fn stored(&self, hash: &str) -> Offsets {
            let route = self.layout.route(hash).expect("route");
            self.shard.get(&route, QueryMode::Insert(1)).expect("get")
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            drop(self.shard.shutdown());
        }
    }

    /// 64-char hash in shard `a` whose first nine characters (the composite
    /// key under the default layout) are shared by every `tail`.
    fn colliding(tail: char) -> String {
        let mut hash = String::from("a3c0ffee7");
        hash.extend(std::iter::repeat_n(tail, 55));
        hash
    }

    #[test]
    fn concrete_scenario() {
        let fixture = Fixture::new();
        let mut log = FakeLog::default();
        log.flush_all();
        let h1 = colliding('1');
        let h2 = colliding('2');
        let h3 = colliding('3');

        assert_eq!(
            fixture.classify(&mut log, &h1, QueryMode::Insert(128)),
            DedupOutcome::Added
        );
        log.write(128, &h1);

        assert_eq!(
            fixture.classify(&mut log, &h1, QueryMode::Insert(300)),
            DedupOutcome::Duplicate
        );

        assert_eq!(
            fixture.classify(&mut log, &h2, QueryMode::Insert(300)),
            DedupOutcome::Added
        );
        log.write(300, &h2);
        assert_eq!(fixture.stored(&h2).as_slice(), &[128, 300]);

        assert_eq!(
            fixture.classify(&mut log, &h3, QueryMode::Search),
            DedupOutcome::Pass
        );
        assert_eq!(fixture.stored(&h3).as_slice(), &[128, 300]);

        assert_eq!(
            fixture.classify(&mut log, &h2, QueryMode::Search),
            DedupOutcome::Duplicate
        );
    }

    #[test]
    fn unflushed_record_yields_retry_then_resolves() {
        let fixture = Fixture::new();
        let mut log = FakeLog::default();
        let h1 = colliding('1');
        let h2 = colliding('2');

        assert_eq!(
            fixture.classify(&mut log, &h1, QueryMode::Insert(128)),
            DedupOutcome::Added
        );
        log.write(128, &h1);

        // Offset 128 is indexed but still buffered by the writer.
        assert_eq!(
            fixture.classify(&mut log, &h2, QueryMode::Insert(400)),
            DedupOutcome::Retry
        );
        assert_eq!(fixture.stored(&h2).as_slice(), &[128]);

        log.flush_all();
        assert_eq!(
            fixture.classify(&mut log, &h2, QueryMode::Insert(400)),
            DedupOutcome::Added
        );
        assert_eq!(fixture.stored(&h2).as_slice(), &[128, 400]);
    }

    #[test]
    fn search_on_unknown_key_is_pass_and_mutates_nothing() {
        let fixture = Fixture::new();
        let mut log = FakeLog::default();
        let hash = colliding('9');
        assert_eq!(
            fixture.classify(&mut log, &hash, QueryMode::Search),
            DedupOutcome::Pass
        );
        assert!(fixture.stored(&hash).is_empty());
        assert_eq!(log.reads, 0);
    }

    #[test]
    fn confirmed_reads_are_memoized_in_l2() {
        let fixture = Fixture::new();
        let mut log = FakeLog::default();
        log.flush_all();
        let h1 = colliding('1');
        fixture.classify(&mut log, &h1, QueryMode::Insert(128));
        log.write(128, &h1);

        fixture.classify(&mut log, &h1, QueryMode::Search);
        fixture.classify(&mut log, &h1, QueryMode::Search);
        assert_eq!(log.reads, 1);
        let snap = fixture.metrics.snapshot();
        assert_eq!((snap.log_reads, snap.l2_hits), (1, 1));
    }

    #[test]
    fn l3_expiry_does_not_change_classification() {
        let fixture = Fixture::new();
        let mut log = FakeLog::default();
        log.flush_all();
        let h1 = colliding('1');
        fixture.classify(&mut log, &h1, QueryMode::Insert(128));
        log.write(128, &h1);
        fixture.shard.sync().expect("sync");

        let route = fixture.layout.route(&h1).expect("route");
        fixture.caches.l3.del(route.shard, route.composite.as_str());
        fixture.caches.l2.del(route.shard, &128_u64);
        assert_eq!(
            fixture.classify(&mut log, &h1, QueryMode::Search),
            DedupOutcome::Duplicate
        );
    }

    #[test]
    fn malformed_record_is_an_error_not_an_outcome() {
        let fixture = Fixture::new();
        let mut log = FakeLog::default();
        log.flush_all();
        let h1 = colliding('1');
        fixture.classify(&mut log, &h1, QueryMode::Insert(128));
        // Nothing was written at 128.
        let route = fixture.layout.route(&h1).expect("route");
        let err = fixture
            .check()
            .classify(&mut log, &route, &h1, QueryMode::Search)
            .expect_err("corrupt");
        assert!(matches!(err, HistoryError::LogCorrupt { offset: 128, .. }));
    }

    #[test]
    fn insert_zero_is_rejected_before_lookup() {
        let fixture = Fixture::new();
        let mut log = FakeLog::default();
        let hash = colliding('1');
        let route = fixture.layout.route(&hash).expect("route");
        let err = fixture
            .check()
            .classify(&mut log, &route, &hash, QueryMode::Insert(0))
            .expect_err("misuse");
        assert!(matches!(err, HistoryError::InvalidOffset(0)));
        assert!(fixture.stored(&hash).is_empty());
    }

    #[test]
    fn repaired_offsets_keep_the_list_ascending() {
        let stored = Offsets::from_slice(&[128, 900]);
        assert_eq!(with_offset(&stored, 400).expect("insert").as_slice(), &[128, 400, 900]);
        assert_eq!(with_offset(&stored, 1000).expect("append").as_slice(), &[128, 900, 1000]);
        assert!(with_offset(&stored, 900).is_err());
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

        #[test]
        fn colliding_inserts_keep_offsets_ascending(
            tails in proptest::collection::btree_set(0_u8..16, 1..8),
            target in 0_u8..16,
        ) {
            let fixture = Fixture::new();
            let mut log = FakeLog::default();
            log.flush_all();
            let hex = |n: u8| char::from_digit(u32::from(n), 16).expect("hex digit");

            let mut offset = 128;
            let mut expected = Vec::new();
            for &tail in &tails {
                let hash = colliding(hex(tail));
                proptest::prop_assert_eq!(
                    fixture.classify(&mut log, &hash, QueryMode::Insert(offset)),
                    DedupOutcome::Added
                );
                log.write(offset, &hash);
                expected.push(offset);
                offset += 211;
            }

            let stored = fixture.stored(&colliding(hex(target)));
            proptest::prop_assert_eq!(stored.as_slice(), expected.as_slice());
            proptest::prop_assert!(stored.windows(2).all(|pair| pair[0] < pair[1]));

            let expected_outcome = if tails.contains(&target) {
                DedupOutcome::Duplicate
            } else {
                DedupOutcome::Pass
            };
            proptest::prop_assert_eq!(
                fixture.classify(&mut log, &colliding(hex(target)), QueryMode::Search),
                expected_outcome
            );
        }
    }
}
