//! Generic TTL tier and the L1/L2/L3 hierarchy built from it.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, Receiver, Sender, TrySendError};
use fhist_error::Result;
use fhist_types::{CacheConfig, HashStatus, Offsets, SHARD_COUNT, ShardId};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::CACHE_TARGET;
use crate::shard::{Lookup, TtlShard};
use crate::sweeper::SweeperSet;

/// L1: hash → last classification.
pub type StatusCache = TtlCache<String, HashStatus>;
/// L2: log offset → hash stored there.
pub type HashByOffsetCache = TtlCache<u64, String>;
/// L3: composite key → decoded offset list (empty means "known absent").
pub type OffsetsCache = TtlCache<String, Offsets>;

#[derive(Debug, Default)]
struct TierStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    inserts: AtomicU64,
    swept: AtomicU64,
    grows: AtomicU64,
    shrinks: AtomicU64,
    extends: AtomicU64,
    extends_dropped: AtomicU64,
}

/// Point-in-time counters of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Reads that found an entry past its TTL.
    pub expired: u64,
    pub inserts: u64,
    /// Entries removed by background sweeps.
    pub swept: u64,
    pub grows: u64,
    pub shrinks: u64,
    pub extends: u64,
    /// Extend signals dropped because the sweeper queue was full.
    pub extends_dropped: u64,
    pub entries: u64,
}

/// One cache tier: sixteen TTL maps plus the extend queues feeding their
/// sweepers.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    name: &'static str,
    ttl: Duration,
    shards: Box<[Mutex<TtlShard<K, V>>]>,
    extend_tx: Box<[Sender<K>]>,
    extend_rx: Mutex<Option<Vec<Receiver<K>>>>,
    stats: TierStats,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Build a tier whose entries live for `ttl` unless set otherwise.
    #[must_use]
    pub fn new(name: &'static str, ttl: Duration, config: &CacheConfig) -> Arc<Self> {
        let shards = (0..SHARD_COUNT)
            .map(|_| {
                Mutex::new(TtlShard::new(
                    config.initial_capacity,
                    config.grow_threshold_pct,
                    config.shrink_threshold_pct,
                ))
            })
            .collect();
        let (extend_tx, extend_rx): (Vec<_>, Vec<_>) = (0..SHARD_COUNT)
            .map(|_| channel::bounded(config.extend_queue_capacity))
            .unzip();
        Arc::new(Self {
            name,
            ttl,
            shards,
            extend_tx: extend_tx.into_boxed_slice(),
            extend_rx: Mutex::new(Some(extend_rx)),
            stats: TierStats::default(),
        })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    fn shard(&self, shard: ShardId) -> &Mutex<TtlShard<K, V>> {
        &self.shards[shard.index()]
    }

    pub fn get<Q>(&self, shard: ShardId, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let lookup = self.shard(shard).lock().get(key, Instant::now());
        match lookup {
            Lookup::Hit(value) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Lookup::Miss => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Lookup::Expired => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, shard: ShardId, key: K, value: V) {
        self.set_with_ttl(shard, key, value, self.ttl);
    }

    pub fn set_with_ttl(&self, shard: ShardId, key: K, value: V, ttl: Duration) {
        let grew = self
            .shard(shard)
            .lock()
            .insert(key, value, Instant::now() + ttl);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        if grew {
            self.stats.grows.fetch_add(1, Ordering::Relaxed);
            trace!(target: CACHE_TARGET, tier = self.name, shard = %shard, "grew cache shard");
        }
    }

    pub fn del<Q>(&self, shard: ShardId, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(shard).lock().remove(key)
    }

    /// Ask the shard's sweeper to renew `key`'s TTL. Never blocks; a full
    /// queue drops the signal.
    pub fn extend(&self, shard: ShardId, key: K) {
        match self.extend_tx[shard.index()].try_send(key) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats.extends_dropped.fetch_add(1, Ordering::Relaxed);
            }
            // Sweepers are gone; the store is shutting down.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Renew a live entry's TTL; called by the sweeper.
    pub(crate) fn apply_extend(&self, shard: ShardId, key: &K) {
        let now = Instant::now();
        if self.shard(shard).lock().extend(key, now, now + self.ttl) {
            self.stats.extends.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict expired entries of one shard and shrink it when sparse.
    pub fn sweep(&self, shard: ShardId) -> usize {
        let outcome = self.shard(shard).lock().sweep(Instant::now());
        self.stats
            .swept
            .fetch_add(outcome.expired as u64, Ordering::Relaxed);
        if outcome.shrunk {
            self.stats.shrinks.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.expired > 0 || outcome.shrunk {
            trace!(
                target: CACHE_TARGET,
                tier = self.name,
                shard = %shard,
                expired = outcome.expired,
                shrunk = outcome.shrunk,
                "swept cache shard"
            );
        }
        outcome.expired
    }

    /// Live and not-yet-swept entries across all shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStatsSnapshot {
            hits: load(&self.stats.hits),
            misses: load(&self.stats.misses),
            expired: load(&self.stats.expired),
            inserts: load(&self.stats.inserts),
            swept: load(&self.stats.swept),
            grows: load(&self.stats.grows),
            shrinks: load(&self.stats.shrinks),
            extends: load(&self.stats.extends),
            extends_dropped: load(&self.stats.extends_dropped),
            entries: self.len() as u64,
        }
    }

    /// Hand the extend receivers to a sweeper set; only the first call gets
    /// them.
    pub(crate) fn take_extend_receivers(&self) -> Option<Vec<Receiver<K>>> {
        self.extend_rx.lock().take()
    }
}

/// Counters of all three tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheHierarchySnapshot {
    pub l1: CacheStatsSnapshot,
    pub l2: CacheStatsSnapshot,
    pub l3: CacheStatsSnapshot,
}

/// The L1/L2/L3 tiers and their sweeper threads.
#[derive(Debug)]
pub struct CacheHierarchy {
    pub l1: Arc<StatusCache>,
    pub l2: Arc<HashByOffsetCache>,
    pub l3: Arc<OffsetsCache>,
    retry_ttl: Duration,
    sweepers: Mutex<Option<SweeperSet>>,
}

impl CacheHierarchy {
    /// Build the tiers without background sweeping; expiry stays lazy.
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            l1: TtlCache::new("l1", config.l1_ttl(), config),
            l2: TtlCache::new("l2", config.l2_ttl(), config),
            l3: TtlCache::new("l3", config.l3_ttl(), config),
            retry_ttl: config.retry_ttl(),
            sweepers: Mutex::new(None),
        }
    }

    /// Build the tiers and start one sweeper per shard of each tier.
    pub fn start(config: &CacheConfig) -> Result<Self> {
        let caches = Self::new(config);
        let mut sweepers = SweeperSet::new(config.sweep_interval());
        sweepers.spawn_tier(&caches.l1)?;
        sweepers.spawn_tier(&caches.l2)?;
        sweepers.spawn_tier(&caches.l3)?;
        *caches.sweepers.lock() = Some(sweepers);
        Ok(caches)
    }

    /// Memoize a classification; `Retry` uses the short retry TTL.
    pub fn set_status(&self, shard: ShardId, hash: &str, status: HashStatus) {
        let ttl = match status {
            HashStatus::Retry => self.retry_ttl,
            HashStatus::Added | HashStatus::Duplicate => self.l1.ttl(),
        };
        self.l1.set_with_ttl(shard, hash.to_owned(), status, ttl);
    }

    #[must_use]
    pub fn status(&self, shard: ShardId, hash: &str) -> Option<HashStatus> {
        self.l1.get(shard, hash)
    }

    pub fn forget_status(&self, shard: ShardId, hash: &str) -> bool {
        self.l1.del(shard, hash)
    }

    #[must_use]
    pub fn stats(&self) -> CacheHierarchySnapshot {
        CacheHierarchySnapshot {
            l1: self.l1.stats(),
            l2: self.l2.stats(),
            l3: self.l3.stats(),
        }
    }

    /// Stop and join every sweeper thread. Idempotent.
    pub fn shutdown(&self) {
        if let Some(sweepers) = self.sweepers.lock().take() {
            sweepers.shutdown();
        }
    }
}

impl Drop for CacheHierarchy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn shard(c: u8) -> ShardId {
        ShardId::from_hex_char(c).expect("hex")
    }

    fn quick_config() -> CacheConfig {
        CacheConfig {
            l1_ttl_ms: 40,
            l2_ttl_ms: 40,
            l3_ttl_ms: 60,
            retry_ttl_ms: 10,
            sweep_interval_ms: 5,
            initial_capacity: 4,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn tiers_are_independent_per_shard() {
        let caches = CacheHierarchy::new(&CacheConfig::default());
        caches
            .l3
            .set(shard(b'a'), "a3f09c2e".to_owned(), Offsets::from_slice(&[500, 672]));
        assert_eq!(
            caches.l3.get(shard(b'a'), "a3f09c2e").map(|o| o.to_vec()),
            Some(vec![500, 672])
        );
        assert_eq!(caches.l3.get(shard(b'b'), "a3f09c2e"), None);

        caches.l2.set(shard(b'a'), 500, "a3f0".to_owned());
        assert_eq!(caches.l2.get(shard(b'a'), &500), Some("a3f0".to_owned()));

        let stats = caches.l3.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn status_helpers_and_retry_ttl() {
        let caches = CacheHierarchy::new(&quick_config());
        let s = shard(b'0');
        caches.set_status(s, "0abc", HashStatus::Added);
        caches.set_status(s, "0def", HashStatus::Retry);
        assert_eq!(caches.status(s, "0abc"), Some(HashStatus::Added));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(caches.status(s, "0def"), None);
        assert!(caches.forget_status(s, "0abc"));
        assert_eq!(caches.status(s, "0abc"), None);
    }

    #[test]
    fn sweepers_evict_and_extend() {
        let caches = CacheHierarchy::start(&quick_config()).expect("start");
        let s = shard(b'f');
        for i in 0..16_u64 {
            caches.l2.set(s, i, format!("f{i}"));
        }
        caches.l3.set(s, "fkeep".to_owned(), Offsets::from_slice(&[128]));
        assert!(caches.l2.stats().grows > 0);

        // Keep one L3 entry alive through repeated extend signals.
        for _ in 0..8 {
            caches.l3.extend(s, "fkeep".to_owned());
            thread::sleep(Duration::from_millis(10));
        }
        assert!(caches.l3.get(s, "fkeep").is_some());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(caches.l2.len(), 0);
        let stats = caches.l2.stats();
        assert_eq!(stats.swept, 16);
        assert!(stats.shrinks > 0);
        caches.shutdown();
        caches.shutdown();
    }
}
