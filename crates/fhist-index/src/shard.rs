//! Index shards and the sixteen-shard registry.

use std::sync::Arc;
use std::time::Instant;

use fhist_cache::CacheHierarchy;
use fhist_error::{HistoryError, Result};
use fhist_types::{
    BatchConfig, BucketLayout, HistoryConfig, LogWatermark, OffsetBase, Offsets, QueryMode, Route,
    SHARD_COUNT, ShardId, decode_offsets, encode_offsets,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::INDEX_TARGET;
use crate::backend::{ShardBackend, TreeWrites, open_backend};
use crate::batch::{BatchItem, BucketHandle};
use crate::metrics::{IndexMetrics, IndexMetricsSnapshot};

/// Offsets dropped by [`IndexShard::prune_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PruneStats {
    /// Entries rewritten or deleted.
    pub keys: u64,
    pub offsets: u64,
}

impl PruneStats {
    fn add(&mut self, other: Self) {
        self.keys += other.keys;
        self.offsets += other.offsets;
    }
}

/// One shard: its store, its buckets' batch pipelines and the caches they
/// refresh.
#[derive(Debug)]
pub struct IndexShard {
    shard: ShardId,
    layout: BucketLayout,
    offset_base: OffsetBase,
    backend: Arc<dyn ShardBackend>,
    buckets: Vec<BucketHandle>,
    caches: Arc<CacheHierarchy>,
    metrics: Arc<IndexMetrics>,
}

impl IndexShard {
    /// Start one batch worker per root bucket of `layout` over `backend`.
    /// Workers commit an offset only once `watermark` has passed it.
    pub fn open(
        backend: Arc<dyn ShardBackend>,
        layout: BucketLayout,
        offset_base: OffsetBase,
        batch: &BatchConfig,
        caches: Arc<CacheHierarchy>,
        metrics: Arc<IndexMetrics>,
        watermark: &LogWatermark,
    ) -> Result<Self> {
        let shard = backend.shard();
        let mut buckets = Vec::with_capacity(layout.root_buckets());
        for bucket in 0..layout.root_buckets() {
            let handle = BucketHandle::spawn(
                shard,
                layout.bucket_name(bucket),
                Arc::clone(&backend),
                Arc::clone(&caches),
                Arc::clone(&metrics),
                batch,
                watermark.clone(),
            );
            match handle {
                Ok(handle) => buckets.push(handle),
                Err(err) => {
                    for started in &buckets {
                        started.stop();
                    }
                    return Err(err);
                }
            }
        }
        debug!(
            target: INDEX_TARGET,
            shard = %shard,
            buckets = buckets.len(),
            "opened index shard"
        );
        Ok(Self {
            shard,
            layout,
            offset_base,
            backend,
            buckets,
            caches,
            metrics,
        })
    }

    #[must_use]
    pub const fn id(&self) -> ShardId {
        self.shard
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ShardBackend> {
        &self.backend
    }

    fn bucket(&self, route: &Route) -> Result<&BucketHandle> {
        if route.shard != self.shard {
            return Err(HistoryError::internal(format!(
                "route for shard {} delivered to shard {}",
                route.shard, self.shard
            )));
        }
        self.buckets.get(route.bucket).ok_or_else(|| {
            HistoryError::internal(format!(
                "bucket {} out of range on shard {}",
                route.bucket, self.shard
            ))
        })
    }

    /// Offset list stored for `route`'s key; empty when none.
    ///
    /// Resolution order is L3, then writes still queued in the bucket, then
    /// the store. A search that finds nothing caches the empty list.
    pub fn get(&self, route: &Route, mode: QueryMode) -> Result<Offsets> {
        if let Some(offsets) = self.caches.l3.get(self.shard, route.composite.as_str()) {
            return Ok(offsets);
        }

        let bucket = self.bucket(route)?;
        let pending = bucket.state.pending.lock().get(&route.composite).cloned();
        if let Some(offsets) = pending {
            self.metrics.record_pending_hit();
            self.caches
                .l3
                .set(self.shard, route.composite.clone(), offsets.clone());
            return Ok(offsets);
        }

        let stored = self.backend.get(&route.tree, route.key.as_bytes())?;
        self.metrics.record_store_read(stored.is_some());
        match stored {
            Some(bytes) => {
                let offsets = decode_offsets(&bytes, self.offset_base)?;
                self.caches
                    .l3
                    .set(self.shard, route.composite.clone(), offsets.clone());
                Ok(offsets)
            }
            None => {
                if mode.is_search() {
                    self.caches
                        .l3
                        .set(self.shard, route.composite.clone(), Offsets::new());
                }
                Ok(Offsets::new())
            }
        }
    }

    /// Queue `offsets` as the new complete list for `route`'s key. Blocks
    /// while the bucket queue is full. The list is visible to [`Self::get`]
    /// immediately.
    pub fn enqueue(&self, route: &Route, hash: &str, offsets: Offsets) -> Result<()> {
        if offsets.is_empty() {
            return Err(HistoryError::internal("refusing to enqueue an empty offset list"));
        }
        let bucket = self.bucket(route)?;
        let encoded = encode_offsets(&offsets, self.offset_base);
        bucket
            .state
            .pending
            .lock()
            .insert(route.composite.clone(), offsets.clone());
        self.caches
            .l3
            .set(self.shard, route.composite.clone(), offsets.clone());
        let sent = bucket.send(BatchItem {
            tree: route.tree.clone(),
            key: route.key.clone(),
            composite: route.composite.clone(),
            hash: hash.to_owned(),
            offsets,
            encoded,
            enqueued_at: Instant::now(),
        });
        if sent.is_err() {
            bucket.state.pending.lock().remove(&route.composite);
            self.caches.l3.del(self.shard, route.composite.as_str());
        } else {
            self.metrics.record_enqueue();
        }
        sent
    }

    /// Commit every queued write and flush the store. Holds all bucket
    /// batch locks of the shard while flushing. Every running bucket is
    /// committed even when another has stopped; the first failure is
    /// returned afterwards.
    pub fn sync(&self) -> Result<()> {
        let mut first_err = None;
        for bucket in &self.buckets {
            if let Err(err) = bucket.flush() {
                warn!(
                    target: INDEX_TARGET,
                    shard = %self.shard,
                    bucket = %bucket.state.name,
                    error = %err,
                    "bucket flush failed during sync"
                );
                first_err.get_or_insert(err);
            }
        }
        let _locks: Vec<_> = self
            .buckets
            .iter()
            .map(|bucket| bucket.state.batch_lock.lock())
            .collect();
        if let Err(err) = self.backend.flush() {
            first_err.get_or_insert(err);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Highest offset the store has recorded as committed.
    pub fn high_water(&self) -> Result<u64> {
        self.backend.high_water()
    }

    /// Remove every stored offset at or past `log_end`, deleting entries
    /// left empty, and reset the high-water mark to the largest offset
    /// kept. Must run before the shard serves queries.
    pub fn prune_from(&self, log_end: u64) -> Result<PruneStats> {
        let _locks: Vec<_> = self
            .buckets
            .iter()
            .map(|bucket| bucket.state.batch_lock.lock())
            .collect();
        let mut stats = PruneStats::default();
        let mut highest = 0;
        for tree in self.layout.tree_names() {
            let mut rewrites = Vec::new();
            let mut removals = Vec::new();
            for (key, value) in self.backend.scan(&tree)? {
                let stored = decode_offsets(&value, self.offset_base)?;
                let kept: Offsets = stored.iter().copied().filter(|&o| o < log_end).collect();
                if let Some(&last) = kept.last() {
                    highest = highest.max(last);
                }
                let dropped = stored.len() - kept.len();
                if dropped == 0 {
                    continue;
                }
                stats.keys += 1;
                stats.offsets += dropped as u64;
                if kept.is_empty() {
                    removals.push(key);
                } else {
                    rewrites.push((key, encode_offsets(&kept, self.offset_base)));
                }
            }
            if !rewrites.is_empty() {
                self.backend.commit(&[TreeWrites {
                    tree: tree.clone(),
                    entries: rewrites,
                }])?;
            }
            if !removals.is_empty() {
                self.backend.remove(&tree, &removals)?;
            }
        }
        self.backend.reset_high_water(highest)?;
        self.backend.flush()?;
        info!(
            target: INDEX_TARGET,
            shard = %self.shard,
            log_end,
            keys = stats.keys,
            offsets = stats.offsets,
            high_water = highest,
            "pruned index offsets past the end of the log"
        );
        Ok(stats)
    }

    /// Buckets whose worker has exited.
    #[must_use]
    pub fn stopped_buckets(&self) -> Vec<String> {
        self.buckets
            .iter()
            .filter(|bucket| !bucket.is_running())
            .map(|bucket| bucket.state.name.clone())
            .collect()
    }

    /// Drain and stop every bucket worker, then flush the store.
    pub fn shutdown(&self) -> Result<()> {
        for bucket in &self.buckets {
            bucket.stop();
        }
        self.backend.flush()
    }
}

/// All sixteen shards of one index.
#[derive(Debug)]
pub struct ShardedIndex {
    layout: BucketLayout,
    shards: Vec<Arc<IndexShard>>,
    metrics: Arc<IndexMetrics>,
}

impl ShardedIndex {
    /// Open (creating when absent) every shard store selected by `config`.
    pub fn open(
        config: &HistoryConfig,
        caches: Arc<CacheHierarchy>,
        watermark: &LogWatermark,
    ) -> Result<Self> {
        let backends = ShardId::all()
            .map(|shard| open_backend(config, shard))
            .collect::<Result<Vec<_>>>()?;
        Self::with_backends(config, caches, backends, watermark)
    }

    /// Build the index over caller-supplied backends, one per shard in slot
    /// order.
    pub fn with_backends(
        config: &HistoryConfig,
        caches: Arc<CacheHierarchy>,
        backends: Vec<Arc<dyn ShardBackend>>,
        watermark: &LogWatermark,
    ) -> Result<Self> {
        if backends.len() != SHARD_COUNT {
            return Err(HistoryError::config(format!(
                "expected {SHARD_COUNT} shard backends, got {}",
                backends.len()
            )));
        }
        let layout = config.layout();
        let metrics = Arc::new(IndexMetrics::default());
        let mut shards: Vec<Arc<IndexShard>> = Vec::with_capacity(SHARD_COUNT);
        for (slot, backend) in backends.into_iter().enumerate() {
            if backend.shard().index() != slot {
                return Err(HistoryError::config(format!(
                    "backend for shard {} supplied in slot {slot}",
                    backend.shard()
                )));
            }
            let shard = IndexShard::open(
                backend,
                layout,
                config.offset_base,
                &config.batch,
                Arc::clone(&caches),
                Arc::clone(&metrics),
                watermark,
            );
            match shard {
                Ok(shard) => shards.push(Arc::new(shard)),
                Err(err) => {
                    for opened in &shards {
                        if let Err(close_err) = opened.shutdown() {
                            warn!(target: INDEX_TARGET, error = %close_err, "shard close failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        info!(
            target: INDEX_TARGET,
            shards = SHARD_COUNT,
            buckets_per_shard = layout.root_buckets(),
            sub_buckets = layout.sub_buckets(),
            backend = ?config.backend,
            "opened sharded index"
        );
        Ok(Self {
            layout,
            shards,
            metrics,
        })
    }

    #[must_use]
    pub const fn layout(&self) -> BucketLayout {
        self.layout
    }

    #[must_use]
    pub fn shard(&self, shard: ShardId) -> &Arc<IndexShard> {
        &self.shards[shard.index()]
    }

    pub fn route(&self, hash: &str) -> Result<Route> {
        self.layout.route(hash)
    }

    /// Commit and flush every shard; reports the first failure after
    /// attempting all shards.
    pub fn sync(&self) -> Result<()> {
        let mut first_err = None;
        for shard in &self.shards {
            if let Err(err) = shard.sync() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Shards whose high-water mark is at or past `log_end`, with that
    /// mark. Their stores reference records the log does not hold.
    pub fn shards_ahead_of(&self, log_end: u64) -> Result<Vec<(ShardId, u64)>> {
        let mut ahead = Vec::new();
        for shard in &self.shards {
            let high_water = shard.high_water()?;
            if high_water >= log_end {
                ahead.push((shard.id(), high_water));
            }
        }
        Ok(ahead)
    }

    /// [`IndexShard::prune_from`] on each of `shards`.
    pub fn prune_from(&self, shards: &[ShardId], log_end: u64) -> Result<PruneStats> {
        let mut stats = PruneStats::default();
        for &shard in shards {
            stats.add(self.shard(shard).prune_from(log_end)?);
        }
        Ok(stats)
    }

    #[must_use]
    pub fn metrics(&self) -> IndexMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop every batch worker and flush every store; reports the first
    /// failure after attempting all shards.
    pub fn shutdown(&self) -> Result<()> {
        let mut first_err = None;
        for shard in &self.shards {
            if let Err(err) = shard.shutdown() {
                warn!(target: INDEX_TARGET, shard = %shard.id(), error = %err, "shard shutdown failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
