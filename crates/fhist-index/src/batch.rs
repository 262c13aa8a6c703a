//! Per-(shard, bucket) write batching.
//!
//! Every root bucket owns a bounded item queue and one worker thread. The
//! worker sleeps for an [`AdaptiveTimer`] interval, drains the queue into a
//! local batch and commits it as a single backend transaction once the batch
//! is full or a flush is forced. Forced flushes come from an aged batch, a
//! small random chance per tick, an explicit [`BatchControl::Flush`], or
//! shutdown. A failed commit stops the worker; later enqueues to its bucket
//! fail with [`HistoryError::BucketStopped`].
//!
//! An item is only committed once every offset in its list lies below the
//! [`LogWatermark`]. Items drained earlier are held back and join the next
//! commit after the log writer flushes past them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, Receiver, Sender, TryRecvError};
use fhist_cache::CacheHierarchy;
use fhist_error::{HistoryError, Result};
use fhist_types::{BatchConfig, LogWatermark, Offsets, ShardId};
use hashbrown::HashMap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, error, warn};

use crate::BATCH_TARGET;
use crate::adaptive::AdaptiveTimer;
use crate::backend::{ShardBackend, TreeWrites};
use crate::metrics::IndexMetrics;

/// One queued index write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub tree: String,
    pub key: String,
    /// Hash prefix identifying the entry across shards; the L3 cache key.
    pub composite: String,
    /// Hash whose arrival produced this write.
    pub hash: String,
    /// Complete offset list after this write.
    pub offsets: Offsets,
    pub encoded: Vec<u8>,
    pub enqueued_at: Instant,
}

impl BatchItem {
    /// Largest offset in the list.
    #[must_use]
    pub fn high_offset(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }
}

/// Out-of-band requests to a batch worker.
#[derive(Debug)]
pub enum BatchControl {
    /// Commit everything queued so far, then answer on the channel.
    Flush(Sender<Result<()>>),
}

/// State shared between a bucket's producers and its worker.
#[derive(Debug)]
pub(crate) struct BucketState {
    pub(crate) shard: ShardId,
    pub(crate) name: String,
    /// Enqueued but not yet committed offset lists, by composite key.
    pub(crate) pending: Mutex<HashMap<String, Offsets>>,
    /// Held for each drain-and-commit cycle.
    pub(crate) batch_lock: Mutex<()>,
}

/// Producer side of one bucket's pipeline.
#[derive(Debug)]
pub(crate) struct BucketHandle {
    pub(crate) state: Arc<BucketState>,
    items: Sender<BatchItem>,
    control: Mutex<Option<Sender<BatchControl>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BucketHandle {
    pub(crate) fn spawn(
        shard: ShardId,
        name: String,
        backend: Arc<dyn ShardBackend>,
        caches: Arc<CacheHierarchy>,
        metrics: Arc<IndexMetrics>,
        config: &BatchConfig,
        watermark: LogWatermark,
    ) -> Result<Self> {
        let state = Arc::new(BucketState {
            shard,
            name,
            pending: Mutex::new(HashMap::new()),
            batch_lock: Mutex::new(()),
        });
        let (items_tx, items_rx) = channel::bounded(config.queue_capacity);
        let (control_tx, control_rx) = channel::unbounded();

        let worker = BatchWorker {
            state: Arc::clone(&state),
            backend,
            caches,
            metrics,
            items: items_rx,
            control: control_rx,
            local: Vec::with_capacity(config.batch_size),
            held: Vec::new(),
            watermark,
            timer: AdaptiveTimer::new(config.min_interval(), config.max_interval()),
            batch_size: config.batch_size,
            max_flush_latency: config.max_flush_latency(),
            random_flush_probability: config.random_flush_probability,
        };
        let handle = thread::Builder::new()
            .name(format!("fhist-batch-{shard}{}", state.name))
            .spawn(move || worker.run())?;

        Ok(Self {
            state,
            items: items_tx,
            control: Mutex::new(Some(control_tx)),
            worker: Mutex::new(Some(handle)),
        })
    }

    fn stopped(&self) -> HistoryError {
        HistoryError::BucketStopped {
            shard: self.state.shard.as_char(),
            bucket: self.state.name.clone(),
        }
    }

    /// Queue `item`, blocking while the queue is full.
    pub(crate) fn send(&self, item: BatchItem) -> Result<()> {
        self.items.send(item).map_err(|_| self.stopped())
    }

    /// Force a commit of everything queued and wait for it.
    pub(crate) fn flush(&self) -> Result<()> {
        let control = self.control.lock().clone().ok_or(HistoryError::ShutDown {
            component: "batch worker",
        })?;
        let (ack_tx, ack_rx) = channel::bounded(1);
        control
            .send(BatchControl::Flush(ack_tx))
            .map_err(|_| self.stopped())?;
        ack_rx.recv().map_err(|_| self.stopped())?
    }

    /// Stop the worker after a final forced drain and wait for it.
    pub(crate) fn stop(&self) {
        drop(self.control.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(
                    target: BATCH_TARGET,
                    shard = %self.state.shard,
                    bucket = %self.state.name,
                    "batch worker panicked"
                );
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

struct BatchWorker {
    state: Arc<BucketState>,
    backend: Arc<dyn ShardBackend>,
    caches: Arc<CacheHierarchy>,
    metrics: Arc<IndexMetrics>,
    items: Receiver<BatchItem>,
    control: Receiver<BatchControl>,
    /// Drained but uncommitted items, oldest first.
    local: Vec<BatchItem>,
    /// Drained items naming offsets the log has not flushed yet.
    held: Vec<BatchItem>,
    watermark: LogWatermark,
    timer: AdaptiveTimer,
    batch_size: usize,
    max_flush_latency: Duration,
    random_flush_probability: f64,
}

impl BatchWorker {
    fn run(mut self) {
        debug!(
            target: BATCH_TARGET,
            shard = %self.state.shard,
            bucket = %self.state.name,
            "batch worker started"
        );
        let control = self.control.clone();
        loop {
            let interval = self.timer.interval();
            channel::select! {
                recv(control) -> msg => match msg {
                    Ok(BatchControl::Flush(ack)) => {
                        let result = self.drain(true);
                        let failed = result.as_ref().err().map(ToString::to_string);
                        // The requester may have given up waiting.
                        let _ = ack.send(result);
                        if let Some(detail) = failed {
                            self.fail(&detail);
                            return;
                        }
                    }
                    Err(_) => {
                        if let Err(err) = self.drain(true) {
                            self.fail(&err.to_string());
                            return;
                        }
                        self.drop_unlogged();
                        debug!(
                            target: BATCH_TARGET,
                            shard = %self.state.shard,
                            bucket = %self.state.name,
                            "batch worker drained and stopped"
                        );
                        return;
                    }
                },
                default(interval) => {
                    if let Err(err) = self.drain(false) {
                        self.fail(&err.to_string());
                        return;
                    }
                }
            }
        }
    }

    fn fail(&self, detail: &str) {
        self.metrics.record_worker_stopped();
        error!(
            target: BATCH_TARGET,
            shard = %self.state.shard,
            bucket = %self.state.name,
            error = %detail,
            lost_items = self.local.len() + self.held.len() + self.items.len(),
            "batch commit failed, stopping bucket worker"
        );
    }

    /// Drain the queue and commit as the flush rules allow. A forced drain
    /// commits until the queue is empty.
    fn drain(&mut self, force: bool) -> Result<()> {
        let state = Arc::clone(&self.state);
        let _batch = state.batch_lock.lock();
        let lucky = !force
            && self.random_flush_probability > 0.0
            && rand::thread_rng().gen_bool(self.random_flush_probability);
        loop {
            let watermark = self.watermark.get();
            self.admit_held(watermark);
            while self.local.len() < self.batch_size {
                match self.items.try_recv() {
                    Ok(item) if item.high_offset() < watermark => self.local.push(item),
                    Ok(item) => {
                        self.metrics.record_held_back();
                        self.held.push(item);
                    }
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
            let Some(oldest) = self.local.first() else {
                return Ok(());
            };
            let full = self.local.len() >= self.batch_size;
            let aged = oldest.enqueued_at.elapsed() >= self.max_flush_latency;
            if !(full || force || aged || lucky) {
                return Ok(());
            }
            self.commit(!full)?;
            if !(full || force) {
                return Ok(());
            }
        }
    }

    /// Move held items whose offsets are now all below `watermark` into the
    /// batch. Lists for one key only grow, so a key's held items are always
    /// newer than its admitted ones.
    fn admit_held(&mut self, watermark: u64) {
        if self.held.is_empty() {
            return;
        }
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|item| item.high_offset() < watermark);
        self.held = waiting;
        self.local.extend(ready);
    }

    /// Discard held items after the final drain. Their records never
    /// reached the log.
    fn drop_unlogged(&mut self) {
        if self.held.is_empty() {
            return;
        }
        warn!(
            target: BATCH_TARGET,
            shard = %self.state.shard,
            bucket = %self.state.name,
            items = self.held.len(),
            watermark = self.watermark.get(),
            "dropping index writes for records missing from the log"
        );
        self.metrics.record_dropped_unlogged(self.held.len());
        self.held.clear();
    }

    fn commit(&mut self, forced: bool) -> Result<()> {
        let items = std::mem::take(&mut self.local);

        // Each item carries the full list for its key; the latest one wins.
        let mut latest: BTreeMap<(&str, &str), &[u8]> = BTreeMap::new();
        for item in &items {
            latest.insert((item.tree.as_str(), item.key.as_str()), &item.encoded);
        }
        let keys = latest.len();
        let mut writes: Vec<TreeWrites> = Vec::new();
        for ((tree, key), encoded) in latest {
            let entry = (key.as_bytes().to_vec(), encoded.to_vec());
            match writes.last_mut() {
                Some(last) if last.tree == tree => last.entries.push(entry),
                _ => writes.push(TreeWrites {
                    tree: tree.to_owned(),
                    entries: vec![entry],
                }),
            }
        }

        let high_offset = items.iter().map(BatchItem::high_offset).max().unwrap_or(0);
        let started = Instant::now();
        let committed = self
            .backend
            .raise_high_water(high_offset)
            .and_then(|()| self.backend.commit(&writes));
        if let Err(err) = committed {
            self.metrics.record_commit_failure();
            self.local = items;
            return Err(err);
        }
        let latency = started.elapsed();
        self.timer.record(latency);
        self.metrics.record_commit(items.len(), keys, forced, latency);

        {
            let mut pending = self.state.pending.lock();
            for item in &items {
                if pending.get(&item.composite) == Some(&item.offsets) {
                    pending.remove(&item.composite);
                }
            }
        }
        let shard = self.state.shard;
        for item in items.iter().rev() {
            self.caches.l3.extend(shard, item.composite.clone());
            self.caches.l1.extend(shard, item.hash.clone());
        }

        debug!(
            target: BATCH_TARGET,
            shard = %shard,
            bucket = %self.state.name,
            items = items.len(),
            keys,
            forced,
            latency_us = latency.as_micros() as u64,
            next_interval_ms = self.timer.interval().as_millis() as u64,
            "committed batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use fhist_types::{BucketLayout, CacheConfig, OffsetBase, decode_offsets, encode_offsets};
    use proptest::prelude::*;

    use super::*;
    use crate::memory_backend::MemoryBackend;

    const TREE: &str = "a";

    fn shard() -> ShardId {
        ShardId::from_hex_char(b'5').expect("hex")
    }

    fn item(key: &str, offsets: &[u64]) -> BatchItem {
        let offsets = Offsets::from_slice(offsets);
        BatchItem {
            tree: TREE.to_owned(),
            key: key.to_owned(),
            composite: format!("5a{key}"),
            hash: format!("5a{key}"),
            encoded: encode_offsets(&offsets, OffsetBase::Hex),
            offsets,
            enqueued_at: Instant::now(),
        }
    }

    /// Commits only when forced or full.
    fn quiet() -> BatchConfig {
        BatchConfig {
            batch_size: 64,
            queue_capacity: 64,
            min_interval_ms: 1,
            max_interval_ms: 5,
            max_flush_latency_ms: 60_000,
            random_flush_probability: 0.0,
        }
    }

    struct Bucket {
        handle: BucketHandle,
        backend: Arc<MemoryBackend>,
        metrics: Arc<IndexMetrics>,
    }

    fn spawn(config: &BatchConfig, watermark: LogWatermark) -> Bucket {
        let backend = Arc::new(MemoryBackend::new(shard(), BucketLayout::default()));
        let metrics = Arc::new(IndexMetrics::default());
        let handle = BucketHandle::spawn(
            shard(),
            TREE.to_owned(),
            Arc::clone(&backend) as Arc<dyn ShardBackend>,
            Arc::new(CacheHierarchy::new(&CacheConfig::default())),
            Arc::clone(&metrics),
            config,
            watermark,
        )
        .expect("spawn");
        Bucket {
            handle,
            backend,
            metrics,
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn full_batch_commits_before_items_age() {
        let config = BatchConfig {
            batch_size: 2,
            ..quiet()
        };
        let bucket = spawn(&config, LogWatermark::unbounded());
        bucket.handle.send(item("k1", &[128])).expect("send");
        thread::sleep(Duration::from_millis(50));
        assert!(bucket.backend.is_empty());

        bucket.handle.send(item("k2", &[256])).expect("send");
        assert!(wait_for(|| bucket.backend.len() == 2));
        let snap = bucket.metrics.snapshot();
        assert_eq!(snap.commits, 1);
        assert_eq!(snap.forced_commits, 0);
        bucket.handle.stop();
    }

    #[test]
    fn random_flush_commits_young_items() {
        let config = BatchConfig {
            random_flush_probability: 1.0,
            ..quiet()
        };
        let bucket = spawn(&config, LogWatermark::unbounded());
        bucket.handle.send(item("k1", &[128])).expect("send");
        assert!(wait_for(|| bucket.backend.len() == 1));
        bucket.handle.stop();
    }

    #[test]
    fn full_queue_blocks_the_sender() {
        let config = BatchConfig {
            queue_capacity: 1,
            min_interval_ms: 300,
            max_interval_ms: 300,
            ..quiet()
        };
        let bucket = spawn(&config, LogWatermark::unbounded());
        bucket.handle.send(item("k1", &[128])).expect("send");

        let sent = AtomicBool::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                bucket.handle.send(item("k2", &[256])).expect("send");
                sent.store(true, Ordering::Release);
            });
            thread::sleep(Duration::from_millis(50));
            assert!(!sent.load(Ordering::Acquire), "second send did not wait for the worker");
            assert!(wait_for(|| sent.load(Ordering::Acquire)));
        });
        bucket.handle.stop();
        assert_eq!(bucket.backend.len(), 2);
    }

    #[test]
    fn stop_commits_everything_queued() {
        let config = BatchConfig {
            min_interval_ms: 1_000,
            max_interval_ms: 1_000,
            ..quiet()
        };
        let bucket = spawn(&config, LogWatermark::unbounded());
        for (n, key) in ["k1", "k2", "k3"].into_iter().enumerate() {
            bucket
                .handle
                .send(item(key, &[128 + n as u64 * 100]))
                .expect("send");
        }
        assert!(bucket.backend.is_empty());
        bucket.handle.stop();
        assert_eq!(bucket.backend.len(), 3);
        assert!(!bucket.handle.is_running());
        assert_eq!(bucket.backend.high_water().expect("high water"), 328);
    }

    #[test]
    fn writes_wait_for_the_log_to_flush() {
        let watermark = LogWatermark::new(200);
        let bucket = spawn(&quiet(), watermark.clone());
        bucket.handle.send(item("k1", &[128])).expect("send");
        bucket.handle.send(item("k2", &[300])).expect("send");

        bucket.handle.flush().expect("flush");
        assert_eq!(bucket.backend.len(), 1);
        assert_eq!(bucket.backend.get(TREE, b"k2").expect("get"), None);
        assert_eq!(bucket.metrics.snapshot().held_back, 1);

        watermark.publish(400);
        bucket.handle.flush().expect("flush");
        assert_eq!(bucket.backend.get(TREE, b"k2").expect("get"), Some(b"12c,".to_vec()));
        assert_eq!(bucket.backend.high_water().expect("high water"), 300);
        bucket.handle.stop();
        assert_eq!(bucket.metrics.snapshot().dropped_unlogged, 0);
    }

    #[test]
    fn unlogged_writes_are_dropped_at_stop() {
        let bucket = spawn(&quiet(), LogWatermark::new(200));
        bucket.handle.send(item("k1", &[128, 300])).expect("send");
        bucket.handle.stop();
        assert!(bucket.backend.is_empty());
        assert_eq!(bucket.metrics.snapshot().dropped_unlogged, 1);
    }

    fn idle_worker(backend: Arc<MemoryBackend>) -> BatchWorker {
        let config = quiet();
        let (_items_tx, items) = channel::bounded(1);
        let (_control_tx, control) = channel::unbounded();
        BatchWorker {
            state: Arc::new(BucketState {
                shard: shard(),
                name: TREE.to_owned(),
                pending: Mutex::new(HashMap::new()),
                batch_lock: Mutex::new(()),
            }),
            backend,
            caches: Arc::new(CacheHierarchy::new(&CacheConfig::default())),
            metrics: Arc::new(IndexMetrics::default()),
            items,
            control,
            local: Vec::new(),
            held: Vec::new(),
            watermark: LogWatermark::unbounded(),
            timer: AdaptiveTimer::new(config.min_interval(), config.max_interval()),
            batch_size: config.batch_size,
            max_flush_latency: config.max_flush_latency(),
            random_flush_probability: config.random_flush_probability,
        }
    }

    proptest! {
        #[test]
        fn commit_keeps_the_latest_list_per_key(
            keys in proptest::collection::vec(0_usize..4, 1..40),
        ) {
            let backend = Arc::new(MemoryBackend::new(shard(), BucketLayout::default()));
            let mut worker = idle_worker(Arc::clone(&backend));
            let mut lists: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
            for (n, key) in keys.iter().enumerate() {
                let list = lists.entry(*key).or_default();
                list.push(128 + n as u64 * 64);
                worker.local.push(item(&format!("k{key}"), list));
            }
            worker.commit(true).expect("commit");

            prop_assert_eq!(backend.len(), lists.len());
            for (key, list) in &lists {
                let stored = backend
                    .get(TREE, format!("k{key}").as_bytes())
                    .expect("get")
                    .expect("present");
                let decoded = decode_offsets(&stored, OffsetBase::Hex).expect("decode");
                prop_assert_eq!(decoded.as_slice(), list.as_slice());
            }
        }
    }
}
