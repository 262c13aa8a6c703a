//! Store lifecycle: boot, the public entry points and orderly shutdown.

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{self as channel, Sender};
use fhist_cache::CacheHierarchy;
use fhist_error::Result;
use fhist_index::ShardedIndex;
use fhist_log::{HashSource, LogReader, LogWriter};
use fhist_types::{
    DedupOutcome, HistoryConfig, HistoryRecord, QueryMode, RecoveryPolicy, ReplayConfig,
    SHARD_COUNT, ShardId,
};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::STORE_TARGET;
use crate::dispatcher::{DispatcherPool, IndexHandle};
use crate::metrics::{CoreMetrics, StoreMetricsSnapshot};
use crate::rebuild::RebuildReport;
use crate::replay::{self, ReplayReport};
use crate::shard_worker::{ShardRequest, ShardWorker};
use crate::writer::{WriteReceipt, WriterHandle};

/// Serializes store boot within the process.
static BOOT_LOCK: Mutex<()> = Mutex::new(());

/// Query-path threads owned by an open store.
#[derive(Debug)]
struct Running {
    dispatchers: DispatcherPool,
    shard_workers: Vec<JoinHandle<()>>,
}

/// An open history store.
///
/// All methods take `&self`; the store may be shared between threads.
/// [`HistoryStore::close`] (or drop) shuts the threads down in dependency
/// order: the writer first, then the dispatchers, the shard workers, the
/// batch workers with a final forced commit, the index stores and finally
/// the cache sweepers.
#[derive(Debug)]
pub struct HistoryStore {
    config: HistoryConfig,
    caches: Arc<CacheHierarchy>,
    index: Arc<ShardedIndex>,
    handle: IndexHandle,
    writer: WriterHandle,
    metrics: Arc<CoreMetrics>,
    boot_replay: ReplayReport,
    running: Mutex<Option<Running>>,
}

impl HistoryStore {
    /// Open (creating when absent) the store described by `config`, replay
    /// the log tail per `config.replay.policy` and start accepting writes.
    pub fn open(config: HistoryConfig) -> Result<Self> {
        config.validate()?;
        let _boot = BOOT_LOCK.lock();

        let log = LogWriter::open(&config)?;
        let log_end = log.position();
        let caches = Arc::new(CacheHierarchy::start(&config.cache)?);
        let index = Arc::new(ShardedIndex::open(
            &config,
            Arc::clone(&caches),
            &log.watermark(),
        )?);
        let ahead = match replay::reconcile_ahead(&index, log_end, config.replay.policy) {
            Ok(ahead) => ahead,
            Err(err) => {
                if let Err(close_err) = index.shutdown() {
                    warn!(target: STORE_TARGET, error = %close_err, "index close after failed boot");
                }
                caches.shutdown();
                return Err(err);
            }
        };

        let mut store = Self::start(config, log, caches, index)?;
        let report = replay::replay(
            &store.config.log_path(),
            store.config.hash_algo.hex_len(),
            &store.config.replay,
            &store.handle,
        );
        match report {
            Ok(report) => {
                store.metrics.record_replay(
                    report.scanned,
                    report.confirmed,
                    report.missing.len() as u64,
                    report.repaired,
                );
                if report.repaired > 0 {
                    store.index.sync()?;
                }
                store.boot_replay = ReplayReport { ahead, ..report };
            }
            Err(err) => {
                if let Err(close_err) = store.shutdown() {
                    warn!(target: STORE_TARGET, error = %close_err, "shutdown after failed boot");
                }
                return Err(err);
            }
        }

        info!(
            target: STORE_TARGET,
            base_dir = %store.config.base_dir.display(),
            hash_algo = store.config.hash_algo.as_str(),
            backend = ?store.config.backend,
            dispatchers = store.config.dispatchers,
            "history store open"
        );
        Ok(store)
    }

    /// Open with the configuration file at `path`.
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(HistoryConfig::load(path)?)
    }

    fn start(
        config: HistoryConfig,
        log: LogWriter,
        caches: Arc<CacheHierarchy>,
        index: Arc<ShardedIndex>,
    ) -> Result<Self> {
        let metrics = Arc::new(CoreMetrics::default());
        let hash_len = config.hash_algo.hex_len();
        let log_path = config.log_path();

        let mut shard_senders: Vec<Sender<ShardRequest>> = Vec::with_capacity(SHARD_COUNT);
        let mut shard_workers = Vec::with_capacity(SHARD_COUNT);
        for shard in ShardId::all() {
            let (tx, rx) = channel::bounded(config.shard_queue_capacity);
            let source: Box<dyn HashSource + Send> = Box::new(LogReader::open(&log_path, hash_len)?);
            let worker = ShardWorker::new(
                Arc::clone(index.shard(shard)),
                config.layout(),
                Arc::clone(&caches),
                Arc::clone(&metrics),
                source,
                rx,
            );
            shard_workers.push(worker.spawn()?);
            shard_senders.push(tx);
        }

        let (entry_tx, entry_rx) = channel::bounded(config.request_queue_capacity);
        let dispatchers = DispatcherPool::spawn(config.dispatchers, entry_rx, shard_senders)?;
        let handle = IndexHandle::new(entry_tx, config.hash_algo);
        let writer = WriterHandle::spawn(
            log,
            handle.clone(),
            Arc::clone(&caches),
            Arc::clone(&metrics),
            &config,
        )?;

        Ok(Self {
            config,
            caches,
            index,
            handle,
            writer,
            metrics,
            boot_replay: ReplayReport::default(),
            running: Mutex::new(Some(Running {
                dispatchers,
                shard_workers,
            })),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Record `record` in the log unless its hash is already known.
    pub fn add(&self, record: HistoryRecord) -> Result<WriteReceipt> {
        self.writer.add(record)
    }

    /// Search-only classification of `hash`.
    pub fn check(&self, hash: &str) -> Result<DedupOutcome> {
        self.handle.query(hash, QueryMode::Search)
    }

    /// Raw index query. Inserting through this bypasses the log; callers
    /// are responsible for a record existing at the offset. The entry is
    /// committed once the log's flushed end has passed that offset.
    pub fn index(&self, hash: &str, mode: QueryMode) -> Result<DedupOutcome> {
        self.handle.query(hash, mode)
    }

    /// Handle for issuing queries from other threads.
    #[must_use]
    pub fn index_handle(&self) -> IndexHandle {
        self.handle.clone()
    }

    /// Make everything accepted so far durable: fsync the log, commit every
    /// queued index write and flush every shard store.
    pub fn sync(&self) -> Result<()> {
        self.writer.flush(true)?;
        self.index.sync()
    }

    /// Insert every record of the log into the index.
    pub fn rebuild_from_log(&self) -> Result<RebuildReport> {
        let report = self.writer.rebuild()?;
        self.index.sync()?;
        Ok(report)
    }

    /// Replay the log tail now under `policy`.
    pub fn replay(&self, policy: RecoveryPolicy) -> Result<ReplayReport> {
        self.writer.flush(false)?;
        let config = ReplayConfig {
            policy,
            ..self.config.replay.clone()
        };
        let report = replay::replay(
            &self.config.log_path(),
            self.config.hash_algo.hex_len(),
            &config,
            &self.handle,
        )?;
        self.metrics.record_replay(
            report.scanned,
            report.confirmed,
            report.missing.len() as u64,
            report.repaired,
        );
        if report.repaired > 0 {
            self.index.sync()?;
        }
        Ok(report)
    }

    /// What replay found when the store was opened.
    #[must_use]
    pub const fn boot_replay(&self) -> &ReplayReport {
        &self.boot_replay
    }

    #[must_use]
    pub fn metrics(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            core: self.metrics.snapshot(),
            index: self.index.metrics(),
            caches: self.caches.stats(),
        }
    }

    /// Buckets whose batch worker stopped after a failed commit, as
    /// `(shard, bucket)` pairs.
    #[must_use]
    pub fn stopped_buckets(&self) -> Vec<(ShardId, String)> {
        ShardId::all()
            .flat_map(|shard| {
                self.index
                    .shard(shard)
                    .stopped_buckets()
                    .into_iter()
                    .map(move |bucket| (shard, bucket))
            })
            .collect()
    }

    /// Shut down and report the first failure.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        let Running {
            mut dispatchers,
            shard_workers,
        } = running;

        self.writer.shutdown();
        dispatchers.shutdown();
        for worker in shard_workers {
            if worker.join().is_err() {
                error!(target: STORE_TARGET, "shard worker panicked");
            }
        }
        let result = self.index.shutdown();
        self.caches.shutdown();
        match &result {
            Ok(()) => info!(target: STORE_TARGET, "history store closed"),
            Err(err) => error!(target: STORE_TARGET, error = %err, "history store closed with errors"),
        }
        result
    }
}

impl Drop for HistoryStore {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(target: STORE_TARGET, error = %err, "close on drop failed");
        }
    }
}
