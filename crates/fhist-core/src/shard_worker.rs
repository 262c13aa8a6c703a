//! One request-serving thread per index shard.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use fhist_cache::CacheHierarchy;
use fhist_error::{ErrorClass, HistoryError, Result};
use fhist_index::IndexShard;
use fhist_log::HashSource;
use fhist_types::{BucketLayout, DedupOutcome, HashStatus, QueryMode};
use tracing::{debug, error, warn};

use crate::DISPATCH_TARGET;
use crate::dedup::DuplicateCheck;
use crate::metrics::CoreMetrics;

/// A validated query already routed to its shard.
#[derive(Debug)]
pub(crate) struct ShardRequest {
    pub(crate) hash: String,
    pub(crate) mode: QueryMode,
    pub(crate) reply: Sender<Result<DedupOutcome>>,
}

pub(crate) struct ShardWorker {
    shard: Arc<IndexShard>,
    layout: BucketLayout,
    caches: Arc<CacheHierarchy>,
    metrics: Arc<CoreMetrics>,
    source: Box<dyn HashSource + Send>,
    requests: Receiver<ShardRequest>,
}

/// Integrity and internal failures end the worker; everything else is
/// answered and the worker keeps serving.
fn stops_worker(err: &HistoryError) -> bool {
    matches!(err.class(), ErrorClass::Integrity | ErrorClass::Internal)
}

impl ShardWorker {
    pub(crate) fn new(
        shard: Arc<IndexShard>,
        layout: BucketLayout,
        caches: Arc<CacheHierarchy>,
        metrics: Arc<CoreMetrics>,
        source: Box<dyn HashSource + Send>,
        requests: Receiver<ShardRequest>,
    ) -> Self {
        Self {
            shard,
            layout,
            caches,
            metrics,
            source,
            requests,
        }
    }

    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        let name = format!("fhist-shard-{}", self.shard.id());
        Ok(thread::Builder::new().name(name).spawn(move || self.run())?)
    }

    fn run(mut self) {
        let shard = self.shard.id();
        debug!(target: DISPATCH_TARGET, shard = %shard, "shard worker started");
        while let Ok(request) = self.requests.recv() {
            let result = self.handle(&request.hash, request.mode);
            let stop = match &result {
                Ok(_) => false,
                Err(err) => {
                    self.metrics.record_query_error();
                    let stop = stops_worker(err);
                    if stop {
                        error!(
                            target: DISPATCH_TARGET,
                            shard = %shard,
                            hash = %request.hash,
                            class = err.class().as_str(),
                            error = %err,
                            "shard worker stopping"
                        );
                    } else {
                        warn!(
                            target: DISPATCH_TARGET,
                            shard = %shard,
                            hash = %request.hash,
                            class = err.class().as_str(),
                            error = %err,
                            "query failed"
                        );
                    }
                    stop
                }
            };
            // The caller may have stopped waiting.
            let _ = request.reply.send(result);
            if stop {
                return;
            }
        }
        debug!(target: DISPATCH_TARGET, shard = %shard, "shard worker stopped");
    }

    fn handle(&mut self, hash: &str, mode: QueryMode) -> Result<DedupOutcome> {
        let route = self.layout.route(hash)?;
        if route.shard != self.shard.id() {
            return Err(HistoryError::internal(format!(
                "hash {hash} dispatched to shard {}",
                self.shard.id()
            )));
        }

        if let Some(status) = self.caches.status(route.shard, hash) {
            self.metrics.record_l1_hit();
            let outcome = status.cached_outcome();
            self.metrics.record_outcome(outcome);
            return Ok(outcome);
        }

        let check = DuplicateCheck {
            shard: &self.shard,
            l2: &self.caches.l2,
            metrics: &self.metrics,
        };
        let outcome = check.classify(self.source.as_mut(), &route, hash, mode)?;
        if let Some(status) = HashStatus::from_outcome(outcome) {
            self.caches.set_status(route.shard, hash, status);
        }
        self.metrics.record_outcome(outcome);
        Ok(outcome)
    }
}
