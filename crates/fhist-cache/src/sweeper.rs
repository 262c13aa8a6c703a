//! Background expiry threads, one per tier shard.
//!
//! Each thread waits on its shard's extend queue, the shared stop channel
//! and the next sweep deadline. Dropping the stop sender ends every thread
//! of the set.

use std::hash::Hash;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, Receiver, Sender};
use fhist_error::{HistoryError, Result};
use fhist_types::ShardId;
use tracing::{debug, error};

use crate::CACHE_TARGET;
use crate::tiers::TtlCache;

/// Sweeper threads of one or more tiers sharing a stop signal.
#[derive(Debug)]
pub struct SweeperSet {
    interval: Duration,
    stop_tx: Option<Sender<()>>,
    stop_rx: Receiver<()>,
    handles: Vec<JoinHandle<()>>,
}

impl SweeperSet {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        let (stop_tx, stop_rx) = channel::bounded(0);
        Self {
            interval,
            stop_tx: Some(stop_tx),
            stop_rx,
            handles: Vec::new(),
        }
    }

    /// Start one sweeper per shard of `cache`.
    pub fn spawn_tier<K, V>(&mut self, cache: &Arc<TtlCache<K, V>>) -> Result<()>
    where
        K: Eq + Hash + Send + 'static,
        V: Clone + Send + 'static,
    {
        let receivers = cache.take_extend_receivers().ok_or_else(|| {
            HistoryError::internal(format!("sweepers already started for tier {}", cache.name()))
        })?;
        for (shard, extend_rx) in ShardId::all().zip(receivers) {
            let cache = Arc::clone(cache);
            let stop_rx = self.stop_rx.clone();
            let interval = self.interval;
            let handle = thread::Builder::new()
                .name(format!("fhist-sweep-{}-{shard}", cache.name()))
                .spawn(move || sweep_loop(&cache, shard, &extend_rx, &stop_rx, interval))?;
            self.handles.push(handle);
        }
        debug!(
            target: CACHE_TARGET,
            tier = cache.name(),
            interval_ms = self.interval.as_millis() as u64,
            "started cache sweepers"
        );
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every sweeper to stop and wait for it.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        drop(self.stop_tx.take());
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(target: CACHE_TARGET, "cache sweeper thread panicked");
            }
        }
    }
}

impl Drop for SweeperSet {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn sweep_loop<K, V>(
    cache: &TtlCache<K, V>,
    shard: ShardId,
    extend_rx: &Receiver<K>,
    stop_rx: &Receiver<()>,
    interval: Duration,
) where
    K: Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    let mut next_sweep = Instant::now() + interval;
    loop {
        let wait = next_sweep.saturating_duration_since(Instant::now());
        channel::select! {
            recv(stop_rx) -> _ => break,
            recv(extend_rx) -> msg => {
                let Ok(key) = msg else { break };
                cache.apply_extend(shard, &key);
            },
            default(wait) => {},
        }
        // Extend traffic must not starve the sweep.
        if Instant::now() >= next_sweep {
            cache.sweep(shard);
            next_sweep = Instant::now() + interval;
        }
    }
}
