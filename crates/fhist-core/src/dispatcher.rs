//! Request entry point and the dispatcher pool.
//!
//! Every query enters through one bounded channel. A small pool of
//! dispatcher threads takes requests off it and forwards each to the shard
//! worker owning the hash's leading character. Replies travel on a
//! single-slot channel supplied by the caller or created per call.
//!
//! Dropping the pool's stop token ends the dispatchers; once they are gone
//! the shard channels disconnect and the shard workers drain and exit.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{self as channel, Receiver, Sender};
use fhist_error::{HistoryError, Result};
use fhist_types::{DedupOutcome, HashAlgo, QueryMode, ShardId, validate_hash};
use tracing::{debug, error, trace};

use crate::DISPATCH_TARGET;
use crate::shard_worker::ShardRequest;

/// Sender half of a reply channel.
pub type ReplySender = Sender<Result<DedupOutcome>>;

/// A query waiting for a dispatcher.
#[derive(Debug)]
pub struct IndexRequest {
    hash: String,
    mode: QueryMode,
    reply: ReplySender,
}

/// Cloneable handle for issuing queries against a running store.
#[derive(Debug, Clone)]
pub struct IndexHandle {
    entry: Sender<IndexRequest>,
    algo: HashAlgo,
}

impl IndexHandle {
    pub(crate) const fn new(entry: Sender<IndexRequest>, algo: HashAlgo) -> Self {
        Self { entry, algo }
    }

    /// Classify `hash` and wait for the answer.
    pub fn query(&self, hash: &str, mode: QueryMode) -> Result<DedupOutcome> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.submit(hash, mode, reply_tx)?;
        reply_rx.recv().map_err(|_| HistoryError::ShutDown {
            component: "shard worker",
        })?
    }

    /// Queue a query whose answer arrives on `reply`. Misuse is rejected
    /// here, before anything is queued. Blocks while the entry queue is
    /// full.
    pub fn submit(&self, hash: &str, mode: QueryMode, reply: ReplySender) -> Result<()> {
        validate_hash(hash, self.algo)?;
        mode.validate()?;
        self.entry
            .send(IndexRequest {
                hash: hash.to_owned(),
                mode,
                reply,
            })
            .map_err(|_| HistoryError::ShutDown {
                component: "index dispatcher",
            })
    }
}

/// The running dispatcher threads.
#[derive(Debug)]
pub(crate) struct DispatcherPool {
    stop: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl DispatcherPool {
    /// Start `count` dispatchers reading `entry` and forwarding to `shards`
    /// (one sender per shard, in shard order). The pool keeps no shard
    /// senders of its own.
    pub(crate) fn spawn(
        count: usize,
        entry: Receiver<IndexRequest>,
        shards: Vec<Sender<ShardRequest>>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let mut pool = Self {
            stop: Some(stop_tx),
            handles: Vec::with_capacity(count),
        };
        for id in 0..count {
            let dispatcher = Dispatcher {
                entry: entry.clone(),
                stop: stop_rx.clone(),
                shards: shards.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("fhist-dispatch-{id}"))
                .spawn(move || dispatcher.run());
            match handle {
                Ok(handle) => pool.handles.push(handle),
                Err(err) => {
                    pool.shutdown();
                    return Err(err.into());
                }
            }
        }
        debug!(target: DISPATCH_TARGET, dispatchers = count, "dispatcher pool started");
        Ok(pool)
    }

    /// Stop and join every dispatcher. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        drop(self.stop.take());
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(target: DISPATCH_TARGET, "dispatcher panicked");
            }
        }
    }
}

impl Drop for DispatcherPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Dispatcher {
    entry: Receiver<IndexRequest>,
    stop: Receiver<()>,
    shards: Vec<Sender<ShardRequest>>,
}

impl Dispatcher {
    fn run(self) {
        loop {
            channel::select! {
                recv(self.stop) -> _ => break,
                recv(self.entry) -> msg => match msg {
                    Ok(request) => self.forward(request),
                    Err(_) => break,
                },
            }
        }
        trace!(target: DISPATCH_TARGET, "dispatcher stopped");
    }

    fn forward(&self, request: IndexRequest) {
        let IndexRequest { hash, mode, reply } = request;
        let shard = match ShardId::of_hash(&hash) {
            Ok(shard) => shard,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let routed = ShardRequest { hash, mode, reply };
        if let Err(channel::SendError(lost)) = self.shards[shard.index()].send(routed) {
            let _ = lost.reply.send(Err(HistoryError::ShutDown {
                component: "shard worker",
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn pool_with_echo() -> (DispatcherPool, IndexHandle, Vec<JoinHandle<Vec<char>>>) {
        let (entry_tx, entry_rx) = channel::bounded(8);
        let mut senders = Vec::new();
        let mut echoes = Vec::new();
        for shard in ShardId::all() {
            let (tx, rx) = channel::bounded::<ShardRequest>(4);
            senders.push(tx);
            echoes.push(thread::spawn(move || {
                let mut seen = Vec::new();
                for request in rx {
                    seen.push(request.hash.chars().next().expect("hash"));
                    let outcome = if request.mode.is_search() {
                        DedupOutcome::Pass
                    } else {
                        DedupOutcome::Added
                    };
                    assert_eq!(request.hash.as_bytes()[0], shard.as_char() as u8);
                    request.reply.send(Ok(outcome)).expect("reply");
                }
                seen
            }));
        }
        let pool = DispatcherPool::spawn(3, entry_rx, senders).expect("spawn");
        (pool, IndexHandle::new(entry_tx, HashAlgo::Xxh3_128), echoes)
    }

    #[test]
    fn routes_by_leading_character() {
        let (mut pool, handle, echoes) = pool_with_echo();
        for c in "0123456789abcdef".chars() {
            let hash = format!("{c}{}", "5".repeat(31));
            assert_eq!(
                handle.query(&hash, QueryMode::Insert(128)).expect("query"),
                DedupOutcome::Added
            );
        }
        let hash = "e".repeat(32);
        assert_eq!(
            handle.query(&hash, QueryMode::Search).expect("query"),
            DedupOutcome::Pass
        );

        pool.shutdown();
        let seen: Vec<Vec<char>> = echoes
            .into_iter()
            .map(|echo| echo.join().expect("join"))
            .collect();
        assert_eq!(seen[0xe], vec!['e', 'e']);
        assert_eq!(seen[0x3], vec!['3']);
    }

    #[test]
    fn misuse_is_rejected_before_queueing() {
        let (_pool, handle, _echoes) = pool_with_echo();
        assert!(matches!(
            handle.query("XYZ", QueryMode::Search),
            Err(HistoryError::InvalidHash { .. })
        ));
        assert!(matches!(
            handle.query(&"a".repeat(32), QueryMode::Insert(0)),
            Err(HistoryError::InvalidOffset(0))
        ));
    }

    #[test]
    fn caller_supplied_reply_channel() {
        let (_pool, handle, _echoes) = pool_with_echo();
        let (reply_tx, reply_rx) = channel::bounded(1);
        handle
            .submit(&"7".repeat(32), QueryMode::Search, reply_tx)
            .expect("submit");
        let outcome = reply_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("reply")
            .expect("outcome");
        assert_eq!(outcome, DedupOutcome::Pass);
    }

    #[test]
    fn stopped_pool_reports_shutdown() {
        let (mut pool, handle, _echoes) = pool_with_echo();
        pool.shutdown();
        let err = handle
            .query(&"1".repeat(32), QueryMode::Search)
            .expect_err("stopped");
        assert!(matches!(err, HistoryError::ShutDown { .. }), "{err}");
    }
}
