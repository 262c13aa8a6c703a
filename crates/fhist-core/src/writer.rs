//! The log writer thread.
//!
//! A single thread owns the [`LogWriter`]. For each record it takes the
//! current end of the log as the record's offset, asks the index to insert
//! the hash at that offset and appends the line only when the hash was new.
//! A `Retry` answer means a colliding record is still in the write buffer:
//! the writer flushes, forgets the cached status and asks again.
//!
//! Buffered records are flushed at least every `log_idle_flush_ms`. Each
//! flush raises the log watermark, which is what lets the batch workers
//! commit the index entries of those records.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, Receiver, Sender};
use fhist_cache::CacheHierarchy;
use fhist_error::{HistoryError, Result};
use fhist_log::LogWriter;
use fhist_types::{DedupOutcome, HashAlgo, HistoryConfig, HistoryRecord, QueryMode, ShardId};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::STORE_TARGET;
use crate::dispatcher::IndexHandle;
use crate::metrics::CoreMetrics;
use crate::rebuild::{RebuildReport, rebuild_from_log};

/// Result of adding one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    pub outcome: DedupOutcome,
    /// Where the record was appended; `None` unless `outcome` is `Added`.
    pub offset: Option<u64>,
}

pub(crate) enum WriterCommand {
    Add {
        record: HistoryRecord,
        reply: Sender<Result<WriteReceipt>>,
    },
    Flush {
        durable: bool,
        reply: Sender<Result<()>>,
    },
    Rebuild {
        reply: Sender<Result<RebuildReport>>,
    },
}

/// Owner-side handle of the writer thread.
#[derive(Debug)]
pub(crate) struct WriterHandle {
    commands: Mutex<Option<Sender<WriterCommand>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn writer_gone() -> HistoryError {
    HistoryError::ShutDown {
        component: "log writer",
    }
}

impl WriterHandle {
    pub(crate) fn spawn(
        log: LogWriter,
        index: IndexHandle,
        caches: Arc<CacheHierarchy>,
        metrics: Arc<CoreMetrics>,
        config: &HistoryConfig,
    ) -> Result<Self> {
        let (tx, rx) = channel::bounded(config.writer_queue_capacity);
        let writer = HistoryWriter {
            log,
            index,
            caches,
            metrics,
            algo: config.hash_algo,
            max_requeries: config.max_retry_requeries,
            idle_flush: config.log_idle_flush(),
            last_flush: Instant::now(),
            commands: rx,
            broken: None,
        };
        let thread = thread::Builder::new()
            .name("fhist-writer".to_owned())
            .spawn(move || writer.run())?;
        Ok(Self {
            commands: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn request<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> WriterCommand) -> Result<T> {
        let commands = self.commands.lock().clone().ok_or_else(writer_gone)?;
        let (reply_tx, reply_rx) = channel::bounded(1);
        commands.send(build(reply_tx)).map_err(|_| writer_gone())?;
        reply_rx.recv().map_err(|_| writer_gone())?
    }

    pub(crate) fn add(&self, record: HistoryRecord) -> Result<WriteReceipt> {
        self.request(|reply| WriterCommand::Add { record, reply })
    }

    /// Push buffered records to the file; `durable` also fsyncs.
    pub(crate) fn flush(&self, durable: bool) -> Result<()> {
        self.request(|reply| WriterCommand::Flush { durable, reply })
    }

    pub(crate) fn rebuild(&self) -> Result<RebuildReport> {
        self.request(|reply| WriterCommand::Rebuild { reply })
    }

    /// Let the writer finish queued commands, sync the log and exit.
    pub(crate) fn shutdown(&self) {
        drop(self.commands.lock().take());
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!(target: STORE_TARGET, "log writer panicked");
            }
        }
    }
}

struct HistoryWriter {
    log: LogWriter,
    index: IndexHandle,
    caches: Arc<CacheHierarchy>,
    metrics: Arc<CoreMetrics>,
    algo: HashAlgo,
    max_requeries: u32,
    idle_flush: Duration,
    last_flush: Instant,
    commands: Receiver<WriterCommand>,
    /// Set once a log write fails; the file state is then unknown.
    broken: Option<String>,
}

impl HistoryWriter {
    fn run(mut self) {
        debug!(
            target: STORE_TARGET,
            path = %self.log.path().display(),
            position = self.log.position(),
            "log writer started"
        );
        let commands = self.commands.clone();
        loop {
            channel::select! {
                recv(commands) -> msg => match msg {
                    Ok(command) => {
                        self.execute(command);
                        if self.log.has_unflushed() && self.last_flush.elapsed() >= self.idle_flush {
                            let _ = self.flush_log();
                        }
                    }
                    Err(_) => break,
                },
                default(self.idle_flush) => {
                    let _ = self.flush_log();
                }
            }
            if let Some(detail) = &self.broken {
                error!(
                    target: STORE_TARGET,
                    error = %detail,
                    position = self.log.position(),
                    "log write failed, writer stopping"
                );
                return;
            }
        }
        match self.log.sync() {
            Ok(()) => info!(
                target: STORE_TARGET,
                position = self.log.position(),
                "log writer stopped"
            ),
            Err(err) => error!(target: STORE_TARGET, error = %err, "final log sync failed"),
        }
    }

    fn execute(&mut self, command: WriterCommand) {
        // Replies are best effort; the requester may have stopped waiting.
        match command {
            WriterCommand::Add { record, reply } => {
                let _ = reply.send(self.add(&record));
            }
            WriterCommand::Flush { durable, reply } => {
                let result = if durable {
                    self.last_flush = Instant::now();
                    self.log_op(LogWriter::sync)
                } else {
                    self.flush_log()
                };
                let _ = reply.send(result);
            }
            WriterCommand::Rebuild { reply } => {
                let _ = reply.send(self.rebuild());
            }
        }
    }

    fn log_op<T>(&mut self, op: impl FnOnce(&mut LogWriter) -> Result<T>) -> Result<T> {
        let result = op(&mut self.log);
        if let Err(err) = &result {
            self.broken.get_or_insert_with(|| err.to_string());
        }
        result
    }

    fn flush_log(&mut self) -> Result<()> {
        self.last_flush = Instant::now();
        self.log_op(LogWriter::flush)
    }

    fn add(&mut self, record: &HistoryRecord) -> Result<WriteReceipt> {
        record.validate(self.algo)?;
        let shard = ShardId::of_hash(&record.hash)?;
        let offset = self.log.position();
        let mut requeries = 0;
        loop {
            match self.index.query(&record.hash, QueryMode::insert(offset)?)? {
                DedupOutcome::Added => {
                    self.log_op(|log| log.append_record(record))?;
                    self.metrics.record_append();
                    return Ok(WriteReceipt {
                        outcome: DedupOutcome::Added,
                        offset: Some(offset),
                    });
                }
                DedupOutcome::Duplicate => {
                    return Ok(WriteReceipt {
                        outcome: DedupOutcome::Duplicate,
                        offset: None,
                    });
                }
                DedupOutcome::Retry if requeries < self.max_requeries => {
                    requeries += 1;
                    self.metrics.record_requery();
                    self.flush_log()?;
                    self.caches.forget_status(shard, &record.hash);
                    debug!(
                        target: STORE_TARGET,
                        hash = %record.hash,
                        offset,
                        requeries,
                        "flushed log after retry"
                    );
                }
                DedupOutcome::Retry => {
                    warn!(
                        target: STORE_TARGET,
                        hash = %record.hash,
                        requeries,
                        "record still unresolved after flushing"
                    );
                    return Ok(WriteReceipt {
                        outcome: DedupOutcome::Retry,
                        offset: None,
                    });
                }
                DedupOutcome::Pass => {
                    return Err(HistoryError::internal("insert query answered pass"));
                }
            }
        }
    }

    fn rebuild(&mut self) -> Result<RebuildReport> {
        self.flush_log()?;
        let report = rebuild_from_log(self.log.path(), self.log.position(), self.algo, &self.index)?;
        self.metrics.record_rebuild(report.records);
        Ok(report)
    }
}
