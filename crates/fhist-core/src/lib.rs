//! Message-deduplication history store.
//!
//! A [`HistoryStore`] answers, for each incoming hash, whether it was seen
//! before and records it durably when it was not. Records go to an
//! append-only log whose byte offsets identify them; a sharded index maps
//! truncated hashes to the offsets of records that may carry them, and
//! three cache tiers sit in front of both.
//!
//! ```text
//! add ─▶ writer ─▶ dispatcher ─▶ shard worker ─▶ duplicate check
//!                                                 │   ├─ L1/L2/L3 caches
//!                                                 │   ├─ index shard (batched writes)
//!                                                 │   └─ log reads
//!          └─ append to log when Added
//! ```
//!
//! At boot the log tail is replayed against the index
//! ([`replay`]); [`HistoryStore::rebuild_from_log`] re-derives the whole
//! index from the log.

pub mod dedup;
pub mod dispatcher;
pub mod metrics;
pub mod rebuild;
pub mod replay;
mod shard_worker;
pub mod store;
pub mod writer;

pub use dedup::DuplicateCheck;
pub use dispatcher::{IndexHandle, IndexRequest, ReplySender};
pub use metrics::{CoreMetrics, CoreMetricsSnapshot, StoreMetricsSnapshot};
pub use rebuild::{RebuildReport, rebuild_from_log};
pub use replay::{AheadReport, MissingRecord, ReplayReport};
pub use store::HistoryStore;
pub use writer::WriteReceipt;

pub use fhist_error::{ErrorClass, HistoryError, Result};
pub use fhist_types::{
    BackendKind, DedupOutcome, HashAlgo, HistoryConfig, HistoryRecord, QueryMode,
    RecoveryPolicy,
};

/// Tracing target for dispatch and duplicate-check events.
pub const DISPATCH_TARGET: &str = "fhist.dispatch";
/// Tracing target for replay and rebuild events.
pub const REPLAY_TARGET: &str = "fhist.replay";
/// Tracing target for store lifecycle and writer events.
pub const STORE_TARGET: &str = "fhist.store";
