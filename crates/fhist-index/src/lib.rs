//! Sharded duplicate index.
//!
//! Sixteen independently opened shard stores, one per leading hex
//! character of a hash. Each shard is split into a fixed set of root buckets
//! (and optional sub-buckets) created when the store is first opened. Index
//! entries map a truncated hash key to the encoded list of log offsets where
//! hashes sharing that key were written.
//!
//! Writes never go to the store inline: [`IndexShard::enqueue`] hands them
//! to the bucket's batch worker, which commits them in groups.

pub mod adaptive;
pub mod backend;
pub mod batch;
pub mod memory_backend;
pub mod metrics;
pub mod shard;
pub mod sled_backend;

pub use adaptive::AdaptiveTimer;
pub use backend::{ShardBackend, TreeWrites, open_backend};
pub use batch::{BatchControl, BatchItem};
pub use memory_backend::MemoryBackend;
pub use metrics::{IndexMetrics, IndexMetricsSnapshot};
pub use shard::{IndexShard, PruneStats, ShardedIndex};
pub use sled_backend::SledBackend;

/// Tracing target for shard store events.
pub const INDEX_TARGET: &str = "fhist.index";
/// Tracing target for batch worker events.
pub const BATCH_TARGET: &str = "fhist.batch";
