//! Storage engine seam for one index shard.

use std::sync::Arc;

use fhist_error::Result;
use fhist_types::{BackendKind, BucketLayout, HistoryConfig, ShardId};

use crate::memory_backend::MemoryBackend;
use crate::sled_backend::SledBackend;

/// Writes destined for one tree of a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeWrites {
    pub tree: String,
    /// Key/value pairs written unconditionally, at most one per key.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Key-value store behind one shard.
///
/// Implementations own every tree of the shard's [`BucketLayout`]; callers
/// only name trees produced by that layout.
pub trait ShardBackend: Send + Sync + std::fmt::Debug {
    fn shard(&self) -> ShardId;

    /// Read `key` from `tree`.
    fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply `writes` as one atomic unit.
    fn commit(&self, writes: &[TreeWrites]) -> Result<()>;

    /// Make every committed write durable.
    fn flush(&self) -> Result<()>;

    /// Highest log offset recorded by [`Self::raise_high_water`] or
    /// [`Self::reset_high_water`]; 0 when none was.
    fn high_water(&self) -> Result<u64>;

    /// Record that offsets up to `offset` are about to be committed. Lower
    /// values leave the mark unchanged.
    fn raise_high_water(&self, offset: u64) -> Result<()>;

    /// Overwrite the high-water mark.
    fn reset_high_water(&self, offset: u64) -> Result<()>;

    /// Every key/value pair of `tree` in key order.
    fn scan(&self, tree: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Delete `keys` from `tree` as one atomic unit.
    fn remove(&self, tree: &str, keys: &[Vec<u8>]) -> Result<()>;
}

/// Open the backend selected by `config` for `shard`.
pub fn open_backend(config: &HistoryConfig, shard: ShardId) -> Result<Arc<dyn ShardBackend>> {
    let layout: BucketLayout = config.layout();
    Ok(match config.backend {
        BackendKind::Sled => Arc::new(SledBackend::open(
            &config.index_dir(),
            shard,
            layout,
            &config.sled,
        )?),
        BackendKind::Memory => Arc::new(MemoryBackend::new(shard, layout)),
    })
}
