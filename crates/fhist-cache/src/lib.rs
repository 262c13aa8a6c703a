//! Three-tier short-TTL cache in front of the index and the log.
//!
//! Every tier is split into [`SHARD_COUNT`](fhist_types::SHARD_COUNT)
//! independently locked maps selected by the queried hash's shard. Entries
//! expire lazily on read and are evicted by one sweeper thread per shard.
//! Nothing cached is authoritative: a miss always falls through to the index
//! or the log.

mod shard;
pub mod sweeper;
pub mod tiers;

pub use sweeper::SweeperSet;
pub use tiers::{
    CacheHierarchy, CacheHierarchySnapshot, CacheStatsSnapshot, HashByOffsetCache,
    OffsetsCache, StatusCache, TtlCache,
};

/// Tracing target for cache events.
pub const CACHE_TARGET: &str = "fhist.cache";
