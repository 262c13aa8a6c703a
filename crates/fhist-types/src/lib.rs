//! Core type definitions shared by the fhistory crates.
//!
//! - [`hash`]: digest algorithms and hash validation
//! - [`route`]: shard / bucket / key derivation from a hash
//! - [`codec`]: persisted form of index offset lists
//! - [`record`]: history log record format
//! - [`outcome`]: duplicate-check results and query modes
//! - [`config`]: store configuration
//! - [`watermark`]: flushed end of the log shared with index writers

pub mod codec;
pub mod config;
pub mod hash;
pub mod outcome;
pub mod record;
pub mod route;
pub mod watermark;

pub use codec::{OFFSET_DELIMITER, OffsetBase, Offsets, append_offset, decode_offsets, encode_offsets};
pub use config::{
    BackendKind, BatchConfig, CacheConfig, HistoryConfig, RecoveryPolicy, ReplayConfig,
    SledConfig,
};
pub use hash::{ADMISSIBLE_HASH_LENGTHS, HashAlgo, validate_hash};
pub use outcome::{DedupOutcome, HashStatus, QueryMode};
pub use record::{Expiry, HistoryRecord, NEVER_EXPIRES};
pub use route::{BucketLayout, Route, SHARD_COUNT, ShardId};
pub use watermark::LogWatermark;
