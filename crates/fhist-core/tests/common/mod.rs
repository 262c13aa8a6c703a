#![allow(dead_code)]

use std::path::Path;

use fhist_core::{BackendKind, HashAlgo, HistoryConfig, HistoryRecord};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Durable store rooted at `dir` with deterministic batching.
pub fn sled_config(dir: &Path) -> HistoryConfig {
    let mut config = HistoryConfig::new(dir);
    config.batch.random_flush_probability = 0.0;
    config.batch.min_interval_ms = 1;
    config.batch.max_interval_ms = 20;
    config.dispatchers = 2;
    config
}

/// Ephemeral index over a log in `dir`.
pub fn memory_config(dir: &Path) -> HistoryConfig {
    let mut config = sled_config(dir);
    config.backend = BackendKind::Memory;
    config
}

/// Sha256-length hash whose first nine characters (shard, bucket and key
/// under the default layout) are `prefix`, padded with `tail`.
pub fn colliding(prefix: &str, tail: char) -> String {
    assert_eq!(prefix.len(), 9);
    let mut hash = prefix.to_owned();
    hash.extend(std::iter::repeat_n(tail, 64 - prefix.len()));
    hash
}

pub fn record(hash: &str, n: usize) -> HistoryRecord {
    HistoryRecord::new(hash, format!("@0301{n:012x}@"))
}

pub fn message_hash(n: usize) -> String {
    HashAlgo::Sha256.digest(format!("<{n}@history.test>").as_bytes())
}
