//! Store configuration.
//!
//! A [`HistoryConfig`] is built once and handed to the store at open time;
//! nothing reads configuration from globals. The creation-time fields
//! (`hash_algo`, `bucket_chars`, `key_index`, `key_len`, `offset_base`) are
//! persisted in the log header and checked on every later open. Batch, cache
//! and replay tuning may change between restarts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fhist_error::{HistoryError, Result};
use serde::{Deserialize, Serialize};

use crate::codec::OffsetBase;
use crate::hash::HashAlgo;
use crate::route::BucketLayout;

/// Storage engine behind each index shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Durable `sled` database per shard.
    #[default]
    Sled,
    /// Process-local maps; nothing survives a restart.
    Memory,
}

/// What boot-time replay does with log records missing from the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Do not scan the log at boot.
    Skip,
    /// Scan, report missing records and refuse to open if any exist.
    #[default]
    Verify,
    /// Scan and reinsert missing records.
    Repair,
}

/// Batch-write pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items per committed batch before a non-forced commit fires.
    pub batch_size: usize,
    /// Capacity of each bucket queue; enqueue blocks when full.
    pub queue_capacity: usize,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Oldest pending item age that forces a commit.
    pub max_flush_latency_ms: u64,
    /// Chance that an idle tick forces a commit, spreading commits over time.
    pub random_flush_probability: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            queue_capacity: 4096,
            min_interval_ms: 5,
            max_interval_ms: 250,
            max_flush_latency_ms: 1_000,
            random_flush_probability: 0.01,
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    #[must_use]
    pub const fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    #[must_use]
    pub const fn max_flush_latency(&self) -> Duration {
        Duration::from_millis(self.max_flush_latency_ms)
    }
}

/// Cache hierarchy tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_ttl_ms: u64,
    pub l2_ttl_ms: u64,
    pub l3_ttl_ms: u64,
    /// TTL of L1 `Retry` entries; kept short so a flushed record is seen soon.
    pub retry_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    /// Starting (and minimum) map capacity of each cache shard.
    pub initial_capacity: usize,
    /// Occupancy percentage that doubles a shard's capacity.
    pub grow_threshold_pct: u8,
    /// Occupancy percentage under which a sweep shrinks the map.
    pub shrink_threshold_pct: u8,
    /// Capacity of each shard's extend-signal channel.
    pub extend_queue_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_ttl_ms: 5_000,
            l2_ttl_ms: 5_000,
            l3_ttl_ms: 10_000,
            retry_ttl_ms: 500,
            sweep_interval_ms: 1_000,
            initial_capacity: 1_024,
            grow_threshold_pct: 98,
            shrink_threshold_pct: 25,
            extend_queue_capacity: 4_096,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn l1_ttl(&self) -> Duration {
        Duration::from_millis(self.l1_ttl_ms)
    }

    #[must_use]
    pub const fn l2_ttl(&self) -> Duration {
        Duration::from_millis(self.l2_ttl_ms)
    }

    #[must_use]
    pub const fn l3_ttl(&self) -> Duration {
        Duration::from_millis(self.l3_ttl_ms)
    }

    #[must_use]
    pub const fn retry_ttl(&self) -> Duration {
        Duration::from_millis(self.retry_ttl_ms)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Boot-time replay tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub policy: RecoveryPolicy,
    /// Consecutive confirmed records after the most recent miss that end the
    /// scan. Older history is assumed to be indexed once this many recent
    /// records were all found.
    pub distance_threshold: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            policy: RecoveryPolicy::Verify,
            distance_threshold: 10_000,
        }
    }
}

/// Per-shard `sled` tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SledConfig {
    pub cache_capacity_bytes: u64,
    /// Background flush period; `None` leaves durability to explicit syncs.
    pub flush_every_ms: Option<u64>,
    /// Trees created per chunk when laying out a new shard.
    pub layout_chunk: usize,
}

impl Default for SledConfig {
    fn default() -> Self {
        Self {
            cache_capacity_bytes: 16 * 1024 * 1024,
            flush_every_ms: Some(1_000),
            layout_chunk: 256,
        }
    }
}

/// Complete store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Directory holding `history.dat` and `index/`.
    pub base_dir: PathBuf,
    pub hash_algo: HashAlgo,
    pub bucket_chars: u8,
    pub key_index: u8,
    pub key_len: u8,
    pub offset_base: OffsetBase,
    pub backend: BackendKind,
    /// Dispatcher threads routing requests to shard workers.
    pub dispatchers: usize,
    pub request_queue_capacity: usize,
    pub shard_queue_capacity: usize,
    pub writer_queue_capacity: usize,
    pub log_buffer_bytes: usize,
    /// Longest time a record stays in the writer's buffer. Index entries
    /// for a record are committed only after it has been flushed.
    pub log_idle_flush_ms: u64,
    /// Flush-and-requery attempts the writer makes on a `Retry`.
    pub max_retry_requeries: u32,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub replay: ReplayConfig,
    pub sled: SledConfig,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("history"),
            hash_algo: HashAlgo::Sha256,
            bucket_chars: 1,
            key_index: 0,
            key_len: 7,
            offset_base: OffsetBase::Hex,
            backend: BackendKind::Sled,
            dispatchers: 4,
            request_queue_capacity: 1_024,
            shard_queue_capacity: 256,
            writer_queue_capacity: 1_024,
            log_buffer_bytes: 64 * 1024,
            log_idle_flush_ms: 100,
            max_retry_requeries: 3,
            batch: BatchConfig::default(),
            cache: CacheConfig::default(),
            replay: ReplayConfig::default(),
            sled: SledConfig::default(),
        }
    }
}

impl HistoryConfig {
    /// Default configuration rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document; omitted fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|err| HistoryError::config(format!("toml: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    #[must_use]
    pub const fn layout(&self) -> BucketLayout {
        BucketLayout::new(self.bucket_chars, self.key_index, self.key_len)
    }

    #[must_use]
    pub const fn log_idle_flush(&self) -> Duration {
        Duration::from_millis(self.log_idle_flush_ms)
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.base_dir.join("history.dat")
    }

    #[must_use]
    pub fn index_dir(&self) -> PathBuf {
        self.base_dir.join("index")
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.bucket_chars) {
            return Err(HistoryError::config(format!(
                "bucket_chars must be 1..=3, got {}",
                self.bucket_chars
            )));
        }
        if self.key_index > 2 {
            return Err(HistoryError::config(format!(
                "key_index must be 0..=2, got {}",
                self.key_index
            )));
        }
        if self.key_len == 0 {
            return Err(HistoryError::config("key_len must be at least 1"));
        }
        let needed = self.layout().min_hash_len();
        if needed > self.hash_algo.hex_len() {
            return Err(HistoryError::config(format!(
                "layout consumes {needed} hash characters but {} digests have {}",
                self.hash_algo.as_str(),
                self.hash_algo.hex_len()
            )));
        }
        let positive = [
            ("dispatchers", self.dispatchers),
            ("request_queue_capacity", self.request_queue_capacity),
            ("shard_queue_capacity", self.shard_queue_capacity),
            ("writer_queue_capacity", self.writer_queue_capacity),
            ("log_buffer_bytes", self.log_buffer_bytes),
            ("batch.batch_size", self.batch.batch_size),
            ("batch.queue_capacity", self.batch.queue_capacity),
            ("cache.initial_capacity", self.cache.initial_capacity),
            ("cache.extend_queue_capacity", self.cache.extend_queue_capacity),
            ("sled.layout_chunk", self.sled.layout_chunk),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(HistoryError::config(format!("{name} must be greater than zero")));
        }
        if self.log_idle_flush_ms == 0 {
            return Err(HistoryError::config("log_idle_flush_ms must be greater than zero"));
        }
        if self.batch.min_interval_ms == 0 || self.batch.min_interval_ms > self.batch.max_interval_ms
        {
            return Err(HistoryError::config(format!(
                "batch interval bounds invalid: min {} ms, max {} ms",
                self.batch.min_interval_ms, self.batch.max_interval_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.batch.random_flush_probability) {
            return Err(HistoryError::config(format!(
                "batch.random_flush_probability must be within [0, 1], got {}",
                self.batch.random_flush_probability
            )));
        }
        if self.cache.sweep_interval_ms == 0 {
            return Err(HistoryError::config("cache.sweep_interval_ms must be greater than zero"));
        }
        if self.cache.shrink_threshold_pct >= self.cache.grow_threshold_pct
            || self.cache.grow_threshold_pct > 100
        {
            return Err(HistoryError::config(format!(
                "cache thresholds invalid: shrink {}%, grow {}%",
                self.cache.shrink_threshold_pct, self.cache.grow_threshold_pct
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        HistoryConfig::default().validate().expect("defaults are valid");
        assert_eq!(HistoryConfig::default().layout().root_buckets(), 16);
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = HistoryConfig::from_toml_str(
            r#"
            base_dir = "/var/spool/history"
            hash_algo = "xxh3_128"
            bucket_chars = 2
            key_len = 6
            offset_base = "decimal"

            [batch]
            batch_size = 32

            [replay]
            policy = "repair"
            distance_threshold = 500
            "#,
        )
        .expect("parse");
        assert_eq!(config.base_dir, PathBuf::from("/var/spool/history"));
        assert_eq!(config.hash_algo, HashAlgo::Xxh3_128);
        assert_eq!(config.offset_base, OffsetBase::Decimal);
        assert_eq!(config.batch.batch_size, 32);
        assert_eq!(config.batch.queue_capacity, BatchConfig::default().queue_capacity);
        assert_eq!(config.replay.policy, RecoveryPolicy::Repair);
        assert_eq!(config.replay.distance_threshold, 500);
        assert_eq!(config.log_path(), PathBuf::from("/var/spool/history/history.dat"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.toml");
        std::fs::write(&path, "key_len = 9\n").expect("write");
        let config = HistoryConfig::load(&path).expect("load");
        assert_eq!(config.key_len, 9);
    }

    #[test]
    fn rejects_inconsistent_settings() {
        let mut config = HistoryConfig::default();
        config.bucket_chars = 4;
        assert!(config.validate().is_err());

        let mut config = HistoryConfig::default();
        config.hash_algo = HashAlgo::Xxh3_128;
        config.key_len = 40;
        assert!(config.validate().is_err());

        let mut config = HistoryConfig::default();
        config.batch.min_interval_ms = 500;
        config.batch.max_interval_ms = 10;
        assert!(config.validate().is_err());

        let mut config = HistoryConfig::default();
        config.batch.random_flush_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = HistoryConfig::default();
        config.dispatchers = 0;
        let err = config.validate().expect_err("zero dispatchers");
        assert!(err.to_string().contains("dispatchers"), "{err}");
    }

    #[test]
    fn serializes_to_json_for_reports() {
        let json = serde_json::to_value(HistoryConfig::default()).expect("json");
        assert_eq!(json["hash_algo"], "sha256");
        assert_eq!(json["replay"]["policy"], "verify");
    }
}
