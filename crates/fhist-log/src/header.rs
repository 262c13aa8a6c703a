//! Store header at offset 0 of the history log.
//!
//! Layout (128 bytes, little-endian integer fields):
//! - `magic[8]` = `"FHISTLOG"`
//! - `version: u32`
//! - `hash_algo: u8`, `bucket_chars: u8`, `key_index: u8`, `key_len: u8`
//! - `offset_base: u8`, then 7 reserved zero bytes
//! - `created_at: u64` (unix seconds)
//! - `header_xxh3: u64` (hash of the preceding 32 bytes)
//! - zero padding, with a `\n` in the final byte so line tools treat the
//!   header as one line

use fhist_error::{HistoryError, Result};
use fhist_types::{HashAlgo, HistoryConfig, OffsetBase};
use xxhash_rust::xxh3::xxh3_64;

/// Magic bytes at the start of every history log.
pub const LOG_MAGIC: [u8; 8] = *b"FHISTLOG";
/// Current header format version.
pub const LOG_VERSION: u32 = 1;
/// Exact byte size of [`LogHeader`] on disk; the first record starts here.
pub const LOG_HEADER_BYTES: usize = 128;

const HASH_INPUT_BYTES: usize = 32;

/// Creation-time parameters of a store, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub hash_algo: HashAlgo,
    pub bucket_chars: u8,
    pub key_index: u8,
    pub key_len: u8,
    pub offset_base: OffsetBase,
    pub created_at: u64,
}

impl LogHeader {
    /// Header describing a new store created from `config`.
    #[must_use]
    pub const fn from_config(config: &HistoryConfig, created_at: u64) -> Self {
        Self {
            hash_algo: config.hash_algo,
            bucket_chars: config.bucket_chars,
            key_index: config.key_index,
            key_len: config.key_len,
            offset_base: config.offset_base,
            created_at,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; LOG_HEADER_BYTES] {
        let mut out = [0_u8; LOG_HEADER_BYTES];
        out[0..8].copy_from_slice(&LOG_MAGIC);
        out[8..12].copy_from_slice(&LOG_VERSION.to_le_bytes());
        out[12] = self.hash_algo.code();
        out[13] = self.bucket_chars;
        out[14] = self.key_index;
        out[15] = self.key_len;
        out[16] = self.offset_base.code();
        out[24..32].copy_from_slice(&self.created_at.to_le_bytes());
        let checksum = xxh3_64(&out[..HASH_INPUT_BYTES]);
        out[32..40].copy_from_slice(&checksum.to_le_bytes());
        out[LOG_HEADER_BYTES - 1] = b'\n';
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LOG_HEADER_BYTES {
            return Err(corrupt(format!(
                "header too short: expected {LOG_HEADER_BYTES}, got {}",
                bytes.len()
            )));
        }
        if bytes[0..8] != LOG_MAGIC {
            return Err(corrupt(format!("invalid magic: {:02X?}", &bytes[0..8])));
        }

        let version = u32::from_le_bytes(field(bytes, 8)?);
        if version != LOG_VERSION {
            return Err(corrupt(format!(
                "unsupported version {version}, expected {LOG_VERSION}"
            )));
        }

        let stored_checksum = u64::from_le_bytes(field(bytes, 32)?);
        let computed_checksum = xxh3_64(&bytes[..HASH_INPUT_BYTES]);
        if stored_checksum != computed_checksum {
            return Err(corrupt(format!(
                "checksum mismatch: stored {stored_checksum:#018X}, computed {computed_checksum:#018X}"
            )));
        }

        let hash_algo = HashAlgo::from_code(bytes[12])
            .ok_or_else(|| corrupt(format!("unknown hash algorithm code {}", bytes[12])))?;
        let offset_base = OffsetBase::from_code(bytes[16])
            .ok_or_else(|| corrupt(format!("unknown offset base code {}", bytes[16])))?;

        Ok(Self {
            hash_algo,
            bucket_chars: bytes[13],
            key_index: bytes[14],
            key_len: bytes[15],
            offset_base,
            created_at: u64::from_le_bytes(field(bytes, 24)?),
        })
    }

    /// Fail with [`HistoryError::HeaderMismatch`] on the first creation-time
    /// field that differs from `config`.
    pub fn ensure_matches(&self, config: &HistoryConfig) -> Result<()> {
        let checks: [(&'static str, String, String); 5] = [
            (
                "hash_algo",
                self.hash_algo.as_str().to_owned(),
                config.hash_algo.as_str().to_owned(),
            ),
            (
                "bucket_chars",
                self.bucket_chars.to_string(),
                config.bucket_chars.to_string(),
            ),
            (
                "key_index",
                self.key_index.to_string(),
                config.key_index.to_string(),
            ),
            ("key_len", self.key_len.to_string(), config.key_len.to_string()),
            (
                "offset_base",
                self.offset_base.radix().to_string(),
                config.offset_base.radix().to_string(),
            ),
        ];
        for (field, stored, configured) in checks {
            if stored != configured {
                return Err(HistoryError::HeaderMismatch {
                    field,
                    stored,
                    configured,
                });
            }
        }
        Ok(())
    }
}

fn field<const N: usize>(bytes: &[u8], start: usize) -> Result<[u8; N]> {
    bytes
        .get(start..start + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| corrupt(format!("field at {start} out of bounds")))
}

fn corrupt(detail: String) -> HistoryError {
    HistoryError::HeaderCorrupt { detail }
}
