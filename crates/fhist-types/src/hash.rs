//! Digest algorithms and hash validation.

use fhist_error::{HistoryError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use xxhash_rust::xxh3::xxh3_128;

/// Hex digest lengths a history log may carry.
///
/// The tail scanner uses this set to infer the digest length of an existing
/// log from its most recent record.
pub const ADMISSIBLE_HASH_LENGTHS: [usize; 3] = [32, 64, 128];

/// Digest used to derive a record hash from a message identifier.
///
/// The store itself is algorithm-agnostic; the algorithm only fixes the hex
/// length every hash of one store instance must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgo {
    #[default]
    Sha256,
    Sha512,
    Xxh3_128,
}

impl HashAlgo {
    /// Number of lowercase hex characters in one digest.
    #[must_use]
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
            Self::Xxh3_128 => 32,
        }
    }

    /// Stable one-byte code persisted in the store header.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Sha256 => 1,
            Self::Sha512 => 2,
            Self::Xxh3_128 => 3,
        }
    }

    /// Inverse of [`HashAlgo::code`].
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Sha256),
            2 => Some(Self::Sha512),
            3 => Some(Self::Xxh3_128),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Xxh3_128 => "xxh3_128",
        }
    }

    /// Lowercase hex digest of `input`.
    #[must_use]
    pub fn digest(self, input: &[u8]) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(input)),
            Self::Sha512 => hex::encode(Sha512::digest(input)),
            Self::Xxh3_128 => format!("{:032x}", xxh3_128(input)),
        }
    }
}

/// Reject anything that is not a lowercase hex digest of `algo`'s length.
pub fn validate_hash(hash: &str, algo: HashAlgo) -> Result<()> {
    let reason = if hash.is_empty() {
        Some("hash is empty")
    } else if hash.len() != algo.hex_len() {
        Some("hash length does not match the configured digest")
    } else if !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        Some("hash must be lowercase hex")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(HistoryError::InvalidHash {
            hash: hash.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}
