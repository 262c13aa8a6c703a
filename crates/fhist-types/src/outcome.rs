//! Duplicate-check results and query modes.

use std::fmt;

use fhist_error::{HistoryError, Result};
use serde::{Deserialize, Serialize};

/// Classification of one hash by the duplicate-check protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupOutcome {
    /// New hash; an index write was enqueued.
    Added,
    /// The hash is already recorded.
    Duplicate,
    /// A referenced log record is not yet visible; flush the log and ask again.
    Retry,
    /// Search-only query for an unknown hash; nothing was stored.
    Pass,
}

impl DedupOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Duplicate => "duplicate",
            Self::Retry => "retry",
            Self::Pass => "pass",
        }
    }
}

impl fmt::Display for DedupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known status of a hash, as memoized in the L1 cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashStatus {
    Added,
    Duplicate,
    Retry,
}

impl HashStatus {
    /// Status worth caching for an outcome; `Pass` stores nothing.
    #[must_use]
    pub const fn from_outcome(outcome: DedupOutcome) -> Option<Self> {
        match outcome {
            DedupOutcome::Added => Some(Self::Added),
            DedupOutcome::Duplicate => Some(Self::Duplicate),
            DedupOutcome::Retry => Some(Self::Retry),
            DedupOutcome::Pass => None,
        }
    }

    /// Answer served from the cache: a hash seen as added is a duplicate now.
    #[must_use]
    pub const fn cached_outcome(self) -> DedupOutcome {
        match self {
            Self::Added | Self::Duplicate => DedupOutcome::Duplicate,
            Self::Retry => DedupOutcome::Retry,
        }
    }
}

/// What a query asks of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMode {
    /// Record the hash at this log offset unless it is a duplicate.
    Insert(u64),
    /// Classify only; never mutate the index.
    Search,
}

impl QueryMode {
    /// Insert intent at `offset`; zero is rejected because the store header
    /// occupies the start of the log.
    pub fn insert(offset: u64) -> Result<Self> {
        if offset == 0 {
            return Err(HistoryError::InvalidOffset(offset));
        }
        Ok(Self::Insert(offset))
    }

    #[must_use]
    pub const fn is_search(self) -> bool {
        matches!(self, Self::Search)
    }

    #[must_use]
    pub const fn offset(self) -> Option<u64> {
        match self {
            Self::Insert(offset) => Some(offset),
            Self::Search => None,
        }
    }

    /// Reject an `Insert(0)` built without [`QueryMode::insert`].
    pub fn validate(self) -> Result<()> {
        match self {
            Self::Insert(0) => Err(HistoryError::InvalidOffset(0)),
            _ => Ok(()),
        }
    }
}
