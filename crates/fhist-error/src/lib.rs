//! Error type shared by every fhistory crate.
//!
//! Each [`HistoryError`] variant belongs to exactly one [`ErrorClass`]. The
//! class drives how the owning worker reacts: integrity and transaction
//! failures stop the worker that observed them, misuse is rejected before any
//! state changes, and shutdown errors surface to callers whose request can no
//! longer be answered.

use std::fmt;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Coarse classification of a [`HistoryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// On-disk state is malformed; the affected worker cannot continue.
    Integrity,
    /// A condition that resolves by retrying after a flush.
    Transient,
    /// An index-store commit failed; the owning bucket worker stops.
    Transaction,
    /// The caller violated the entry-point contract.
    Misuse,
    /// A bounded resource is exhausted.
    Resource,
    /// The component that should answer has stopped.
    Shutdown,
    /// Plain I/O failure outside the log envelope checks.
    Io,
    /// Invariant violation inside the engine.
    Internal,
}

impl ErrorClass {
    /// Stable label used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Integrity => "integrity",
            Self::Transient => "transient",
            Self::Transaction => "transaction",
            Self::Misuse => "misuse",
            Self::Resource => "resource",
            Self::Shutdown => "shutdown",
            Self::Io => "io",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the history log, caches, index and store.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("history log corrupt at offset {offset}: {detail}")]
    LogCorrupt { offset: u64, detail: String },

    #[error("encoded offset list corrupt: {detail}")]
    OffsetsCorrupt { detail: String },

    #[error("store header corrupt: {detail}")]
    HeaderCorrupt { detail: String },

    #[error("store header mismatch for {field}: stored {stored}, configured {configured}")]
    HeaderMismatch {
        field: &'static str,
        stored: String,
        configured: String,
    },

    #[error("index layout mismatch on shard {shard}: stored {stored:?}, expected {expected:?}")]
    LayoutMismatch {
        shard: char,
        stored: String,
        expected: String,
    },

    #[error("index store {op} failed on shard {shard}: {detail}")]
    IndexStore {
        op: &'static str,
        shard: char,
        detail: String,
    },

    #[error("batch worker for bucket {shard}{bucket} has stopped")]
    BucketStopped { shard: char, bucket: String },

    #[error("invalid hash {hash:?}: {reason}")]
    InvalidHash { hash: String, reason: &'static str },

    #[error("invalid log offset {0}: offsets must be greater than zero")]
    InvalidOffset(u64),

    #[error("invalid history record: {detail}")]
    InvalidRecord { detail: String },

    #[error("invalid configuration: {detail}")]
    Config { detail: String },

    #[error("request queue full: {what}")]
    QueueFull { what: &'static str },

    #[error("{component} has shut down")]
    ShutDown { component: &'static str },

    #[error("replay found {missing} log records missing from the index")]
    IndexBehindLog { missing: usize },

    #[error("{shards} index shards reference offsets at or past the log end {log_end}")]
    IndexAheadOfLog { shards: usize, log_end: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl HistoryError {
    /// Build an [`HistoryError::Internal`] from any message.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Build an [`HistoryError::LogCorrupt`] at `offset`.
    #[must_use]
    pub fn log_corrupt(offset: u64, detail: impl Into<String>) -> Self {
        Self::LogCorrupt {
            offset,
            detail: detail.into(),
        }
    }

    /// Build an [`HistoryError::OffsetsCorrupt`].
    #[must_use]
    pub fn offsets_corrupt(detail: impl Into<String>) -> Self {
        Self::OffsetsCorrupt {
            detail: detail.into(),
        }
    }

    /// Build an [`HistoryError::Config`].
    #[must_use]
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }

    /// Which class of failure this is.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) => ErrorClass::Io,
            Self::LogCorrupt { .. }
            | Self::OffsetsCorrupt { .. }
            | Self::HeaderCorrupt { .. }
            | Self::HeaderMismatch { .. }
            | Self::LayoutMismatch { .. }
            | Self::IndexBehindLog { .. }
            | Self::IndexAheadOfLog { .. } => ErrorClass::Integrity,
            Self::IndexStore { .. } | Self::BucketStopped { .. } => ErrorClass::Transaction,
            Self::InvalidHash { .. }
            | Self::InvalidOffset(_)
            | Self::InvalidRecord { .. }
            | Self::Config { .. } => ErrorClass::Misuse,
            Self::QueueFull { .. } => ErrorClass::Resource,
            Self::ShutDown { .. } => ErrorClass::Shutdown,
            Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// True when the worker that observed this error must stop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Integrity | ErrorClass::Transaction | ErrorClass::Internal
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(
            HistoryError::log_corrupt(7, "missing brace").class(),
            ErrorClass::Integrity
        );
        assert_eq!(
            HistoryError::offsets_corrupt("no trailing delimiter").class(),
            ErrorClass::Integrity
        );
        assert_eq!(HistoryError::InvalidOffset(0).class(), ErrorClass::Misuse);
        assert_eq!(
            HistoryError::ShutDown {
                component: "dispatcher"
            }
            .class(),
            ErrorClass::Shutdown
        );
        assert_eq!(
            HistoryError::IndexStore {
                op: "commit",
                shard: 'a',
                detail: "disk full".to_owned(),
            }
            .class(),
            ErrorClass::Transaction
        );
    }

    #[test]
    fn fatal_errors_stop_workers() {
        assert!(HistoryError::log_corrupt(1, "bad envelope").is_fatal());
        assert!(HistoryError::internal("broken invariant").is_fatal());
        assert!(!HistoryError::InvalidOffset(0).is_fatal());
        assert!(!HistoryError::Io(std::io::Error::other("transient")).is_fatal());
        assert!(
            HistoryError::IndexAheadOfLog {
                shards: 1,
                log_end: 232
            }
            .is_fatal()
        );
    }

    #[test]
    fn display_includes_context() {
        let err = HistoryError::HeaderMismatch {
            field: "key_len",
            stored: "7".to_owned(),
            configured: "8".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("key_len"), "{msg}");
        assert!(msg.contains("stored 7"), "{msg}");
    }
}
