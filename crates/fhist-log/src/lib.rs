//! Append-only history log.
//!
//! The log file starts with a fixed [`LOG_HEADER_BYTES`]-byte [`LogHeader`]
//! and is followed by newline-terminated records. The byte offset of a
//! record's first character is its permanent identity; offsets below the
//! header size never name a record.
//!
//! - [`LogWriter`]: single-writer buffered append
//! - [`LogReader`]: positional `{hash}` envelope reads ([`HashSource`])
//! - [`TailScan`]: memory-mapped backward iteration for boot-time replay

pub mod header;
pub mod reader;
pub mod tail_scan;
pub mod writer;

pub use header::{LOG_HEADER_BYTES, LOG_MAGIC, LOG_VERSION, LogHeader};
pub use reader::{HashAt, HashSource, LogReader};
pub use tail_scan::{TailEntry, TailIter, TailScan};
pub use writer::LogWriter;

/// Tracing target for log I/O events.
pub const LOG_TARGET: &str = "fhist.log";
