//! Backward iteration over the history log for boot-time replay.
//!
//! The file is memory-mapped (falling back to a plain read when mapping is
//! unavailable) and walked from its last complete line towards the header.
//! A final line without its newline is a torn write from an unclean
//! shutdown: it is skipped and reported through [`TailScan::torn_tail`].
//! Any other malformed line is corruption.

use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use fhist_error::{HistoryError, Result};
use fhist_types::ADMISSIBLE_HASH_LENGTHS;
use memmap2::Mmap;
use tracing::{debug, warn};

use crate::LOG_TARGET;
use crate::header::{LOG_HEADER_BYTES, LogHeader};
use crate::reader::parse_envelope;

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Backing {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => &map[..],
            Self::Owned(bytes) => bytes.as_slice(),
        }
    }
}

/// A snapshot of the log prepared for backward iteration.
pub struct TailScan {
    path: PathBuf,
    bytes: Backing,
    header: LogHeader,
    /// End of the last complete line.
    end: usize,
    hash_len: Option<usize>,
    torn_tail: bool,
}

/// One record yielded by [`TailIter`], most recent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailEntry<'a> {
    pub offset: u64,
    pub hash: &'a str,
}

impl TailScan {
    /// Map `path` and locate its last complete record. When the log holds
    /// records, their hash length is inferred from the most recent one and
    /// must equal `expected_hash_len`.
    pub fn open(path: &Path, expected_hash_len: usize) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the log is append-only and this process holds the only
        // writer; bytes already present are never rewritten while mapped.
        #[allow(unsafe_code)]
        let bytes = match unsafe { Mmap::map(&file) } {
            Ok(map) => Backing::Mapped(map),
            Err(err) => {
                debug!(target: LOG_TARGET, error = %err, "mmap unavailable, reading log");
                Backing::Owned(std::fs::read(path)?)
            }
        };

        let header = LogHeader::decode(&bytes)?;
        let data = &bytes[LOG_HEADER_BYTES..];
        let (end, torn_tail) = match data.last() {
            None | Some(b'\n') => (bytes.len(), false),
            Some(_) => {
                let end = memchr::memrchr(b'\n', data).map_or(LOG_HEADER_BYTES, |pos| {
                    LOG_HEADER_BYTES + pos + 1
                });
                warn!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    torn_at = end,
                    dropped = bytes.len() - end,
                    "skipping torn final line of history log"
                );
                (end, true)
            }
        };

        let mut scan = Self {
            path: path.to_path_buf(),
            bytes,
            header,
            end,
            hash_len: None,
            torn_tail,
        };
        scan.hash_len = scan.infer_hash_len()?;
        if let Some(found) = scan.hash_len {
            if found != expected_hash_len {
                return Err(HistoryError::HeaderMismatch {
                    field: "hash_len",
                    stored: found.to_string(),
                    configured: expected_hash_len.to_string(),
                });
            }
        }
        debug!(
            target: LOG_TARGET,
            path = %scan.path.display(),
            end = scan.end,
            hash_len = ?scan.hash_len,
            torn_tail,
            "prepared tail scan"
        );
        Ok(scan)
    }

    #[must_use]
    pub const fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Hash length of the stored records; `None` for an empty log.
    #[must_use]
    pub const fn hash_len(&self) -> Option<usize> {
        self.hash_len
    }

    #[must_use]
    pub const fn torn_tail(&self) -> bool {
        self.torn_tail
    }

    /// Bytes of complete records after the header.
    #[must_use]
    pub const fn data_len(&self) -> usize {
        self.end - LOG_HEADER_BYTES
    }

    /// Iterate records from the most recent backwards.
    #[must_use]
    pub fn iter(&self) -> TailIter<'_> {
        TailIter {
            bytes: &self.bytes,
            end: self.end,
            hash_len: self.hash_len.unwrap_or_default(),
        }
    }

    fn infer_hash_len(&self) -> Result<Option<usize>> {
        if self.end == LOG_HEADER_BYTES {
            return Ok(None);
        }
        let (start, line) = line_before(&self.bytes, self.end);
        let close = line
            .first()
            .filter(|&&b| b == b'{')
            .and_then(|_| memchr::memchr(b'}', line))
            .ok_or_else(|| {
                HistoryError::log_corrupt(start as u64, "most recent record has no hash envelope")
            })?;
        let len = close - 1;
        if !ADMISSIBLE_HASH_LENGTHS.contains(&len) {
            return Err(HistoryError::log_corrupt(
                start as u64,
                format!("hash length {len} is not an admissible digest length"),
            ));
        }
        Ok(Some(len))
    }
}

impl std::fmt::Debug for TailScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailScan")
            .field("path", &self.path)
            .field("end", &self.end)
            .field("hash_len", &self.hash_len)
            .field("torn_tail", &self.torn_tail)
            .finish_non_exhaustive()
    }
}

/// Backward iterator over complete records.
#[derive(Debug)]
pub struct TailIter<'a> {
    bytes: &'a [u8],
    end: usize,
    hash_len: usize,
}

impl<'a> Iterator for TailIter<'a> {
    type Item = Result<TailEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end <= LOG_HEADER_BYTES {
            return None;
        }
        let (start, line) = line_before(self.bytes, self.end);
        self.end = start;
        let entry = parse_envelope(line, self.hash_len)
            .map(|hash| TailEntry {
                offset: start as u64,
                hash,
            })
            .map_err(|detail| HistoryError::log_corrupt(start as u64, detail));
        if entry.is_err() {
            // Corruption ends the walk.
            self.end = LOG_HEADER_BYTES;
        }
        Some(entry)
    }
}

/// Start offset and content (without newline) of the line ending at `end`.
///
/// Every line ends in a storage token of free length, so a line start
/// cannot be computed from the hash length. The hash length only validates
/// the envelope once the preceding newline is found.
fn line_before(bytes: &[u8], end: usize) -> (usize, &[u8]) {
    let line_end = end - 1;
    let start = memchr::memrchr(b'\n', &bytes[LOG_HEADER_BYTES..line_end])
        .map_or(LOG_HEADER_BYTES, |pos| LOG_HEADER_BYTES + pos + 1);
    (start, &bytes[start..line_end])
}
