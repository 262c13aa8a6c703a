//! Positional reads of record hashes.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fhist_error::{HistoryError, Result};
use tracing::trace;

use crate::LOG_TARGET;
use crate::header::LOG_HEADER_BYTES;

/// What the log holds at an offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashAt {
    /// The record at the offset carries this hash.
    Hash(String),
    /// The offset lies at or beyond the visible end of the log, or the
    /// record there is only partially written.
    Eof,
}

/// Anything that can resolve a log offset to the hash stored there.
pub trait HashSource {
    fn read_hash_at(&mut self, offset: u64) -> Result<HashAt>;
}

/// Read-only handle reused for every confirmatory read of one worker.
#[derive(Debug)]
pub struct LogReader {
    path: PathBuf,
    file: File,
    hash_len: usize,
    buf: Vec<u8>,
}

impl LogReader {
    /// Open `path` for envelope reads of `hash_len`-character hashes.
    pub fn open(path: &Path, hash_len: usize) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: File::open(path)?,
            hash_len,
            // `{` + hash + `}` + `\t`
            buf: vec![0; hash_len + 3],
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fill(&mut self, offset: u64) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < self.buf.len() {
            match self.file.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(filled)
    }
}

impl HashSource for LogReader {
    fn read_hash_at(&mut self, offset: u64) -> Result<HashAt> {
        if offset < LOG_HEADER_BYTES as u64 {
            return Err(HistoryError::log_corrupt(
                offset,
                "offset points into the store header",
            ));
        }
        let filled = self.fill(offset)?;
        if filled < self.buf.len() {
            trace!(target: LOG_TARGET, offset, filled, "read hit end of log");
            return Ok(HashAt::Eof);
        }
        let hash = parse_envelope(&self.buf, self.hash_len)
            .map_err(|detail| HistoryError::log_corrupt(offset, detail))?;
        Ok(HashAt::Hash(hash.to_owned()))
    }
}

/// Validate a `{hash}\t` envelope of known hash length and return the hash.
pub(crate) fn parse_envelope(bytes: &[u8], hash_len: usize) -> std::result::Result<&str, String> {
    if bytes.len() < hash_len + 3 {
        return Err(format!("line too short for a {hash_len}-character hash"));
    }
    if bytes[0] != b'{' {
        return Err(format!("expected '{{', found {:?}", char::from(bytes[0])));
    }
    if bytes[hash_len + 1] != b'}' || bytes[hash_len + 2] != b'\t' {
        return Err("hash envelope not closed by '}' and a tab".to_owned());
    }
    let hash = &bytes[1..=hash_len];
    if !hash.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err("hash envelope contains non-hex characters".to_owned());
    }
    std::str::from_utf8(hash).map_err(|_| "hash is not utf-8".to_owned())
}

#[cfg(test)]
mod tests {
    use fhist_types::{HashAlgo, HistoryConfig, HistoryRecord};
    use tempfile::tempdir;

    use super::*;
    use crate::LogWriter;

    #[test]
    fn reads_flushed_records_and_reports_eof_otherwise() {
        let dir = tempdir().expect("tempdir");
        let config = HistoryConfig::new(dir.path());
        let mut writer = LogWriter::open(&config).expect("open");
        let hash = HashAlgo::Sha256.digest(b"<a@b>");
        let offset = writer
            .append_record(&HistoryRecord::new(hash.clone(), "@t@"))
            .expect("append");

        let mut reader = LogReader::open(&config.log_path(), 64).expect("reader");
        assert_eq!(reader.read_hash_at(offset).expect("read"), HashAt::Eof);

        writer.flush().expect("flush");
        assert_eq!(
            reader.read_hash_at(offset).expect("read"),
            HashAt::Hash(hash)
        );
        assert_eq!(
            reader.read_hash_at(writer.position()).expect("read"),
            HashAt::Eof
        );
        assert_eq!(
            reader.read_hash_at(writer.position() + 10_000).expect("read"),
            HashAt::Eof
        );
    }

    #[test]
    fn malformed_envelope_is_corruption() {
        let dir = tempdir().expect("tempdir");
        let config = HistoryConfig::new(dir.path());
        let mut writer = LogWriter::open(&config).expect("open");
        let line = format!("[{}]\tjunk\n", "a".repeat(64));
        let offset = writer.append(line.as_bytes()).expect("append");
        writer.flush().expect("flush");

        let mut reader = LogReader::open(&config.log_path(), 64).expect("reader");
        let err = reader.read_hash_at(offset).expect_err("corrupt");
        assert!(matches!(err, HistoryError::LogCorrupt { offset: o, .. } if o == offset));
        assert!(reader.read_hash_at(3).is_err());
    }

    #[test]
    fn envelope_parser_checks_fixed_positions() {
        let hash = "0123456789abcdef0123456789abcdef";
        let line = format!("{{{hash}}}\trest");
        assert_eq!(parse_envelope(line.as_bytes(), 32), Ok(hash));
        assert!(parse_envelope(line.as_bytes(), 31).is_err());
        assert!(parse_envelope(b"{ABCD}\t", 4).is_err());
    }
}
