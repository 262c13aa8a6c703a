//! Single-writer buffered append.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fhist_error::{HistoryError, Result};
use fhist_types::{HistoryConfig, HistoryRecord, LogWatermark};
use tracing::{debug, info, warn};

use crate::LOG_TARGET;
use crate::header::{LOG_HEADER_BYTES, LogHeader};

const TAIL_SCAN_BYTES: u64 = 64 * 1024;

/// Owner of the history log's append handle.
///
/// Appends land in an in-process buffer; [`LogWriter::position`] already
/// counts them, so the offset handed out for a record is valid before the
/// bytes reach the file. Readers observe a record only after
/// [`LogWriter::flush`], which also raises the [`LogWatermark`].
#[derive(Debug)]
pub struct LogWriter {
    path: PathBuf,
    out: BufWriter<File>,
    header: LogHeader,
    position: u64,
    flushed: u64,
    watermark: LogWatermark,
}

impl LogWriter {
    /// Open the log described by `config`, creating it with a fresh header
    /// when absent. An existing header must match `config`. A torn final
    /// line left by a crash is truncated so new appends start on a line
    /// boundary.
    pub fn open(config: &HistoryConfig) -> Result<Self> {
        let path = config.log_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();

        let header = if len == 0 {
            let header = LogHeader::from_config(config, unix_now());
            file.write_all(&header.encode())?;
            file.sync_data()?;
            info!(
                target: LOG_TARGET,
                path = %path.display(),
                hash_algo = header.hash_algo.as_str(),
                bucket_chars = header.bucket_chars,
                key_index = header.key_index,
                key_len = header.key_len,
                "created history log"
            );
            header
        } else {
            let header = read_header(&mut file, &path)?;
            header.ensure_matches(config)?;
            truncate_torn_tail(&mut file, &path, len)?;
            header
        };

        let position = file.metadata()?.len();
        debug!(
            target: LOG_TARGET,
            path = %path.display(),
            position,
            "opened history log for append"
        );
        Ok(Self {
            path,
            out: BufWriter::with_capacity(config.log_buffer_bytes, file),
            header,
            position,
            flushed: position,
            watermark: LogWatermark::new(position),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Offset the next appended line will start at.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Shared handle on the flushed end of the log.
    #[must_use]
    pub fn watermark(&self) -> LogWatermark {
        self.watermark.clone()
    }

    /// True when appended bytes are still buffered in-process.
    #[must_use]
    pub const fn has_unflushed(&self) -> bool {
        self.position > self.flushed
    }

    /// Append one complete line and return the offset it starts at.
    pub fn append(&mut self, line: &[u8]) -> Result<u64> {
        if line.last() != Some(&b'\n') {
            return Err(HistoryError::InvalidRecord {
                detail: "log lines must end with a newline".to_owned(),
            });
        }
        let offset = self.position;
        self.out.write_all(line)?;
        self.position += line.len() as u64;
        Ok(offset)
    }

    /// Format and append `record`.
    pub fn append_record(&mut self, record: &HistoryRecord) -> Result<u64> {
        self.append(record.format_line().as_bytes())
    }

    /// Push buffered bytes to the file so readers can see them.
    pub fn flush(&mut self) -> Result<()> {
        if self.has_unflushed() {
            self.out.flush()?;
            debug!(
                target: LOG_TARGET,
                from = self.flushed,
                to = self.position,
                "flushed history log"
            );
            self.flushed = self.position;
            self.watermark.publish(self.flushed);
        }
        Ok(())
    }

    /// Flush and fsync the log data.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(())
    }
}

fn read_header(file: &mut File, path: &Path) -> Result<LogHeader> {
    let mut bytes = [0_u8; LOG_HEADER_BYTES];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut bytes).map_err(|err| HistoryError::HeaderCorrupt {
        detail: format!("{}: cannot read header: {err}", path.display()),
    })?;
    LogHeader::decode(&bytes)
}

fn truncate_torn_tail(file: &mut File, path: &Path, len: u64) -> Result<()> {
    let data_start = LOG_HEADER_BYTES as u64;
    let mut end = len;
    let mut chunk = Vec::new();
    while end > data_start {
        let start = end.saturating_sub(TAIL_SCAN_BYTES).max(data_start);
        chunk.resize((end - start) as usize, 0);
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk)?;
        if let Some(pos) = memchr::memrchr(b'\n', &chunk) {
            let keep = start + pos as u64 + 1;
            if keep < len {
                cut(file, path, keep, len)?;
            }
            return Ok(());
        }
        end = start;
    }
    if len > data_start {
        cut(file, path, data_start, len)?;
    }
    Ok(())
}

fn cut(file: &File, path: &Path, keep: u64, len: u64) -> Result<()> {
    warn!(
        target: LOG_TARGET,
        path = %path.display(),
        keep,
        dropped = len - keep,
        "truncating torn tail of history log"
    );
    file.set_len(keep)?;
    file.sync_data()?;
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use fhist_types::{HashAlgo, HistoryRecord};
    use tempfile::tempdir;

    use super::*;

    fn record(id: &str) -> HistoryRecord {
        HistoryRecord::new(HashAlgo::Sha256.digest(id.as_bytes()), "@tok@")
    }

    #[test]
    fn offsets_start_after_header_and_grow() {
        let dir = tempdir().expect("tempdir");
        let config = HistoryConfig::new(dir.path());
        let mut writer = LogWriter::open(&config).expect("open");
        assert_eq!(writer.position(), LOG_HEADER_BYTES as u64);

        let first = writer.append_record(&record("<1@x>")).expect("append");
        let second = writer.append_record(&record("<2@x>")).expect("append");
        assert_eq!(first, LOG_HEADER_BYTES as u64);
        assert!(second > first);
        assert!(writer.has_unflushed());

        writer.sync().expect("sync");
        assert!(!writer.has_unflushed());
        let len = fs::metadata(config.log_path()).expect("stat").len();
        assert_eq!(len, writer.position());
    }

    #[test]
    fn watermark_follows_flushes() {
        let dir = tempdir().expect("tempdir");
        let mut writer = LogWriter::open(&HistoryConfig::new(dir.path())).expect("open");
        let watermark = writer.watermark();
        assert_eq!(watermark.get(), LOG_HEADER_BYTES as u64);

        let offset = writer.append_record(&record("<1@x>")).expect("append");
        assert!(!watermark.admits(offset));
        writer.flush().expect("flush");
        assert!(watermark.admits(offset));
        assert_eq!(watermark.get(), writer.position());
    }

    #[test]
    fn reopen_checks_header() {
        let dir = tempdir().expect("tempdir");
        let config = HistoryConfig::new(dir.path());
        drop(LogWriter::open(&config).expect("create"));

        let mut other = config.clone();
        other.key_len = 9;
        let err = LogWriter::open(&other).expect_err("mismatch");
        assert!(matches!(err, HistoryError::HeaderMismatch { field: "key_len", .. }));
    }

    #[test]
    fn reopen_truncates_torn_tail() {
        let dir = tempdir().expect("tempdir");
        let config = HistoryConfig::new(dir.path());
        let mut writer = LogWriter::open(&config).expect("open");
        writer.append_record(&record("<1@x>")).expect("append");
        writer.sync().expect("sync");
        let complete = writer.position();
        drop(writer);

        let mut file = OpenOptions::new()
            .append(true)
            .open(config.log_path())
            .expect("open raw");
        file.write_all(b"{deadbeef").expect("torn write");
        drop(file);

        let writer = LogWriter::open(&config).expect("reopen");
        assert_eq!(writer.position(), complete);
    }

    #[test]
    fn rejects_unterminated_lines() {
        let dir = tempdir().expect("tempdir");
        let mut writer = LogWriter::open(&HistoryConfig::new(dir.path())).expect("open");
        assert!(writer.append(b"{abc}\tpartial").is_err());
    }
}
