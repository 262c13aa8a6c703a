//! Full forward replay of the log into the index.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Instant;

use fhist_error::{HistoryError, Result};
use fhist_log::LOG_HEADER_BYTES;
use fhist_types::{DedupOutcome, HashAlgo, HistoryRecord, QueryMode, validate_hash};
use serde::Serialize;
use tracing::{info, warn};

use crate::REPLAY_TARGET;
use crate::dispatcher::IndexHandle;

/// What a rebuild did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RebuildReport {
    pub records: u64,
    /// Records the index did not know yet.
    pub added: u64,
    pub duplicates: u64,
    /// Records left unresolved because a referenced offset was not readable.
    pub retries: u64,
    /// Offset the rebuild stopped at.
    pub end_offset: u64,
    pub elapsed_ms: u64,
}

/// Insert every record of the log at `path` below `end` at its own offset,
/// oldest first. Records already indexed are counted as duplicates, so the
/// rebuild can be repeated.
pub fn rebuild_from_log(
    path: &Path,
    end: u64,
    algo: HashAlgo,
    index: &IndexHandle,
) -> Result<RebuildReport> {
    let started = Instant::now();
    let mut file = File::open(path)?;
    let start = LOG_HEADER_BYTES as u64;
    file.seek(SeekFrom::Start(start))?;
    let mut reader = BufReader::new(file.take(end.saturating_sub(start)));

    let mut report = RebuildReport::default();
    let mut offset = start;
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            warn!(
                target: REPLAY_TARGET,
                offset,
                bytes = read,
                "rebuild stopped at a partial record"
            );
            break;
        }

        let record = HistoryRecord::parse_line(&line)
            .map_err(|err| HistoryError::log_corrupt(offset, err.to_string()))?;
        validate_hash(&record.hash, algo)
            .map_err(|err| HistoryError::log_corrupt(offset, err.to_string()))?;

        match index.query(&record.hash, QueryMode::insert(offset)?)? {
            DedupOutcome::Added => report.added += 1,
            DedupOutcome::Duplicate => report.duplicates += 1,
            DedupOutcome::Retry => {
                warn!(target: REPLAY_TARGET, hash = %record.hash, offset, "rebuild left record unresolved");
                report.retries += 1;
            }
            DedupOutcome::Pass => {
                return Err(HistoryError::internal("insert query answered pass"));
            }
        }
        report.records += 1;
        offset += read as u64;
    }

    report.end_offset = offset;
    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    info!(
        target: REPLAY_TARGET,
        records = report.records,
        added = report.added,
        duplicates = report.duplicates,
        retries = report.retries,
        end_offset = report.end_offset,
        elapsed_ms = report.elapsed_ms,
        "rebuilt index from log"
    );
    Ok(report)
}
