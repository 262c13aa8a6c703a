//! Boot-time replay of the log tail against the index.
//!
//! The log is walked backwards from its most recent record and every hash
//! is looked up as a search. Recent records are the ones an unclean
//! shutdown can have lost from the index, so the walk stops once
//! `distance_threshold` consecutive records after the most recent miss were
//! all found. What happens to missing records depends on the
//! [`RecoveryPolicy`].
//!
//! The opposite drift, index entries naming offsets the log lost, is found
//! by [`reconcile_ahead`] from each shard's high-water offset before the
//! store serves queries.

use std::path::Path;
use std::time::Instant;

use fhist_error::{HistoryError, Result};
use fhist_index::{PruneStats, ShardedIndex};
use fhist_log::TailScan;
use fhist_types::{DedupOutcome, QueryMode, RecoveryPolicy, ReplayConfig, ShardId};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::REPLAY_TARGET;
use crate::dispatcher::IndexHandle;

/// Records listed by name in the log when verification fails.
const REPORTED_MISSING: usize = 16;

/// A log record the index does not know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingRecord {
    pub hash: String,
    pub offset: u64,
}

/// Index shards found ahead of the log when the store opened.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AheadReport {
    /// Log length at open.
    pub log_end: u64,
    /// Shards whose high-water offset reached `log_end`, with that offset.
    pub shards: Vec<(char, u64)>,
    pub pruned: PruneStats,
}

/// What a replay found and did.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ReplayReport {
    pub policy: RecoveryPolicy,
    /// Boot only; empty for on-demand replays.
    pub ahead: AheadReport,
    /// Hash length inferred from the most recent record.
    pub hash_len: Option<usize>,
    pub scanned: u64,
    pub confirmed: u64,
    /// Records whose lookup referenced an unreadable offset.
    pub unresolved: u64,
    /// Most recent first.
    pub missing: Vec<MissingRecord>,
    pub repaired: u64,
    /// True when the walk ended on the distance threshold rather than at
    /// the start of the log.
    pub reached_threshold: bool,
    pub elapsed_ms: u64,
}

impl ReplayReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.missing.len() as u64 == self.repaired && self.unresolved == 0
    }
}

/// Walk the log tail and classify every record without changing anything.
pub fn scan(
    path: &Path,
    hash_len: usize,
    distance_threshold: u64,
    index: &IndexHandle,
) -> Result<ReplayReport> {
    let started = Instant::now();
    let tail = TailScan::open(path, hash_len)?;
    let mut report = ReplayReport {
        hash_len: tail.hash_len(),
        ..ReplayReport::default()
    };
    let mut distance = 0_u64;

    for entry in tail.iter() {
        let entry = entry?;
        report.scanned += 1;
        match index.query(entry.hash, QueryMode::Search)? {
            DedupOutcome::Duplicate => {
                report.confirmed += 1;
                distance += 1;
            }
            DedupOutcome::Pass | DedupOutcome::Added => {
                debug!(
                    target: REPLAY_TARGET,
                    hash = entry.hash,
                    offset = entry.offset,
                    "record missing from index"
                );
                report.missing.push(MissingRecord {
                    hash: entry.hash.to_owned(),
                    offset: entry.offset,
                });
                distance = 0;
            }
            DedupOutcome::Retry => {
                warn!(
                    target: REPLAY_TARGET,
                    hash = entry.hash,
                    offset = entry.offset,
                    "index references an offset past the end of the log"
                );
                report.unresolved += 1;
            }
        }
        if distance > distance_threshold {
            report.reached_threshold = true;
            break;
        }
    }

    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    Ok(report)
}

/// Compare every shard's high-water offset with `log_end`.
///
/// A shard at or past `log_end` holds offsets of records the log lost in a
/// crash. `Verify` refuses to open with [`HistoryError::IndexAheadOfLog`];
/// `Repair` and `Skip` prune those offsets so no lookup reads past the log.
pub fn reconcile_ahead(
    index: &ShardedIndex,
    log_end: u64,
    policy: RecoveryPolicy,
) -> Result<AheadReport> {
    let ahead = index.shards_ahead_of(log_end)?;
    let mut report = AheadReport {
        log_end,
        shards: ahead
            .iter()
            .map(|(shard, high_water)| (shard.as_char(), *high_water))
            .collect(),
        pruned: PruneStats::default(),
    };
    if ahead.is_empty() {
        return Ok(report);
    }
    for (shard, high_water) in &ahead {
        warn!(
            target: REPLAY_TARGET,
            shard = %shard,
            high_water,
            log_end,
            "index shard references offsets past the end of the log"
        );
    }
    if policy == RecoveryPolicy::Verify {
        error!(
            target: REPLAY_TARGET,
            shards = ahead.len(),
            log_end,
            "index is ahead of the log; reopen with the repair policy or rebuild"
        );
        return Err(HistoryError::IndexAheadOfLog {
            shards: ahead.len(),
            log_end,
        });
    }
    let shards: Vec<ShardId> = ahead.iter().map(|(shard, _)| *shard).collect();
    report.pruned = index.prune_from(&shards, log_end)?;
    Ok(report)
}

/// Reinsert `report.missing` oldest first, at their own offsets.
pub fn repair(report: &mut ReplayReport, index: &IndexHandle) -> Result<()> {
    let mut pending: Vec<&MissingRecord> = report.missing.iter().collect();
    pending.sort_by_key(|missing| missing.offset);
    for missing in pending {
        match index.query(&missing.hash, QueryMode::insert(missing.offset)?)? {
            DedupOutcome::Added => report.repaired += 1,
            DedupOutcome::Duplicate => {}
            DedupOutcome::Retry => report.unresolved += 1,
            DedupOutcome::Pass => {
                return Err(HistoryError::internal("insert query answered pass"));
            }
        }
    }
    Ok(())
}

/// Scan and apply `config.policy`. `Verify` fails with
/// [`HistoryError::IndexBehindLog`] when records are missing.
pub fn replay(
    path: &Path,
    hash_len: usize,
    config: &ReplayConfig,
    index: &IndexHandle,
) -> Result<ReplayReport> {
    if config.policy == RecoveryPolicy::Skip {
        info!(target: REPLAY_TARGET, "replay skipped");
        return Ok(ReplayReport {
            policy: RecoveryPolicy::Skip,
            ..ReplayReport::default()
        });
    }

    let mut report = scan(path, hash_len, config.distance_threshold, index)?;
    report.policy = config.policy;
    match config.policy {
        RecoveryPolicy::Verify if !report.missing.is_empty() => {
            for missing in report.missing.iter().take(REPORTED_MISSING) {
                error!(
                    target: REPLAY_TARGET,
                    hash = %missing.hash,
                    offset = missing.offset,
                    "log record missing from index"
                );
            }
            error!(
                target: REPLAY_TARGET,
                missing = report.missing.len(),
                scanned = report.scanned,
                "index is behind the log; reopen with the repair policy or rebuild"
            );
            return Err(HistoryError::IndexBehindLog {
                missing: report.missing.len(),
            });
        }
        RecoveryPolicy::Repair if !report.missing.is_empty() => repair(&mut report, index)?,
        _ => {}
    }

    info!(
        target: REPLAY_TARGET,
        policy = ?report.policy,
        scanned = report.scanned,
        confirmed = report.confirmed,
        missing = report.missing.len(),
        repaired = report.repaired,
        unresolved = report.unresolved,
        reached_threshold = report.reached_threshold,
        elapsed_ms = report.elapsed_ms,
        "replay finished"
    );
    Ok(report)
}
