//! History repair: rebuild sessions and stats from the event log alone.
//!
//! Offline and exclusive. keeperd must not be writing the same data directory
//! while a repair runs; nothing here takes a lock.

use crate::error::{KeeperError, ParseError, Result};
use crate::event_log::EventLog;
use crate::ledger::{AnomalyReport, Ledger};
use crate::store::SnapshotStore;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct RepairOptions {
    /// Rebuild and report, but leave the snapshot files untouched
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct RepairReport {
    pub ledger: Ledger,
    /// Well-formed records read from the log
    pub events_read: usize,
    pub parse_errors: Vec<ParseError>,
    /// Snapshot files were replaced
    pub written: bool,
}

impl RepairReport {
    pub fn anomalies(&self) -> &AnomalyReport {
        &self.ledger.anomalies
    }

    /// One-line summary in the form printed by `keeperctl repair`.
    pub fn summary(&self) -> String {
        format!(
            "{} sessions, {} total starts, {} events read",
            self.ledger.sessions.len(),
            self.ledger.stats.start_count,
            self.events_read
        )
    }
}

/// Rebuild derived state from `log` and, unless `dry_run`, replace the
/// snapshot in `store`.
///
/// The whole log is read before any output is touched. Malformed records are
/// skipped and counted as `parse_error`; every other irregularity is counted
/// by the fold itself.
pub fn repair(log: &EventLog, store: &SnapshotStore, options: RepairOptions) -> Result<RepairReport> {
    if !log.exists() {
        return Err(KeeperError::LogMissing(log.path().to_path_buf()));
    }

    let scan = log.scan()?;
    for err in &scan.errors {
        warn!("[REPAIR] Skipping malformed record at {}", err);
    }

    let mut ledger = Ledger::rebuild_from_scratch(&scan.events);
    ledger.anomalies.parse_error += scan.errors.len() as u64;

    info!(
        "[REPAIR] Rebuilt {} sessions from {} events ({})",
        ledger.sessions.len(),
        scan.events.len(),
        ledger.anomalies
    );

    let written = if options.dry_run {
        info!("[REPAIR] Dry run, snapshot left unchanged");
        false
    } else {
        store.save(&ledger)?;
        info!(
            "[REPAIR] Wrote {} and {}",
            store.sessions_path().display(),
            store.stats_path().display()
        );
        true
    };

    Ok(RepairReport {
        ledger,
        events_read: scan.events.len(),
        parse_errors: scan.errors,
        written,
    })
}
