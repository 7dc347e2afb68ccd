//! Durable snapshot storage.
//!
//! Every rewrite of a persisted file goes through [`write_atomic`]: the new
//! contents land in a temp file in the same directory, the previous version is
//! copied to `<file>.bak.1` (older generations shift to `.bak.2`, `.bak.3`, ...),
//! and only then is the temp file renamed over the original. A crash at any
//! point leaves either the old file or the new one, plus at least one complete
//! backup, never a half-written file as the only copy.

use crate::error::{KeeperError, Result};
use crate::ledger::{Ledger, Session, Stats};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub const SESSIONS_FILE: &str = "sessions.json";
pub const STATS_FILE: &str = "stats.json";

/// Path of backup generation `n` (1 = most recent) for `path`.
pub fn backup_path(path: &Path, generation: usize) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".bak.{}", generation));
    path.with_file_name(name)
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Temp file unique to this write, so overlapping rewrites of one file never
/// share a temp path.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(
        ".tmp.{}.{}",
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}

/// Replace `path` with `data` atomically, keeping `backups` prior versions.
pub fn write_atomic(path: &Path, data: &[u8], backups: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| KeeperError::persistence(parent, e))?;
        }
    }

    let temp = temp_path(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(KeeperError::persistence(&temp, e));
    }

    if backups > 0 && path.exists() {
        if let Err(e) = rotate_backups(path, backups) {
            let _ = fs::remove_file(&temp);
            return Err(KeeperError::persistence(path, e));
        }
    }

    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        KeeperError::persistence(path, e)
    })?;

    debug!("Atomically replaced {}", path.display());
    Ok(())
}

/// Shift `.bak.N` generations up by one and copy the live file to `.bak.1`.
fn rotate_backups(path: &Path, backups: usize) -> std::io::Result<()> {
    for generation in (1..backups).rev() {
        let from = backup_path(path, generation);
        if from.exists() {
            fs::rename(&from, backup_path(path, generation + 1))?;
        }
    }
    fs::copy(path, backup_path(path, 1))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it with [`write_atomic`].
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T, backups: usize) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');
    write_atomic(path, &json, backups)
}

/// Read a JSON file; `None` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|e| KeeperError::persistence(path, e))?;
    let value = serde_json::from_str(&contents)?;
    Ok(Some(value))
}

/// Persisted sessions list and aggregate stats.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    sessions_path: PathBuf,
    stats_path: PathBuf,
    backups: usize,
}

impl SnapshotStore {
    pub fn new(data_dir: impl AsRef<Path>, backups: usize) -> Self {
        let dir = data_dir.as_ref();
        Self {
            sessions_path: dir.join(SESSIONS_FILE),
            stats_path: dir.join(STATS_FILE),
            backups,
        }
    }

    pub fn sessions_path(&self) -> &Path {
        &self.sessions_path
    }

    pub fn stats_path(&self) -> &Path {
        &self.stats_path
    }

    /// Write sessions, then stats. Each file is replaced atomically; the pair
    /// is not.
    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        write_json_atomic(&self.sessions_path, &ledger.sessions, self.backups)?;
        write_json_atomic(&self.stats_path, &ledger.stats, self.backups)?;
        Ok(())
    }

    pub fn load_sessions(&self) -> Result<Vec<Session>> {
        Ok(read_json(&self.sessions_path)?.unwrap_or_default())
    }

    pub fn load_stats(&self) -> Result<Stats> {
        Ok(read_json(&self.stats_path)?.unwrap_or_default())
    }

    /// Load both files, falling back to empty state (with a warning) when a
    /// file is unreadable.
    pub fn load_or_default(&self) -> (Vec<Session>, Stats) {
        let sessions = self.load_sessions().unwrap_or_else(|e| {
            warn!("Failed to load sessions snapshot: {}", e);
            Vec::new()
        });
        let stats = self.load_stats().unwrap_or_else(|e| {
            warn!("Failed to load stats snapshot: {}", e);
            Stats::default()
        });
        (sessions, stats)
    }
}
