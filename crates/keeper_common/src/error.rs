//! Error types for Keeper.
//!
//! Anomalies found while folding the event log are not errors; they are
//! counted in [`crate::ledger::AnomalyReport`].

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("Status probe failed: {0}")]
    Probe(String),

    #[error("Orchestrator command failed: {0}")]
    Command(String),

    #[error("Persistence failed for {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("Event log not found at {}; nothing to reconstruct from", .0.display())]
    LogMissing(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KeeperError {
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KeeperError::Persistence {
            path: path.into(),
            source,
        }
    }
}

/// A malformed record in the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line number in the log file
    pub line: usize,
    pub reason: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

impl std::error::Error for ParseError {}

pub type Result<T> = std::result::Result<T, KeeperError>;
