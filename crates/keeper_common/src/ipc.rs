//! Control socket protocol between keeperd and its clients.
//!
//! Newline-delimited JSON over a Unix socket. One request per line, one
//! response line per request:
//!
//! ```text
//! -> {"type":"start"}
//! <- {"status":"success","data":{"outcome":"starting"}}
//! ```

use crate::ledger::{AnomalyReport, Session};
use crate::types::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request from client to daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Start,
    Stop,
    /// Monitoring status snapshot
    Monitor,
}

/// Response from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Success { data: serde_json::Value },
    Error { message: String },
}

impl ControlResponse {
    pub fn success<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => ControlResponse::Success { data },
            Err(e) => ControlResponse::Error {
                message: format!("failed to encode response: {}", e),
            },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse::Error {
            message: message.into(),
        }
    }
}

/// What a start or stop command did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Start issued; the next observation records the start
    Starting,
    /// Server already up; nothing issued
    AlreadyRunning,
    /// A previous start is still within its window; nothing issued
    Pending { since: DateTime<Utc> },
    Stopped { session_closed: bool },
    Failed { reason: String },
}

impl CommandOutcome {
    pub fn message(&self) -> String {
        match self {
            Self::Starting => "Server is starting (manual request).".to_string(),
            Self::AlreadyRunning => "Server already running; ignoring duplicate start.".to_string(),
            Self::Pending { since } => format!(
                "Start already pending since {}.",
                since.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            Self::Stopped { .. } => "Server stopped successfully.".to_string(),
            Self::Failed { reason } => format!("Command failed: {}", reason),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Monitor state as seen from outside the monitor task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    /// stopped, starting, healthy, unhealthy or faulted
    pub phase: String,
    pub phase_since: Option<DateTime<Utc>>,
    pub pending_start: Option<DateTime<Utc>>,
    pub open_session: Option<Session>,
    pub poll_interval_secs: u64,
    pub grace_secs: u64,
    pub last_status: Option<Status>,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub sessions_recorded: usize,
    pub start_count: u64,
    /// Auto-detected starts plus auto-detected stops
    pub auto_detected_events: u64,
    pub anomalies: AnomalyReport,
    /// Snapshot files lag the event log after a failed rewrite
    pub snapshot_stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        assert_eq!(
            serde_json::to_string(&ControlRequest::Monitor).unwrap(),
            r#"{"type":"monitor"}"#
        );
        let req: ControlRequest = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(req, ControlRequest::Stop);
        assert!(serde_json::from_str::<ControlRequest>(r#"{"type":"restart"}"#).is_err());
    }

    #[test]
    fn test_response_wire_format() {
        let ok = ControlResponse::success(&CommandOutcome::Stopped {
            session_closed: true,
        });
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"status":"success","data":{"outcome":"stopped","session_closed":true}}"#
        );
        let err = ControlResponse::error("monitor is not running");
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"status":"error","message":"monitor is not running"}"#
        );
    }

    #[test]
    fn test_outcome_round_trip_through_value() {
        let outcome = CommandOutcome::Failed {
            reason: "docker compose up exited with 1".into(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        let back: CommandOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(back, outcome);
        assert!(back.is_failure());
    }
}
