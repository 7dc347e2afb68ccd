//! Core lifecycle types shared by the monitor and history repair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized run-state of the managed service, derived on every poll.
///
/// Never persisted; only the transitions it causes end up in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// No usable observation (probe failed or timed out)
    Unknown,
    Stopped,
    Starting,
    RunningUnhealthy,
    RunningHealthy,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::RunningUnhealthy => "unhealthy",
            Self::RunningHealthy => "running",
        }
    }

    /// Container is up in some form (starting, unhealthy or healthy).
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::RunningUnhealthy | Self::RunningHealthy
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event kinds recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ManualStart,
    ManualStop,
    AutoStart,
    AutoStop,
    HealthOk,
    HealthLost,
    /// Container exited while starting, or never became healthy in time
    StartFailed,
}

impl EventKind {
    pub fn is_start(&self) -> bool {
        matches!(self, Self::ManualStart | Self::AutoStart)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::ManualStop | Self::AutoStop)
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Self::ManualStart | Self::ManualStop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualStart => "manual_start",
            Self::ManualStop => "manual_stop",
            Self::AutoStart => "auto_start",
            Self::AutoStop => "auto_stop",
            Self::HealthOk => "health_ok",
            Self::HealthLost => "health_lost",
            Self::StartFailed => "start_failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    User,
    Monitor,
}

/// A single immutable lifecycle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub source: EventSource,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, kind: EventKind, source: EventSource) -> Self {
        Self {
            timestamp,
            kind,
            source,
        }
    }

    /// Event with the source implied by its kind: manual kinds come from a
    /// user, everything else from the monitor.
    pub fn at(timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        let source = if kind.is_manual() {
            EventSource::User
        } else {
            EventSource::Monitor
        };
        Self::new(timestamp, kind, source)
    }

    /// Encode as a single log line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}
