//! Uptime reporting over persisted sessions and stats.
//!
//! Everything here is read-only and derived; nothing feeds back into the ledger.

use crate::ledger::{Session, Stats};
use crate::types::EventKind;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Days covered by the recent-starts series
pub const RECENT_DAYS: i64 = 7;

/// Format a duration in milliseconds for humans.
/// - Under 1 minute: seconds (e.g. 42s)
/// - Under 1 hour: minutes and seconds (e.g. 3m 15s)
/// - Under 1 day: hours and minutes (e.g. 5h 2m)
/// - Otherwise: days and hours (e.g. 2d 4h)
pub fn format_duration_ms(ms: i64) -> String {
    let ms = ms.max(0);
    let secs = ms / 1000;
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let s = secs % 60;
        if s > 0 {
            format!("{}m {}s", secs / 60, s)
        } else {
            format!("{}m", secs / 60)
        }
    } else if secs < 86_400 {
        let m = (secs % 3600) / 60;
        if m > 0 {
            format!("{}h {}m", secs / 3600, m)
        } else {
            format!("{}h", secs / 3600)
        }
    } else {
        let h = (secs % 86_400) / 3600;
        if h > 0 {
            format!("{}d {}h", secs / 86_400, h)
        } else {
            format!("{}d", secs / 86_400)
        }
    }
}

pub fn format_duration(d: Duration) -> String {
    format_duration_ms(d.num_milliseconds())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayStarts {
    pub date: NaiveDate,
    pub starts: u64,
}

/// Snapshot of lifetime uptime figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UptimeReport {
    pub total_sessions: usize,
    pub closed_sessions: usize,
    pub total_uptime_ms: i64,
    pub average_session_ms: i64,
    pub longest_session_ms: i64,
    /// Closed-session uptime attributed to the UTC day each session started
    pub uptime_by_day_ms: BTreeMap<NaiveDate, i64>,
    /// Running time of the open session, if any, measured to the report time
    pub current_session_ms: Option<i64>,
    pub start_count: u64,
    pub stop_count: u64,
    pub manual_starts: u64,
    pub auto_starts: u64,
    pub manual_stops: u64,
    pub auto_stops: u64,
    pub start_failures: u64,
    pub last_start: Option<DateTime<Utc>>,
    pub last_stop: Option<DateTime<Utc>>,
    /// Newest day first
    pub recent_starts: Vec<DayStarts>,
}

impl UptimeReport {
    pub fn build(sessions: &[Session], stats: &Stats, now: DateTime<Utc>) -> Self {
        let mut uptime_by_day_ms: BTreeMap<NaiveDate, i64> = BTreeMap::new();
        let mut closed = 0usize;
        for session in sessions {
            if let Some(duration) = session.duration() {
                closed += 1;
                *uptime_by_day_ms.entry(session.start.date_naive()).or_insert(0) +=
                    duration.num_milliseconds();
            }
        }

        let average_session_ms = if closed > 0 {
            stats.total_uptime_ms / closed as i64
        } else {
            0
        };

        let current_session_ms = sessions
            .last()
            .filter(|s| s.is_open())
            .map(|s| s.duration_at(now).num_milliseconds());

        let today = now.date_naive();
        let recent_starts = (0..RECENT_DAYS)
            .filter_map(|i| today.checked_sub_signed(Duration::days(i)))
            .map(|date| DayStarts {
                date,
                starts: stats.starts_on(date),
            })
            .collect();

        Self {
            total_sessions: sessions.len(),
            closed_sessions: closed,
            total_uptime_ms: stats.total_uptime_ms,
            average_session_ms,
            longest_session_ms: stats.longest_session_ms,
            uptime_by_day_ms,
            current_session_ms,
            start_count: stats.start_count,
            stop_count: stats.stop_count,
            manual_starts: stats.manual_starts,
            auto_starts: stats.auto_starts,
            manual_stops: stats.manual_stops,
            auto_stops: stats.auto_stops,
            start_failures: stats.start_failures,
            last_start: stats.last_start,
            last_stop: stats.last_stop,
            recent_starts,
        }
    }

    pub fn recent_start_total(&self) -> u64 {
        self.recent_starts.iter().map(|d| d.starts).sum()
    }
}

/// Short label for how a session ended.
pub fn end_label(session: &Session) -> &'static str {
    match (session.end_kind, session.unterminated) {
        (_, true) => "unterminated",
        (None, false) => "open",
        (Some(EventKind::StartFailed), _) => "start failed",
        (Some(kind), _) if kind.is_manual() => "manual",
        (Some(_), _) => "auto",
    }
}
