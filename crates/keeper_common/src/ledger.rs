//! Session and statistics ledger.
//!
//! The ledger is a left fold over the event log: [`Ledger::apply`] takes the
//! current state and one event and produces the next state, depending on
//! nothing but the event's own timestamp. The live monitor applies events one
//! at a time as it emits them; history repair folds the whole log at once with
//! [`Ledger::rebuild_from_scratch`]. Both paths run the same code, so their
//! results are identical for the same log.
//!
//! Irregularities (duplicate records, stops without a session, starts while a
//! session is still open, timestamps going backwards) never abort the fold.
//! They are counted in [`AnomalyReport`] and processing continues in log order.

use crate::types::{Event, EventKind};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Gap left between a stale session's forced end and the start that replaced it.
pub const STALE_SESSION_GAP_MS: i64 = 1;

fn non_negative(d: Duration) -> Duration {
    if d < Duration::zero() {
        Duration::zero()
    } else {
        d
    }
}

/// One contiguous period of the server being up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub start: DateTime<Utc>,
    /// `None` while the session is open
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    pub start_kind: EventKind,
    #[serde(default)]
    pub end_kind: Option<EventKind>,
    /// Server reported healthy at least once during the session
    #[serde(default)]
    pub confirmed: bool,
    /// Closed by a later start instead of a stop
    #[serde(default)]
    pub unterminated: bool,
}

impl Session {
    fn open(start: DateTime<Utc>, start_kind: EventKind) -> Self {
        Self {
            start,
            end: None,
            start_kind,
            end_kind: None,
            confirmed: false,
            unterminated: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Length of a closed session; `None` while open.
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| non_negative(end - self.start))
    }

    /// Length so far, measuring an open session up to `now`.
    pub fn duration_at(&self, now: DateTime<Utc>) -> Duration {
        non_negative(self.end.unwrap_or(now) - self.start)
    }
}

/// Aggregate counters derived from the event sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub start_count: u64,
    pub stop_count: u64,
    pub manual_starts: u64,
    pub auto_starts: u64,
    pub manual_stops: u64,
    pub auto_stops: u64,
    pub start_failures: u64,
    pub last_start: Option<DateTime<Utc>>,
    pub last_stop: Option<DateTime<Utc>>,
    pub last_health_ok: Option<DateTime<Utc>>,
    pub last_health_lost: Option<DateTime<Utc>>,
    pub longest_session_ms: i64,
    pub total_uptime_ms: i64,
    /// Starts per UTC day, keyed `YYYY-MM-DD`
    pub daily_starts: BTreeMap<String, u64>,
}

impl Stats {
    pub fn longest_session(&self) -> Duration {
        Duration::milliseconds(self.longest_session_ms)
    }

    /// Uptime summed over closed sessions.
    pub fn total_uptime(&self) -> Duration {
        Duration::milliseconds(self.total_uptime_ms)
    }

    pub fn starts_on(&self, date: NaiveDate) -> u64 {
        self.daily_starts
            .get(&date.format("%Y-%m-%d").to_string())
            .copied()
            .unwrap_or(0)
    }

    fn record_closed(&mut self, duration: Duration) {
        let ms = duration.num_milliseconds();
        self.total_uptime_ms += ms;
        self.longest_session_ms = self.longest_session_ms.max(ms);
    }
}

/// Counts of data-integrity irregularities seen while folding a log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyReport {
    pub duplicate_event: u64,
    pub orphan_stop: u64,
    pub unterminated_session: u64,
    pub out_of_order_timestamp: u64,
    pub parse_error: u64,
}

impl AnomalyReport {
    pub fn total(&self) -> u64 {
        self.categories().iter().map(|(_, n)| n).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }

    pub fn categories(&self) -> [(&'static str, u64); 5] {
        [
            ("duplicate_event", self.duplicate_event),
            ("orphan_stop", self.orphan_stop),
            ("unterminated_session", self.unterminated_session),
            ("out_of_order_timestamp", self.out_of_order_timestamp),
            ("parse_error", self.parse_error),
        ]
    }

    /// Counts added since `earlier`.
    pub fn since(&self, earlier: &AnomalyReport) -> AnomalyReport {
        AnomalyReport {
            duplicate_event: self.duplicate_event - earlier.duplicate_event,
            orphan_stop: self.orphan_stop - earlier.orphan_stop,
            unterminated_session: self.unterminated_session - earlier.unterminated_session,
            out_of_order_timestamp: self.out_of_order_timestamp - earlier.out_of_order_timestamp,
            parse_error: self.parse_error - earlier.parse_error,
        }
    }
}

impl fmt::Display for AnomalyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .categories()
            .iter()
            .map(|(name, n)| format!("{}={}", name, n))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// `false` when the event was skipped as a duplicate
    pub recorded: bool,
    /// Anomalies this event added
    pub anomalies: AnomalyReport,
}

/// Sessions, stats and anomaly counts folded from an event sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    pub sessions: Vec<Session>,
    pub stats: Stats,
    pub anomalies: AnomalyReport,
    healthy: bool,
    last_event: Option<Event>,
}

impl Ledger {
    /// Fold `events` in order starting from the empty ledger.
    pub fn rebuild_from_scratch<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut ledger = Ledger::default();
        for event in events {
            ledger.apply(event);
        }
        ledger
    }

    pub fn open_session(&self) -> Option<&Session> {
        self.sessions.last().filter(|s| s.is_open())
    }

    fn open_session_mut(&mut self) -> Option<&mut Session> {
        self.sessions.last_mut().filter(|s| s.is_open())
    }

    /// A session is open and the latest health event inside it was OK.
    pub fn is_healthy(&self) -> bool {
        self.healthy && self.open_session().is_some()
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.last_event.as_ref()
    }

    pub fn closed_sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().filter(|s| !s.is_open())
    }

    pub fn apply(&mut self, event: &Event) -> Applied {
        let before = self.anomalies;

        if let Some(prev) = self.last_event {
            if prev == *event {
                self.anomalies.duplicate_event += 1;
                return Applied {
                    recorded: false,
                    anomalies: self.anomalies.since(&before),
                };
            }
            if event.timestamp < prev.timestamp {
                self.anomalies.out_of_order_timestamp += 1;
            }
        }
        self.last_event = Some(*event);

        match event.kind {
            EventKind::ManualStart | EventKind::AutoStart => self.record_start(event),
            EventKind::ManualStop | EventKind::AutoStop => self.record_stop(event),
            EventKind::StartFailed => self.record_start_failure(event),
            EventKind::HealthOk => {
                self.stats.last_health_ok = Some(event.timestamp);
                self.healthy = true;
                if let Some(open) = self.open_session_mut() {
                    open.confirmed = true;
                }
            }
            EventKind::HealthLost => {
                self.stats.last_health_lost = Some(event.timestamp);
                self.healthy = false;
            }
        }

        Applied {
            recorded: true,
            anomalies: self.anomalies.since(&before),
        }
    }

    fn record_start(&mut self, event: &Event) {
        let forced_end = event.timestamp - Duration::milliseconds(STALE_SESSION_GAP_MS);
        let stale = self.open_session_mut().map(|open| {
            open.end = Some(forced_end.max(open.start));
            open.unterminated = true;
            open.duration().unwrap_or_else(Duration::zero)
        });
        if let Some(duration) = stale {
            self.anomalies.unterminated_session += 1;
            self.stats.record_closed(duration);
        }

        self.sessions.push(Session::open(event.timestamp, event.kind));
        self.healthy = false;

        let stats = &mut self.stats;
        stats.start_count += 1;
        if event.kind == EventKind::ManualStart {
            stats.manual_starts += 1;
        } else {
            stats.auto_starts += 1;
        }
        stats.last_start = Some(event.timestamp);
        let day = event.timestamp.format("%Y-%m-%d").to_string();
        *stats.daily_starts.entry(day).or_insert(0) += 1;
    }

    fn record_stop(&mut self, event: &Event) {
        self.stats.stop_count += 1;
        if event.kind == EventKind::ManualStop {
            self.stats.manual_stops += 1;
        } else {
            self.stats.auto_stops += 1;
        }
        self.stats.last_stop = Some(event.timestamp);

        if !self.close_open(event) {
            self.anomalies.orphan_stop += 1;
        }
        self.healthy = false;
    }

    fn record_start_failure(&mut self, event: &Event) {
        self.stats.start_failures += 1;
        self.close_open(event);
        self.healthy = false;
    }

    /// Close the open session at `event`; `false` if none was open.
    fn close_open(&mut self, event: &Event) -> bool {
        let closed = self.open_session_mut().map(|open| {
            open.end = Some(event.timestamp);
            open.end_kind = Some(event.kind);
            open.duration().unwrap_or_else(Duration::zero)
        });
        match closed {
            Some(duration) => {
                self.stats.record_closed(duration);
                true
            }
            None => false,
        }
    }
}
