//! History Engine Tests
//!
//! End-to-end checks of the event log, ledger fold, snapshot store and repair
//! working together on a real data directory.
//!
//! ## Properties
//!
//! - Folding events one at a time equals rebuilding from scratch
//! - No prefix of any event sequence has more than one open session
//! - Repair output matches the live fold for the same log

use chrono::{DateTime, Duration, TimeZone, Utc};
use keeper_common::repair::{repair, RepairOptions};
use keeper_common::store::backup_path;
use keeper_common::{Event, EventKind, EventLog, EventSource, KeeperError, Ledger, SnapshotStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::OpenOptions;
use std::io::Write;
use tempfile::TempDir;

// ============================================================================
// HELPERS
// ============================================================================

const KINDS: [EventKind; 7] = [
    EventKind::ManualStart,
    EventKind::ManualStop,
    EventKind::AutoStart,
    EventKind::AutoStop,
    EventKind::HealthOk,
    EventKind::HealthLost,
    EventKind::StartFailed,
];

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

fn at(secs: i64, kind: EventKind) -> Event {
    Event::at(base() + Duration::seconds(secs), kind)
}

/// Random sequence with occasional duplicates and backwards timestamps.
fn random_events(rng: &mut StdRng, len: usize) -> Vec<Event> {
    let mut events: Vec<Event> = Vec::with_capacity(len);
    let mut clock = 0i64;
    for _ in 0..len {
        if let Some(&prev) = events.last() {
            if rng.gen_bool(0.05) {
                events.push(prev);
                continue;
            }
        }
        clock += if rng.gen_bool(0.1) {
            -rng.gen_range(1..600)
        } else {
            rng.gen_range(0..7200)
        };
        let kind = KINDS[rng.gen_range(0..KINDS.len())];
        let source = if rng.gen_bool(0.5) {
            EventSource::User
        } else {
            EventSource::Monitor
        };
        events.push(Event::new(base() + Duration::seconds(clock), kind, source));
    }
    events
}

fn open_sessions(ledger: &Ledger) -> usize {
    ledger.sessions.iter().filter(|s| s.is_open()).count()
}

// ============================================================================
// FOLD PROPERTIES
// ============================================================================

#[test]
fn prop_rebuild_equals_incremental_fold() {
    let mut rng = StdRng::seed_from_u64(0x6b65_6570);
    for _ in 0..200 {
        let len = rng.gen_range(0..80);
        let events = random_events(&mut rng, len);

        let mut live = Ledger::default();
        for event in &events {
            live.apply(event);
        }
        assert_eq!(live, Ledger::rebuild_from_scratch(&events));
    }
}

#[test]
fn prop_at_most_one_open_session() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..200 {
        let events = random_events(&mut rng, 60);
        let mut ledger = Ledger::default();
        for event in &events {
            ledger.apply(event);
            assert!(open_sessions(&ledger) <= 1);
            if let Some(pos) = ledger.sessions.iter().position(|s| s.is_open()) {
                assert_eq!(pos, ledger.sessions.len() - 1, "open session must be last");
            }
        }
    }
}

#[test]
fn prop_durations_never_negative() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..100 {
        let events = random_events(&mut rng, 50);
        let ledger = Ledger::rebuild_from_scratch(&events);
        for session in ledger.closed_sessions() {
            assert!(session.duration().unwrap() >= Duration::zero());
        }
        assert!(ledger.stats.total_uptime_ms >= 0);
        assert!(ledger.stats.longest_session_ms <= ledger.stats.total_uptime_ms);
    }
}

// ============================================================================
// LIFECYCLE SCENARIOS
// ============================================================================

#[test]
fn scenario_blip_inside_grace_keeps_one_session() {
    // The monitor never emits anything for a blip shorter than the grace
    // window, so the log holds only the start and the first health OK.
    let ledger = Ledger::rebuild_from_scratch(&[
        at(0, EventKind::AutoStart),
        at(5, EventKind::HealthOk),
    ]);
    assert_eq!(ledger.stats.start_count, 1);
    assert_eq!(ledger.stats.stop_count, 0);
    assert_eq!(ledger.sessions.len(), 1);
    assert!(ledger.sessions[0].is_open());
    assert!(ledger.sessions[0].confirmed);
}

#[test]
fn scenario_sustained_outage_closes_at_grace_expiry() {
    let ledger = Ledger::rebuild_from_scratch(&[
        at(0, EventKind::ManualStart),
        at(5, EventKind::HealthOk),
        at(110, EventKind::HealthLost),
        at(110, EventKind::AutoStop),
    ]);
    assert_eq!(ledger.sessions.len(), 1);
    let session = &ledger.sessions[0];
    assert_eq!(session.end, Some(base() + Duration::seconds(110)));
    assert_eq!(session.duration(), Some(Duration::seconds(110)));
    assert_eq!(session.end_kind, Some(EventKind::AutoStop));
    assert_eq!(ledger.stats.auto_stops, 1);
    assert!(ledger.anomalies.is_clean());
}

// ============================================================================
// REPAIR
// ============================================================================

#[test]
fn repair_empty_log_yields_empty_state() {
    let dir = TempDir::new().unwrap();
    let log = EventLog::in_dir(dir.path());
    std::fs::write(log.path(), "").unwrap();
    let store = SnapshotStore::new(dir.path(), 3);

    let report = repair(&log, &store, RepairOptions::default()).unwrap();
    assert_eq!(report.events_read, 0);
    assert!(report.ledger.sessions.is_empty());
    assert_eq!(report.ledger.stats.start_count, 0);
    assert!(report.anomalies().is_clean());
    assert!(report.written);

    assert!(store.load_sessions().unwrap().is_empty());
    assert_eq!(store.load_stats().unwrap().start_count, 0);
}

#[test]
fn repair_skips_malformed_trailing_line() {
    let dir = TempDir::new().unwrap();
    let log = EventLog::in_dir(dir.path());
    let store = SnapshotStore::new(dir.path(), 3);

    log.append_batch(&[
        at(0, EventKind::ManualStart),
        at(30, EventKind::HealthOk),
        at(3600, EventKind::ManualStop),
    ])
    .unwrap();
    let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
    writeln!(file, "{{\"timestamp\":\"not a time\",\"kind\":\"auto_stop\"}}").unwrap();
    drop(file);

    let report = repair(&log, &store, RepairOptions::default()).unwrap();
    assert_eq!(report.events_read, 3);
    assert_eq!(report.anomalies().parse_error, 1);
    assert_eq!(report.parse_errors[0].line, 4);
    assert_eq!(report.ledger.sessions.len(), 1);
    assert_eq!(report.ledger.stats.start_count, 1);
    assert_eq!(report.ledger.stats.total_uptime(), Duration::hours(1));
}

#[test]
fn repair_counts_every_anomaly_category() {
    let dir = TempDir::new().unwrap();
    let log = EventLog::in_dir(dir.path());
    let store = SnapshotStore::new(dir.path(), 3);

    let dup = at(100, EventKind::AutoStart);
    log.append_batch(&[
        at(0, EventKind::AutoStop), // orphan stop
        dup,
        dup, // duplicate
        at(200, EventKind::AutoStart), // closes the stale session
        at(150, EventKind::AutoStop), // out of order
    ])
    .unwrap();

    let report = repair(&log, &store, RepairOptions::default()).unwrap();
    let a = report.anomalies();
    assert_eq!(a.orphan_stop, 1);
    assert_eq!(a.duplicate_event, 1);
    assert_eq!(a.unterminated_session, 1);
    assert_eq!(a.out_of_order_timestamp, 1);
    assert_eq!(a.parse_error, 0);
    assert_eq!(report.ledger.sessions.len(), 2);
    assert!(report.ledger.open_session().is_none());
}

#[test]
fn repair_matches_live_fold_and_keeps_backup() {
    let dir = TempDir::new().unwrap();
    let log = EventLog::in_dir(dir.path());
    let store = SnapshotStore::new(dir.path(), 3);

    let mut rng = StdRng::seed_from_u64(1234);
    let events = random_events(&mut rng, 120);

    // live path: append and apply one at a time, saving after each
    let mut live = Ledger::default();
    for event in &events {
        log.append(event).unwrap();
        live.apply(event);
    }
    store.save(&live).unwrap();

    // wipe the snapshot, then repair from the log alone
    std::fs::write(store.stats_path(), "{}").unwrap();
    let report = repair(&log, &store, RepairOptions::default()).unwrap();

    assert_eq!(report.ledger, live);
    assert_eq!(store.load_sessions().unwrap(), live.sessions);
    assert_eq!(store.load_stats().unwrap(), live.stats);
    let backup = std::fs::read_to_string(backup_path(store.stats_path(), 1)).unwrap();
    assert_eq!(backup, "{}");
}

#[test]
fn repair_missing_log_reports_log_missing() {
    let dir = TempDir::new().unwrap();
    let log = EventLog::in_dir(dir.path().join("nowhere"));
    let store = SnapshotStore::new(dir.path(), 3);
    match repair(&log, &store, RepairOptions::default()) {
        Err(KeeperError::LogMissing(path)) => assert_eq!(path, log.path()),
        other => panic!("expected LogMissing, got {:?}", other.map(|r| r.events_read)),
    }
}

#[test]
fn recover_then_repair_survives_torn_append() {
    let dir = TempDir::new().unwrap();
    let log = EventLog::in_dir(dir.path());
    let store = SnapshotStore::new(dir.path(), 3);

    log.append_batch(&[at(0, EventKind::AutoStart), at(10, EventKind::HealthOk)])
        .unwrap();
    let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
    file.write_all(b"{\"timestamp\":\"2026-03-01T00:01").unwrap();
    drop(file);

    assert!(log.recover(3).unwrap().is_some());
    let report = repair(&log, &store, RepairOptions::default()).unwrap();
    assert_eq!(report.events_read, 2);
    assert_eq!(report.anomalies().parse_error, 0);
    assert!(report.ledger.is_healthy());
}
