//! Command implementations for keeperctl

use crate::client::ControlClient;
use crate::output::{self, count_colored, print_kv};
use anyhow::{Context, Result};
use chrono::Utc;
use keeper_common::compose::{self, ComposeProbe};
use keeper_common::ipc::{CommandOutcome, ControlRequest, MonitorSnapshot};
use keeper_common::repair::{self, RepairOptions};
use keeper_common::uptime::{end_label, format_duration, format_duration_ms, UptimeReport};
use keeper_common::{Config, Event, EventLog, KeeperError, SnapshotStore, Status};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};

/// Parse errors listed individually before the rest are summarized.
const SHOWN_PARSE_ERRORS: usize = 10;

/// Rebuild sessions and stats from the event log.
pub fn repair(
    config: &Config,
    log_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let data_dir = data_dir.unwrap_or_else(|| config.storage.data_dir.clone());
    let log = match log_path {
        Some(path) => EventLog::new(path),
        None => EventLog::in_dir(&data_dir),
    };
    let store = SnapshotStore::new(&data_dir, config.storage.backup_generations);

    let report = match repair::repair(&log, &store, RepairOptions { dry_run }) {
        Ok(report) => report,
        Err(KeeperError::LogMissing(path)) => {
            anyhow::bail!("No event log at {}; nothing to repair", path.display())
        }
        Err(e) => return Err(e).context("Repair failed"),
    };

    output::header("History repair");
    print_kv("event log", log.path().display());
    print_kv("events read", report.events_read);

    if !report.parse_errors.is_empty() {
        println!();
        println!("  {}", "Skipped records:".yellow());
        for err in report.parse_errors.iter().take(SHOWN_PARSE_ERRORS) {
            println!("    {}", err);
        }
        let hidden = report.parse_errors.len().saturating_sub(SHOWN_PARSE_ERRORS);
        if hidden > 0 {
            println!("    ... and {} more", hidden);
        }
    }

    println!();
    println!("  {}", "Anomalies:".bold());
    for (name, count) in report.anomalies().categories() {
        println!("    {:24} {}", name, count_colored(count));
    }

    println!();
    print_kv("sessions", report.ledger.sessions.len());
    print_kv("total starts", report.ledger.stats.start_count);
    print_kv("total stops", report.ledger.stats.stop_count);
    println!();

    if report.written {
        output::display_success(&format!(
            "Wrote {} and {}",
            store.sessions_path().display(),
            store.stats_path().display()
        ));
    } else {
        output::display_warning("Dry run: snapshot files left untouched");
    }
    println!("{}", report.summary());
    Ok(())
}

/// Uptime report from the persisted snapshot.
pub fn stats(config: &Config, json: bool) -> Result<()> {
    let store = SnapshotStore::new(&config.storage.data_dir, config.storage.backup_generations);
    let (sessions, stats) = store.load_or_default();
    let report = UptimeReport::build(&sessions, &stats, Utc::now());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    output::header("Server uptime");
    print_kv(
        "sessions",
        format!("{} ({} closed)", report.total_sessions, report.closed_sessions),
    );
    print_kv("total uptime", format_duration_ms(report.total_uptime_ms));
    print_kv("average session", format_duration_ms(report.average_session_ms));
    print_kv("longest session", format_duration_ms(report.longest_session_ms));
    match report.current_session_ms {
        Some(ms) => print_kv("current session", format_duration_ms(ms).green()),
        None => print_kv("current session", "none".dimmed()),
    }

    println!();
    print_kv(
        "starts",
        format!(
            "{} ({} manual, {} auto)",
            report.start_count, report.manual_starts, report.auto_starts
        ),
    );
    print_kv(
        "stops",
        format!(
            "{} ({} manual, {} auto)",
            report.stop_count, report.manual_stops, report.auto_stops
        ),
    );
    print_kv("failed starts", count_colored(report.start_failures));
    print_kv("last start", output::timestamp(report.last_start));
    print_kv("last stop", output::timestamp(report.last_stop));

    println!();
    println!(
        "  {} ({} total)",
        "Starts, last 7 days:".bold(),
        report.recent_start_total()
    );
    for day in &report.recent_starts {
        println!("    {}  {}", day.date, day.starts);
    }

    if !report.uptime_by_day_ms.is_empty() {
        println!();
        println!("  {}", "Uptime by day:".bold());
        for (date, ms) in report.uptime_by_day_ms.iter().rev().take(14) {
            println!("    {}  {}", date, format_duration_ms(*ms));
        }
    }
    println!();
    Ok(())
}

/// Most recent sessions, newest first.
pub fn sessions(config: &Config, limit: usize) -> Result<()> {
    let store = SnapshotStore::new(&config.storage.data_dir, config.storage.backup_generations);
    let sessions = store
        .load_sessions()
        .context("Failed to read sessions snapshot")?;

    if sessions.is_empty() {
        println!("No sessions recorded.");
        return Ok(());
    }

    let now = Utc::now();
    output::header(&format!("Sessions ({} of {})", limit.min(sessions.len()), sessions.len()));
    println!(
        "  {:24} {:24} {:>10}  {:14} {}",
        "Start", "End", "Duration", "Started by", "Ended"
    );
    for session in sessions.iter().rev().take(limit) {
        let end = match session.end {
            Some(end) => output::timestamp(Some(end)),
            None => "-".to_string(),
        };
        let duration = match session.duration() {
            Some(d) => format_duration(d),
            None => format_duration(session.duration_at(now)),
        };
        let started_by = if session.start_kind.is_manual() {
            "manual"
        } else {
            "auto"
        };
        let label = end_label(session);
        let label = match label {
            "open" => label.green().to_string(),
            "unterminated" | "start failed" => label.yellow().to_string(),
            _ => label.to_string(),
        };
        println!(
            "  {:24} {:24} {:>10}  {:14} {}",
            output::timestamp(Some(session.start)),
            end,
            duration,
            started_by,
            label
        );
    }
    println!();
    Ok(())
}

/// Last `lines` records of the event log.
pub fn log(config: &Config, lines: usize) -> Result<()> {
    let log = EventLog::in_dir(&config.storage.data_dir);
    let tail = log
        .tail(lines)
        .with_context(|| format!("Failed to read {}", log.path().display()))?;

    if tail.is_empty() {
        println!("Event log is empty.");
        return Ok(());
    }

    for line in tail {
        match Event::from_line(&line) {
            Ok(event) => println!(
                "{}  {}",
                output::timestamp(Some(event.timestamp)).dimmed(),
                event.kind
            ),
            Err(_) => println!("{}  {}", "malformed".red(), line),
        }
    }
    Ok(())
}

/// Probe the Compose project directly, without going through keeperd.
pub async fn status(config: &Config) -> Result<()> {
    compose::validate_setup(&config.compose.dir).context("Invalid compose setup")?;
    let probe = ComposeProbe::new(&config.compose.dir, config.compose.service.clone());

    output::header("Server status");
    let status = match probe.containers().await {
        Ok(containers) => {
            let status = compose::consolidate(&containers);
            print_kv("status", output::status_colored(status));
            for c in &containers {
                let health = if c.health.is_empty() { "-" } else { c.health.as_str() };
                println!("    {:16} {:12} {}", c.service, c.state, health);
            }
            status
        }
        Err(e) => {
            output::display_warning(&e.to_string());
            print_kv("status", output::status_colored(Status::Unknown));
            Status::Unknown
        }
    };

    if status.is_up() {
        match probe.players().await {
            Some(players) => print_kv("players", players),
            None => print_kv("players", "unavailable".dimmed()),
        }
    }
    println!();
    Ok(())
}

/// Forward a start/stop/monitor request to keeperd.
pub async fn control(socket_path: &Path, request: ControlRequest, json: bool) -> Result<()> {
    let mut client = ControlClient::connect(socket_path).await?;
    let data = client.call(request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    match request {
        ControlRequest::Start | ControlRequest::Stop => {
            let outcome: CommandOutcome =
                serde_json::from_value(data).context("Unexpected reply from keeperd")?;
            match outcome {
                CommandOutcome::AlreadyRunning | CommandOutcome::Pending { .. } => {
                    output::display_warning(&outcome.message())
                }
                _ => output::display_success(&outcome.message()),
            }
        }
        ControlRequest::Monitor => {
            let snapshot: MonitorSnapshot =
                serde_json::from_value(data).context("Unexpected reply from keeperd")?;
            print_snapshot(&snapshot);
        }
    }
    Ok(())
}

fn print_snapshot(s: &MonitorSnapshot) {
    output::header("Monitor");
    let phase = output::phase_colored(&s.phase);
    match s.phase_since {
        Some(since) => print_kv("phase", format!("{} since {}", phase, output::timestamp(Some(since)))),
        None => print_kv("phase", phase),
    }
    if let Some(pending) = s.pending_start {
        print_kv("start pending since", output::timestamp(Some(pending)));
    }
    match &s.open_session {
        Some(session) => print_kv(
            "open session",
            format!(
                "since {} ({})",
                output::timestamp(Some(session.start)),
                format_duration(session.duration_at(Utc::now()))
            ),
        ),
        None => print_kv("open session", "none".dimmed()),
    }
    match (s.last_status, s.last_observed_at) {
        (Some(status), at) => print_kv(
            "last observation",
            format!("{} at {}", output::status_colored(status), output::timestamp(at)),
        ),
        _ => print_kv("last observation", "none yet".dimmed()),
    }
    print_kv("poll interval", format!("{}s", s.poll_interval_secs));
    print_kv("grace window", format!("{}s", s.grace_secs));

    println!();
    print_kv("sessions recorded", s.sessions_recorded);
    print_kv("total starts", s.start_count);
    print_kv("auto-detected events", s.auto_detected_events);
    print_kv("anomalies", count_colored(s.anomalies.total()));
    if s.snapshot_stale {
        println!();
        output::display_warning("Snapshot files lag the event log; run keeperctl repair if this persists");
    }
    println!();
}
