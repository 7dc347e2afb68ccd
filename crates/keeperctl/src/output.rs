//! Output formatting - plain ASCII terminal output

use chrono::{DateTime, Utc};
use keeper_common::Status;
use owo_colors::OwoColorize;

pub const SEPARATOR: &str = "------------------------------------------------------------";

/// Key width used by every key/value listing.
pub const KEY_WIDTH: usize = 22;

pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", SEPARATOR.dimmed());
}

pub fn print_kv(key: &str, value: impl std::fmt::Display) {
    println!("  {:width$} {}", key, value, width = KEY_WIDTH);
}

pub fn display_error(message: &str) {
    eprintln!("[ERROR] {}", message.red());
}

pub fn display_success(message: &str) {
    println!("[OK] {}", message.green());
}

pub fn display_warning(message: &str) {
    println!("[WARNING] {}", message.yellow());
}

pub fn timestamp(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "never".to_string(),
    }
}

/// Status word colored by severity.
pub fn status_colored(status: Status) -> String {
    let word = status.as_str();
    match status {
        Status::RunningHealthy => word.green().to_string(),
        Status::Starting | Status::RunningUnhealthy => word.yellow().to_string(),
        Status::Stopped => word.red().to_string(),
        Status::Unknown => word.dimmed().to_string(),
    }
}

/// Monitor phase word colored by severity.
pub fn phase_colored(phase: &str) -> String {
    match phase {
        "healthy" => phase.green().to_string(),
        "starting" | "unhealthy" => phase.yellow().to_string(),
        "faulted" => phase.bright_red().to_string(),
        _ => phase.to_string(),
    }
}

/// Count colored only when non-zero, for anomaly tables.
pub fn count_colored(n: u64) -> String {
    if n == 0 {
        n.to_string()
    } else {
        n.yellow().to_string()
    }
}
