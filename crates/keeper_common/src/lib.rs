//! Keeper Common - shared data model and history engine for Keeper v0.3.0
//!
//! The event log is the source of truth. Sessions and stats are always a fold
//! over it, whether built live by keeperd or reconstructed by `keeperctl repair`.

pub mod compose;
pub mod config;
pub mod error;
pub mod event_log;
pub mod ipc;
pub mod ledger;
pub mod repair;
pub mod store;
pub mod types;
pub mod uptime;

pub use config::Config;
pub use error::{KeeperError, ParseError, Result};
pub use event_log::EventLog;
pub use ledger::{AnomalyReport, Ledger, Session, Stats};
pub use store::SnapshotStore;
pub use types::*;
