//! Keeper daemon library - exposes modules for testing.

pub mod control;
pub mod machine;
pub mod monitor;
pub mod notifier;
