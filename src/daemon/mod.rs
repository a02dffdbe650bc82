//! Daemon supervisor module
//!
//! Process-wide state: subsystem wiring, socket binding, graceful shutdown
//! and live-restore.

mod supervisor;

pub use supervisor::Daemon;
