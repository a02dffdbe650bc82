//! Host platform detection module
//!
//! Probed once at daemon start; the result drives execution-path and
//! VM-provider selection.

mod probe;

pub use probe::{HostOs, Platform, PrivilegeLevel};
