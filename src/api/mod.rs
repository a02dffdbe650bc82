//! Docker-compatible REST API module
//!
//! `/containers/*`, `/images/*`, `/volumes/*`, `/exec/*`, `/version`,
//! `/info`, `/events`, `/system/df` plus the VM control routes. Served on
//! the API Unix socket and optionally on TCP.

mod handlers;
mod middleware;
mod router;

pub use router::{build_router, ApiState};
