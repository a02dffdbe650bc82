//! Configuration management module
//!
//! Layered configuration: TOML file, then `SERVIN_*` environment variables,
//! then CLI flags. Last wins.

mod config;

pub use config::*;
