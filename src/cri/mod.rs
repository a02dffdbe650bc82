//! CRI service module
//!
//! The CRI v1alpha2 runtime and image services, served over the configured
//! Unix socket. Message shapes follow the CRI API; each RPC is one route.

mod router;
mod service;
pub mod types;

pub use router::build_router;
pub use service::CriService;
