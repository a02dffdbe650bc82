//! Event system module
//!
//! Provides a pub/sub event bus for broadcasting daemon events (container
//! lifecycle, image, sandbox, VM) and the journal backing the `/events`
//! stream.

mod bus;

pub use bus::{Actor, EventBus, EventRecord, EventType};
