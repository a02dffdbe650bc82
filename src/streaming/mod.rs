//! Streaming hub module
//!
//! One-time tokens for exec/attach/port-forward, and the channel-framed
//! byte streams served over upgraded connections.

mod frame;
mod hub;

pub use frame::{Channel, Frame, ResizeRequest};
pub use hub::{PendingOp, StreamingHub};
