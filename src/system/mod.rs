//! System utilities module
//!
//! Entity id generation and atomic file persistence shared by the stores
//! and the lifecycle engine.

mod fsutil;
mod ids;

pub use fsutil::{atomic_write_json, dir_size, read_json};
pub use ids::{new_entity_id, new_image_id, short_id};
