//! Volume management module

mod manager;

pub use manager::{Volume, VolumeManager};
