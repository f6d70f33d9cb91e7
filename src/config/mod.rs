//! Configuration types and loading

mod loader;
mod types;

pub use loader::{load_config, load_config_str};
pub use types::{DeviceConfig, PeerConfig, QueueConfig, RekeyConfig};
