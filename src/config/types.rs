//! Configuration types
//!
//! All types deserialize from JSON with serde and carry defaults, so a
//! configuration file only needs to name what it changes. `validate()` is
//! called by the loader and by [`crate::device::Device`] construction.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Device-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// UDP listen port; 0 picks an ephemeral port
    pub listen_port: u16,
    /// Firewall/routing mark applied to both sockets
    pub fwmark: Option<u32>,
    /// Encryption worker count; defaults to the number of CPUs
    pub encryption_workers: usize,
    /// Message buffer pool capacity
    pub buffer_pool_capacity: usize,
    /// Queue depths
    pub queue: QueueConfig,
    /// Rekey policy tunables
    pub rekey: RekeyConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            fwmark: None,
            encryption_workers: num_cpus::get(),
            buffer_pool_capacity: 1024,
            queue: QueueConfig::default(),
            rekey: RekeyConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption_workers == 0 {
            return Err(ConfigError::ValidationError(
                "encryption_workers must be at least 1".into(),
            ));
        }
        if self.buffer_pool_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "buffer_pool_capacity must be at least 1".into(),
            ));
        }
        self.queue.validate()?;
        self.rekey.validate()?;
        Ok(())
    }
}

/// Depths of the pipeline queues
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Shared encryption queue depth
    pub encryption_depth: usize,
    /// Per-peer nonce queue depth
    pub nonce_depth: usize,
    /// Per-peer outbound queue depth
    pub outbound_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            encryption_depth: 1024,
            nonce_depth: 1024,
            outbound_depth: 1024,
        }
    }
}

impl QueueConfig {
    fn validate(self) -> Result<(), ConfigError> {
        if self.encryption_depth == 0 || self.nonce_depth == 0 || self.outbound_depth == 0 {
            return Err(ConfigError::ValidationError(
                "queue depths must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Rekey policy tunables
///
/// Defaults are the `WireGuard` protocol constants. `rekey_after_*` start
/// proactive handshakes; `reject_after_*` are hard caps past which a keypair
/// refuses to seal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RekeyConfig {
    /// Message count after which a fresh handshake is initiated proactively
    pub rekey_after_messages: u64,
    /// Hard cap: sending refuses at or beyond this counter
    pub reject_after_messages: u64,
    /// Session age after which proactive rekey begins
    pub rekey_after_time: Duration,
    /// Hard cap on session age
    pub reject_after_time: Duration,
    /// Minimum spacing between handshake initiations
    pub rekey_timeout: Duration,
}

impl Default for RekeyConfig {
    fn default() -> Self {
        Self {
            rekey_after_messages: u64::MAX - (1 << 16), // 2^64 - 2^16 - 1
            reject_after_messages: u64::MAX - (1 << 4), // 2^64 - 2^4  - 1
            rekey_after_time: Duration::from_secs(120),
            reject_after_time: Duration::from_secs(180),
            rekey_timeout: Duration::from_secs(5),
        }
    }
}

impl RekeyConfig {
    fn validate(self) -> Result<(), ConfigError> {
        if self.rekey_after_messages >= self.reject_after_messages {
            return Err(ConfigError::ValidationError(
                "rekey_after_messages must be below reject_after_messages".into(),
            ));
        }
        if self.rekey_after_time >= self.reject_after_time {
            return Err(ConfigError::ValidationError(
                "rekey_after_time must be below reject_after_time".into(),
            ));
        }
        if self.rekey_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "rekey_timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a single peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Base64-encoded 32-byte static public key
    pub public_key: String,
    /// Remote UDP endpoint, e.g. `"203.0.113.5:51820"` or `"[2001:db8::1]:51820"`
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Networks routed to this peer, e.g. `["10.0.0.0/24", "fd00::/64"]`
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Keepalive interval in seconds; absent disables persistent keepalives
    #[serde(default)]
    pub persistent_keepalive_secs: Option<u64>,
}

impl PeerConfig {
    /// Decode and validate the public key
    pub fn decode_public_key(&self) -> Result<[u8; 32], ConfigError> {
        let bytes = BASE64.decode(&self.public_key).map_err(|e| {
            ConfigError::ValidationError(format!("public_key is not valid base64: {e}"))
        })?;
        bytes.try_into().map_err(|_| {
            ConfigError::ValidationError("public_key must decode to 32 bytes".into())
        })
    }

    /// Validate the peer configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.decode_public_key()?;
        if let Some(endpoint) = &self.endpoint {
            crate::bind::parse_endpoint(endpoint).map_err(|e| {
                ConfigError::ValidationError(format!("endpoint {endpoint:?}: {e}"))
            })?;
        }
        for net in &self.allowed_ips {
            net.parse::<ipnet::IpNet>().map_err(|e| {
                ConfigError::ValidationError(format!("allowed_ips entry {net:?}: {e}"))
            })?;
        }
        if self.persistent_keepalive_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "persistent_keepalive_secs must be positive when set".into(),
            ));
        }
        Ok(())
    }

    /// Keepalive interval as a duration
    #[must_use]
    pub fn persistent_keepalive(&self) -> Option<Duration> {
        self.persistent_keepalive_secs.map(Duration::from_secs)
    }
}
