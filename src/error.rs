//! Error types for rust-tunnel
//!
//! Errors are categorized by subsystem. Transient transmit failures are
//! logged and swallowed by the pipeline (the transport is lossy by nature);
//! a TUN read failure is fatal and tears the device down.

use std::io;

use thiserror::Error;

/// Top-level error type for rust-tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TUN device errors
    #[error("TUN device error: {0}")]
    Tun(#[from] TunError),

    /// UDP bind errors
    #[error("Bind error: {0}")]
    Bind(#[from] BindError),

    /// Handshake-crypto contract errors
    #[error("Noise error: {0}")]
    Noise(#[from] NoiseError),

    /// Device lifecycle errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// TUN device errors
///
/// Any read-side error is fatal for the device that owns the TUN.
#[derive(Debug, Error)]
pub enum TunError {
    /// The device was closed
    #[error("TUN device closed")]
    Closed,

    /// I/O error from the underlying driver
    #[error("TUN I/O error: {0}")]
    Io(#[from] io::Error),
}

/// UDP bind errors
#[derive(Debug, Error)]
pub enum BindError {
    /// Failed to create a socket
    #[error("Failed to create socket: {0}")]
    SocketCreation(io::Error),

    /// Failed to set a socket option
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption {
        option: &'static str,
        reason: io::Error,
    },

    /// Failed to bind to a local port
    #[error("Failed to bind to port {port}: {reason}")]
    BindFailed { port: u16, reason: io::Error },

    /// Endpoint string could not be parsed
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The peer has no known endpoint to send to
    #[error("No endpoint configured for peer")]
    NoEndpoint,

    /// Transmit failed (transient; the packet is dropped)
    #[error("Send failed: {0}")]
    Send(io::Error),

    /// Receive failed
    #[error("Receive failed: {0}")]
    Receive(io::Error),

    /// Netlink route-listener failure
    #[error("Netlink error: {0}")]
    Netlink(io::Error),

    /// The bind was closed
    #[error("Bind closed")]
    Closed,
}

impl BindError {
    /// Check if this error is recoverable (the pipeline keeps running)
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Send(_) | Self::Receive(_) | Self::NoEndpoint | Self::Netlink(_)
        )
    }
}

/// Handshake-crypto contract errors
#[derive(Debug, Error)]
pub enum NoiseError {
    /// The external crypto module failed to produce an initiation message
    #[error("Failed to create handshake initiation: {0}")]
    Initiation(String),
}

/// Device lifecycle errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A peer with the same public key already exists
    #[error("Peer already exists")]
    PeerExists,

    /// No peer with the given public key
    #[error("Peer not found")]
    PeerNotFound,

    /// The device is shutting down
    #[error("Device is shutting down")]
    ShuttingDown,
}
