//! rust-tunnel: outbound data plane for a userspace `WireGuard`-style tunnel
//!
//! This crate implements the transmit half of a point-to-point secure tunnel:
//! plaintext IP packets handed up by a TUN device are routed to a peer,
//! assigned per-peer monotonically increasing nonces, sealed in parallel with
//! ChaCha20-Poly1305, and emitted as ciphertext UDP datagrams in strict
//! per-peer order.
//!
//! # Architecture
//!
//! ```text
//! TUN ──► Reader ──► per-peer nonce queue ──► Sequencer ──┬──► encryption queue ──► Workers
//!                                                         │                           │
//!                                                         └──► per-peer outbound ──► Sender ──► UDP Bind
//!                                                              (latch restores order)
//! ```
//!
//! Encryption runs on a shared worker pool (one task per CPU by default), so
//! a single peer can use every core; a per-element latch lets the sequential
//! sender consume encryption results in submission order regardless of which
//! worker finished first.
//!
//! Handshake cryptography, the session-keypair production, and the TUN driver
//! itself are external collaborators consumed through the [`noise`], [`tun`]
//! and [`bind`] contracts.
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`device`]: Device assembly and lifecycle
//! - [`error`]: Error types
//! - [`io`]: Pooled message buffers
//! - [`noise`]: Session keypairs and the handshake-crypto contract
//! - [`outbound`]: The staged outbound pipeline
//! - [`peer`]: Peer state, timers, and handshake triggers
//! - [`queue`]: Drop-oldest queues, latches, edge signals
//! - [`routing`]: Allowed-IPs longest-prefix lookup
//! - [`tun`]: TUN device contract and the in-memory implementation
//! - [`bind`]: UDP bind with sticky-source transmission
//! - [`wire`]: Bit-exact transport wire format

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::pin::Pin;

pub mod bind;
pub mod config;
pub mod device;
pub mod error;
pub mod io;
pub mod noise;
pub mod outbound;
pub mod peer;
pub mod queue;
pub mod routing;
pub mod tun;
pub mod wire;

// Re-export commonly used types at the crate root
#[cfg(target_os = "linux")]
pub use bind::NativeBind;
pub use bind::{parse_endpoint, Bind, Endpoint, MemoryBind};
pub use config::{load_config, load_config_str, DeviceConfig, PeerConfig, QueueConfig, RekeyConfig};
pub use device::Device;
pub use error::{BindError, ConfigError, DeviceError, NoiseError, TunError, TunnelError};
pub use io::{MessageBufferPool, PooledBuffer};
pub use noise::{HandshakeCrypto, Keypair, KeypairStore};
pub use peer::{Peer, PeerStatsSnapshot};
pub use routing::AllowedIps;
pub use tun::{ChannelTun, TunDevice, TunEvent};
pub use wire::MessageInitiation;

/// Boxed future type for object-safe async trait methods
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
