//! Shared harness for the pipeline integration tests
//!
//! The whole device runs against in-memory collaborators: a [`ChannelTun`]
//! stands in for the kernel TUN and a [`MemoryBind`] captures the
//! ciphertext datagrams the pipeline emits.

mod boundary;
mod handshake_gating;
mod pipeline;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_tunnel::{
    ChannelTun, Device, DeviceConfig, HandshakeCrypto, Keypair, MemoryBind, MessageInitiation,
    NoiseError, Peer, PeerConfig, QueueConfig,
};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Deterministic per-test send key
pub const SEND_KEY: [u8; 32] = [0x33; 32];

/// Remote session index used by the test keypairs
pub const REMOTE_INDEX: u32 = 0xDEAD_BEEF;

pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Handshake stub that produces deterministic initiations and counts calls
pub struct StubHandshake {
    pub initiations: AtomicU32,
}

impl StubHandshake {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            initiations: AtomicU32::new(0),
        })
    }

    pub fn initiation_count(&self) -> u32 {
        self.initiations.load(Ordering::Relaxed)
    }
}

impl HandshakeCrypto for StubHandshake {
    fn create_initiation(&self) -> Result<MessageInitiation, NoiseError> {
        self.initiations.fetch_add(1, Ordering::Relaxed);
        Ok(MessageInitiation {
            sender_index: 0x0101,
            ephemeral: [0xEE; 32],
            encrypted_static: [0x55; 48],
            encrypted_timestamp: [0x77; 28],
        })
    }

    fn add_macs(&self, packet: &mut [u8]) {
        packet[MessageInitiation::MAC_OFFSET..].fill(0xAA);
    }
}

/// A fully wired device plus handles on its in-memory collaborators
pub struct Harness {
    pub device: Device,
    pub tun: Arc<ChannelTun>,
    pub bind: Arc<MemoryBind>,
    pub handshake: Arc<StubHandshake>,
    pub peer: Arc<Peer>,
}

impl Harness {
    /// Device with one peer routing 10.0.0.0/24 and fd00::/64
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: DeviceConfig) -> Self {
        init_tracing();

        let tun = Arc::new(ChannelTun::new("test0"));
        let bind = Arc::new(MemoryBind::new());
        let device = Device::new(
            Arc::clone(&tun) as Arc<dyn rust_tunnel::TunDevice>,
            Arc::clone(&bind) as Arc<dyn rust_tunnel::Bind>,
            config,
        )
        .expect("device construction");

        let handshake = StubHandshake::new();
        let peer = device
            .add_peer(
                &PeerConfig {
                    public_key: BASE64.encode([0x01; 32]),
                    endpoint: Some("192.0.2.10:51820".into()),
                    allowed_ips: vec!["10.0.0.0/24".into(), "fd00::/64".into()],
                    persistent_keepalive_secs: None,
                },
                Arc::clone(&handshake) as Arc<dyn HandshakeCrypto>,
            )
            .expect("add peer");

        Self {
            device,
            tun,
            bind,
            handshake,
            peer,
        }
    }

    /// Install a fresh initiator keypair using [`SEND_KEY`]
    pub fn install_keypair(&self) -> Arc<Keypair> {
        let keypair = Arc::new(Keypair::new(SEND_KEY, true, REMOTE_INDEX));
        self.peer.keypair_installed(Arc::clone(&keypair));
        keypair
    }

    /// Inject an IPv4 packet destined for the test peer
    pub async fn inject_v4(&self, len: usize) {
        self.tun
            .inject(ipv4_packet([10, 0, 0, 7], len))
            .await
            .expect("inject");
    }

    /// Wait for the next transport datagram (type 4), skipping handshakes
    pub async fn next_transport(&self) -> Vec<u8> {
        loop {
            let sent = tokio::time::timeout(Duration::from_secs(5), self.bind.next_sent())
                .await
                .expect("datagram should arrive")
                .expect("bind open");
            if sent.data[0] == 4 {
                return sent.data;
            }
        }
    }
}

pub fn test_config() -> DeviceConfig {
    DeviceConfig {
        encryption_workers: 4,
        buffer_pool_capacity: 64,
        queue: QueueConfig {
            encryption_depth: 128,
            nonce_depth: 128,
            outbound_depth: 128,
        },
        ..DeviceConfig::default()
    }
}

/// A minimal IPv4 packet of `len` bytes to `dst` (len >= 20)
pub fn ipv4_packet(dst: [u8; 4], len: usize) -> Vec<u8> {
    assert!(len >= 20, "IPv4 packets need a 20-byte header");
    let mut packet = vec![0u8; len];
    packet[0] = 0x45; // version 4, IHL 5
    packet[2] = u8::try_from(len >> 8).unwrap();
    packet[3] = u8::try_from(len & 0xFF).unwrap();
    packet[8] = 64; // TTL
    packet[9] = 17; // UDP
    packet[12..16].copy_from_slice(&[10, 0, 0, 1]); // src
    packet[16..20].copy_from_slice(&dst);
    packet
}

/// A minimal IPv6 packet of `len` bytes to `dst` (len >= 40)
pub fn ipv6_packet(dst: [u8; 16], len: usize) -> Vec<u8> {
    assert!(len >= 40, "IPv6 packets need a 40-byte header");
    let mut packet = vec![0u8; len];
    packet[0] = 0x60; // version 6
    let payload = u16::try_from(len - 40).unwrap();
    packet[4..6].copy_from_slice(&payload.to_be_bytes());
    packet[6] = 17; // UDP
    packet[7] = 64; // hop limit
    packet[8] = 0xfd; // src fd00::1
    packet[23] = 1;
    packet[24..40].copy_from_slice(&dst);
    packet
}

/// Parse the counter out of a transport datagram header
pub fn transport_counter(datagram: &[u8]) -> u64 {
    u64::from_le_bytes(datagram[8..16].try_into().unwrap())
}

/// Parse the receiver index out of a transport datagram header
pub fn transport_receiver(datagram: &[u8]) -> u32 {
    u32::from_le_bytes(datagram[4..8].try_into().unwrap())
}
