//! Peer state and lifecycle
//!
//! A [`Peer`] is one remote tunnel endpoint. It owns the two per-peer
//! pipeline queues (nonce and outbound), the edge signals that wake its
//! stalled nonce sequencer, its session-keypair store, timers, and counters.
//! Starting a peer spawns its nonce sequencer and sequential sender (plus a
//! keepalive ticker when configured); stopping it joins the tasks and then
//! drains both queues so every buffer returns to the pool and no element
//! keeps the peer alive through its back-reference.

mod handshake;
mod timers;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub use timers::Timers;

use crate::bind::{Bind, Endpoint};
use crate::config::{QueueConfig, RekeyConfig};
use crate::error::BindError;
use crate::io::MessageBufferPool;
use crate::noise::{HandshakeCrypto, Keypair, KeypairStore};
use crate::outbound::{submit_to_peer_queue, OutboundElement};
use crate::queue::{signal, DropOldestQueue, Signal, SignalReceiver};
use crate::wire::MESSAGE_TRANSPORT_HEADER_SIZE;

/// The per-peer pipeline queues
pub(crate) struct PeerQueues {
    /// Plaintext elements waiting for a nonce (fed by the TUN reader)
    pub nonce: DropOldestQueue<Arc<OutboundElement>>,
    /// Sequenced elements awaiting in-order transmission
    pub outbound: DropOldestQueue<Arc<OutboundElement>>,
}

/// Senders for the peer's edge signals
struct PeerSignals {
    new_keypair: Signal,
    flush: Signal,
}

/// Receiving halves handed to the nonce sequencer at start
pub(crate) struct PeerReceivers {
    pub new_keypair: SignalReceiver,
    pub flush: SignalReceiver,
    pub stop: watch::Receiver<bool>,
}

/// Atomic transmit counters
#[derive(Debug, Default)]
pub struct PeerStats {
    /// Ciphertext bytes handed to the bind
    pub tx_bytes: AtomicU64,
    /// Datagrams handed to the bind
    pub tx_packets: AtomicU64,
    /// Handshake initiations actually transmitted
    pub handshake_initiations: AtomicU64,
}

impl PeerStats {
    /// Get a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> PeerStatsSnapshot {
        PeerStatsSnapshot {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            handshake_initiations: self.handshake_initiations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a peer's transmit counters
#[derive(Debug, Clone, Copy)]
pub struct PeerStatsSnapshot {
    /// Ciphertext bytes handed to the bind
    pub tx_bytes: u64,
    /// Datagrams handed to the bind
    pub tx_packets: u64,
    /// Handshake initiations actually transmitted
    pub handshake_initiations: u64,
}

/// One remote tunnel endpoint
pub struct Peer {
    /// Static public key identifying the peer
    pub(crate) public_key: [u8; 32],
    running: AtomicBool,
    /// True while the nonce sequencer is stalled waiting for a keypair;
    /// read racily by the TUN reader (worst case: a harmless extra
    /// handshake retrigger)
    awaiting_key: AtomicBool,
    /// Current send-side session keys, installed by the handshake subsystem
    pub keypairs: KeypairStore,
    handshake: Arc<dyn HandshakeCrypto>,
    endpoint: ArcSwapOption<Endpoint>,
    pub(crate) queues: PeerQueues,
    signals: PeerSignals,
    receivers: Mutex<Option<PeerReceivers>>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    persistent_keepalive: Option<Duration>,
    /// Transmit counters
    pub stats: PeerStats,
    /// Timer state shared by the handshake triggers
    pub timers: Timers,
    // shared device pieces
    pub(crate) pool: Arc<MessageBufferPool>,
    pub(crate) encryption_queue: Arc<DropOldestQueue<Arc<OutboundElement>>>,
    pub(crate) bind: Arc<dyn Bind>,
    pub(crate) rekey: RekeyConfig,
}

impl Peer {
    #[allow(clippy::too_many_arguments)] // assembled only by Device::add_peer
    pub(crate) fn new(
        public_key: [u8; 32],
        handshake: Arc<dyn HandshakeCrypto>,
        endpoint: Option<Endpoint>,
        persistent_keepalive: Option<Duration>,
        pool: Arc<MessageBufferPool>,
        encryption_queue: Arc<DropOldestQueue<Arc<OutboundElement>>>,
        bind: Arc<dyn Bind>,
        rekey: RekeyConfig,
        queues: QueueConfig,
    ) -> Arc<Self> {
        let (new_keypair_tx, new_keypair_rx) = signal();
        let (flush_tx, flush_rx) = signal();
        let (stop_tx, stop_rx) = watch::channel(false);

        Arc::new(Self {
            public_key,
            running: AtomicBool::new(false),
            awaiting_key: AtomicBool::new(false),
            keypairs: KeypairStore::new(),
            handshake,
            endpoint: ArcSwapOption::from(endpoint.map(Arc::new)),
            queues: PeerQueues {
                nonce: DropOldestQueue::new(queues.nonce_depth),
                outbound: DropOldestQueue::new(queues.outbound_depth),
            },
            signals: PeerSignals {
                new_keypair: new_keypair_tx,
                flush: flush_tx,
            },
            receivers: Mutex::new(Some(PeerReceivers {
                new_keypair: new_keypair_rx,
                flush: flush_rx,
                stop: stop_rx,
            })),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
            persistent_keepalive,
            stats: PeerStats::default(),
            timers: Timers::new(),
            pool,
            encryption_queue,
            bind,
            rekey,
        })
    }

    /// Spawn the peer's sequencer and sender tasks
    pub(crate) fn start(self: &Arc<Self>) {
        let Some(receivers) = self.receivers.lock().take() else {
            return; // already started once
        };
        self.running.store(true, Ordering::Release);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(crate::outbound::run_nonce_sequencer(
            Arc::clone(self),
            receivers,
        )));
        tasks.push(tokio::spawn(crate::outbound::run_sequential_sender(
            Arc::clone(self),
            self.stop_tx.subscribe(),
        )));
        if let Some(interval) = self.persistent_keepalive {
            tasks.push(tokio::spawn(timers::run_keepalive_ticker(
                Arc::clone(self),
                interval,
                self.stop_tx.subscribe(),
            )));
        }
        debug!(peer = %self, "peer started");
    }

    /// Stop the peer: join its tasks, then drain both queues.
    ///
    /// The drain is the barrier that returns every in-flight buffer to the
    /// pool and breaks the element → peer back-reference cycle.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.stop_tx.send(true);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.queues.nonce.close();
        self.queues.outbound.close();
        for elem in self.queues.nonce.drain() {
            elem.mark_dropped();
        }
        for elem in self.queues.outbound.drain() {
            elem.mark_dropped();
            elem.latch.release();
        }
        self.awaiting_key.store(false, Ordering::Relaxed);
        debug!(peer = %self, "peer stopped");
    }

    /// Whether the peer's tasks are running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the nonce sequencer is stalled waiting for a keypair
    #[must_use]
    pub fn awaiting_key(&self) -> bool {
        self.awaiting_key.load(Ordering::Relaxed)
    }

    pub(crate) fn set_awaiting_key(&self, awaiting: bool) {
        self.awaiting_key.store(awaiting, Ordering::Relaxed);
    }

    /// Install a new current keypair and wake the stalled sequencer.
    ///
    /// This is the entry point by which the external handshake subsystem
    /// delivers completed sessions.
    pub fn keypair_installed(&self, keypair: Arc<Keypair>) {
        self.keypairs.install(keypair);
        self.signals.new_keypair.fire();
    }

    /// Discard everything queued ahead of a nonce.
    ///
    /// Fired when a pending session becomes permanently unusable; the
    /// sequencer drains its queue and keeps running.
    pub fn flush_nonce_queue(&self) {
        self.signals.flush.fire();
    }

    /// Queue a keepalive if nothing else is queued for this peer.
    ///
    /// Returns whether a keepalive was queued. The element carries an empty
    /// packet; it is still assigned a nonce and sealed to a 32-byte frame.
    pub fn send_keepalive(&self) -> bool {
        if !self.is_running() || self.awaiting_key() || !self.queues.nonce.is_empty() {
            return false;
        }
        let elem = OutboundElement::new(
            self.pool.get(),
            MESSAGE_TRANSPORT_HEADER_SIZE..MESSAGE_TRANSPORT_HEADER_SIZE,
        );
        debug!(peer = %self, "sending keepalive packet");
        submit_to_peer_queue(&self.queues.nonce, elem);
        true
    }

    /// Current endpoint, if known
    #[must_use]
    pub fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.endpoint.load_full()
    }

    /// Replace the peer's endpoint
    pub fn set_endpoint(&self, endpoint: Arc<Endpoint>) {
        self.endpoint.store(Some(endpoint));
    }

    /// Transmit a raw frame to the peer's endpoint
    pub(crate) async fn send_buffer(&self, buf: &[u8]) -> Result<(), BindError> {
        let Some(endpoint) = self.endpoint.load_full() else {
            return Err(BindError::NoEndpoint);
        };
        self.bind.send(buf, &endpoint).await
    }

    /// The peer's static public key
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let encoded = BASE64.encode(self.public_key);
        write!(f, "peer({}…)", &encoded[..8.min(encoded.len())])
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("public_key", &BASE64.encode(self.public_key))
            .field("running", &self.is_running())
            .field("awaiting_key", &self.awaiting_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::bind::MemoryBind;
    use crate::error::NoiseError;
    use crate::wire::MessageInitiation;

    /// Handshake stub that fails initiation; for tests that never handshake
    struct NoopHandshake;

    impl HandshakeCrypto for NoopHandshake {
        fn create_initiation(&self) -> Result<MessageInitiation, NoiseError> {
            Err(NoiseError::Initiation("noop".into()))
        }

        fn add_macs(&self, _packet: &mut [u8]) {}
    }

    /// A peer wired to in-memory collaborators, for unit tests
    pub(crate) fn stub_peer(public_key: [u8; 32]) -> Arc<Peer> {
        Peer::new(
            public_key,
            Arc::new(NoopHandshake),
            None,
            None,
            Arc::new(MessageBufferPool::new(16)),
            Arc::new(DropOldestQueue::new(16)),
            Arc::new(MemoryBind::new()),
            RekeyConfig::default(),
            QueueConfig {
                encryption_depth: 16,
                nonce_depth: 16,
                outbound_depth: 16,
            },
        )
    }
}
