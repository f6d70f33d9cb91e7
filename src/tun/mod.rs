//! TUN device contract
//!
//! The TUN driver itself lives outside this crate; the pipeline consumes it
//! through the object-safe [`TunDevice`] trait. Reads hand up one IP packet
//! at a time into a caller-supplied buffer at a caller-chosen offset, so the
//! encryption stage can construct the transport header in place. A read
//! error is fatal for the owning device.
//!
//! [`ChannelTun`] is the in-memory implementation used by the test suite and
//! by embedders that source packets from somewhere other than a kernel TUN.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{broadcast, mpsc, watch};

use crate::error::TunError;
use crate::BoxFuture;

/// Default MTU reported by [`ChannelTun`]
pub const DEFAULT_MTU: usize = 1420;

/// Capacity of the packet channels inside [`ChannelTun`]
const PACKET_CHANNEL_CAPACITY: usize = 256;

/// TUN interface state events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
    /// The interface came up with the given MTU
    Up(usize),
    /// The interface went down
    Down,
    /// The MTU changed
    MtuUpdate(usize),
}

/// Contract to the TUN driver.
///
/// Object-safe: async methods return boxed futures so the device can hold a
/// `dyn TunDevice`.
pub trait TunDevice: Send + Sync {
    /// Read one IP packet into `buf[offset..]`, returning its length.
    ///
    /// Blocks until a packet is available. An error means the device is
    /// unusable and the caller must tear down.
    fn read<'a>(&'a self, buf: &'a mut [u8], offset: usize) -> BoxFuture<'a, Result<usize, TunError>>;

    /// Write one IP packet from `buf[offset..]`
    fn write<'a>(&'a self, buf: &'a [u8], offset: usize) -> BoxFuture<'a, Result<usize, TunError>>;

    /// Current MTU
    fn mtu(&self) -> usize;

    /// Interface name
    fn name(&self) -> &str;

    /// Subscribe to interface state events
    fn events(&self) -> broadcast::Receiver<TunEvent>;

    /// Close the device, unblocking any pending read
    fn close(&self);
}

/// An in-memory TUN backed by channels.
///
/// Packets injected with [`ChannelTun::inject`] come out of `read`; packets
/// the device `write`s can be collected with [`ChannelTun::next_written`].
pub struct ChannelTun {
    name: String,
    mtu: AtomicUsize,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    events: broadcast::Sender<TunEvent>,
    closed_tx: watch::Sender<bool>,
}

impl ChannelTun {
    /// Create a new channel-backed TUN with the default MTU
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_mtu(name, DEFAULT_MTU)
    }

    /// Create a new channel-backed TUN with an explicit MTU
    #[must_use]
    pub fn with_mtu(name: impl Into<String>, mtu: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(16);
        let (closed_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            mtu: AtomicUsize::new(mtu),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            events,
            closed_tx,
        }
    }

    /// Hand a plaintext packet up to the device, as the kernel would
    pub async fn inject(&self, packet: Vec<u8>) -> Result<(), TunError> {
        if *self.closed_tx.borrow() {
            return Err(TunError::Closed);
        }
        self.inbound_tx
            .send(packet)
            .await
            .map_err(|_| TunError::Closed)
    }

    /// Next packet the device wrote toward the interface
    pub async fn next_written(&self) -> Option<Vec<u8>> {
        self.outbound_rx.lock().await.recv().await
    }

    /// Change the MTU and fire an event
    pub fn set_mtu(&self, mtu: usize) {
        self.mtu.store(mtu, Ordering::Relaxed);
        let _ = self.events.send(TunEvent::MtuUpdate(mtu));
    }

    /// Mark the interface up and fire an event
    pub fn set_up(&self) {
        let _ = self
            .events
            .send(TunEvent::Up(self.mtu.load(Ordering::Relaxed)));
    }
}

impl TunDevice for ChannelTun {
    fn read<'a>(&'a self, buf: &'a mut [u8], offset: usize) -> BoxFuture<'a, Result<usize, TunError>> {
        Box::pin(async move {
            let mut closed = self.closed_tx.subscribe();
            if *closed.borrow() {
                return Err(TunError::Closed);
            }
            let mut rx = self.inbound_rx.lock().await;
            tokio::select! {
                _ = closed.changed() => Err(TunError::Closed),
                packet = rx.recv() => match packet {
                    Some(packet) => {
                        let room = buf.len().saturating_sub(offset);
                        let n = packet.len().min(room);
                        buf[offset..offset + n].copy_from_slice(&packet[..n]);
                        Ok(n)
                    }
                    None => Err(TunError::Closed),
                },
            }
        })
    }

    fn write<'a>(&'a self, buf: &'a [u8], offset: usize) -> BoxFuture<'a, Result<usize, TunError>> {
        Box::pin(async move {
            if *self.closed_tx.borrow() {
                return Err(TunError::Closed);
            }
            let packet = buf[offset..].to_vec();
            let len = packet.len();
            self.outbound_tx
                .send(packet)
                .await
                .map_err(|_| TunError::Closed)?;
            Ok(len)
        })
    }

    fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn events(&self) -> broadcast::Receiver<TunEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
        let _ = self.events.send(TunEvent::Down);
    }
}
