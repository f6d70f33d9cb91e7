//! In-memory bind
//!
//! Records transmitted datagrams and replays injected ones. The integration
//! tests drive the whole pipeline against this; embedders that carry
//! ciphertext over something other than UDP can use it the same way.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Bind, Endpoint};
use crate::error::BindError;
use crate::BoxFuture;

/// A datagram captured by [`MemoryBind`]
#[derive(Debug, Clone)]
pub struct SentDatagram {
    /// The ciphertext frame
    pub data: Vec<u8>,
    /// Where it was headed
    pub dst: SocketAddr,
}

/// An in-memory [`Bind`] for tests and non-UDP embeddings
pub struct MemoryBind {
    sent_tx: mpsc::UnboundedSender<SentDatagram>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SentDatagram>>,
    inbound_v4_tx: mpsc::UnboundedSender<(Vec<u8>, Arc<Endpoint>)>,
    inbound_v4_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, Arc<Endpoint>)>>,
    inbound_v6_tx: mpsc::UnboundedSender<(Vec<u8>, Arc<Endpoint>)>,
    inbound_v6_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, Arc<Endpoint>)>>,
    fail_sends: AtomicBool,
    closed: AtomicBool,
    port: u16,
}

impl MemoryBind {
    /// Create a new in-memory bind
    #[must_use]
    pub fn new() -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (inbound_v4_tx, inbound_v4_rx) = mpsc::unbounded_channel();
        let (inbound_v6_tx, inbound_v6_rx) = mpsc::unbounded_channel();
        Self {
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
            inbound_v4_tx,
            inbound_v4_rx: tokio::sync::Mutex::new(inbound_v4_rx),
            inbound_v6_tx,
            inbound_v6_rx: tokio::sync::Mutex::new(inbound_v6_rx),
            fail_sends: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            port: 51820,
        }
    }

    /// Wait for the next transmitted datagram
    pub async fn next_sent(&self) -> Option<SentDatagram> {
        self.sent_rx.lock().await.recv().await
    }

    /// Take any already-transmitted datagrams without waiting
    pub async fn drain_sent(&self) -> Vec<SentDatagram> {
        let mut rx = self.sent_rx.lock().await;
        let mut out = Vec::new();
        while let Ok(datagram) = rx.try_recv() {
            out.push(datagram);
        }
        out
    }

    /// Make subsequent sends fail with a transient error
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Inject an IPv4 datagram for `receive_v4`
    pub fn inject_v4(&self, data: Vec<u8>, from: Arc<Endpoint>) {
        let _ = self.inbound_v4_tx.send((data, from));
    }

    /// Inject an IPv6 datagram for `receive_v6`
    pub fn inject_v6(&self, data: Vec<u8>, from: Arc<Endpoint>) {
        let _ = self.inbound_v6_tx.send((data, from));
    }
}

impl Default for MemoryBind {
    fn default() -> Self {
        Self::new()
    }
}

impl Bind for MemoryBind {
    fn send<'a>(
        &'a self,
        buf: &'a [u8],
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<(), BindError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Relaxed) {
                return Err(BindError::Closed);
            }
            if self.fail_sends.load(Ordering::Relaxed) {
                return Err(BindError::Send(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "transient failure injected",
                )));
            }
            let _ = self.sent_tx.send(SentDatagram {
                data: buf.to_vec(),
                dst: endpoint.dst(),
            });
            Ok(())
        })
    }

    fn receive_v4<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<(usize, Arc<Endpoint>), BindError>> {
        Box::pin(async move {
            let mut rx = self.inbound_v4_rx.lock().await;
            match rx.recv().await {
                Some((data, from)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok((n, from))
                }
                None => Err(BindError::Closed),
            }
        })
    }

    fn receive_v6<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<(usize, Arc<Endpoint>), BindError>> {
        Box::pin(async move {
            let mut rx = self.inbound_v6_rx.lock().await;
            match rx.recv().await {
                Some((data, from)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok((n, from))
                }
                None => Err(BindError::Closed),
            }
        })
    }

    fn set_mark(&self, _mark: u32) -> Result<(), BindError> {
        Ok(())
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}
