//! Device assembly
//!
//! A [`Device`] ties the pipeline together: the buffer pool, the shared
//! encryption queue and its worker pool, the routing table, the peer
//! registry, and the TUN reader. Peers are added and removed by the control
//! plane; closing the device (or a fatal TUN read error) stops every task,
//! drains every queue, and shuts the bind down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bind::{parse_endpoint, Bind};
use crate::config::{DeviceConfig, PeerConfig};
use crate::error::{DeviceError, TunnelError};
use crate::io::MessageBufferPool;
use crate::noise::HandshakeCrypto;
use crate::outbound::{run_encryption_worker, run_tun_reader, OutboundElement};
use crate::peer::Peer;
use crate::queue::DropOldestQueue;
use crate::routing::AllowedIps;
use crate::tun::{TunDevice, TunEvent};
use crate::wire::MAX_CONTENT_SIZE;

/// Shared state behind a running device
pub(crate) struct DeviceInner {
    pub(crate) config: DeviceConfig,
    pub(crate) tun: Arc<dyn TunDevice>,
    pub(crate) bind: Arc<dyn Bind>,
    pub(crate) pool: Arc<MessageBufferPool>,
    pub(crate) encryption_queue: Arc<DropOldestQueue<Arc<OutboundElement>>>,
    pub(crate) routing: ArcSwap<AllowedIps>,
    /// TUN MTU, read by the padding step; clamped to the content bound
    pub(crate) mtu: Arc<AtomicUsize>,
    peers: RwLock<HashMap<[u8; 32], Arc<Peer>>>,
    stop_tx: watch::Sender<bool>,
    stopping: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceInner {
    /// Stop everything except the caller's own task.
    ///
    /// Idempotent; also invoked by the TUN reader on a fatal read error.
    pub(crate) async fn begin_shutdown(self: &Arc<Self>) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("device shutting down");

        let _ = self.stop_tx.send(true);
        self.tun.close();

        // unblock senders parked on latches of unencrypted elements
        self.encryption_queue.close();
        for elem in self.encryption_queue.drain() {
            elem.mark_dropped();
            elem.latch.release();
        }

        let peers: Vec<_> = self.peers.write().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.stop().await;
        }

        self.bind.close();
    }
}

/// A running tunnel device (outbound half)
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Assemble a device and start its tasks.
    ///
    /// Spawns the encryption workers, the TUN reader, and the TUN event
    /// task; must be called from within a tokio runtime.
    pub fn new(
        tun: Arc<dyn TunDevice>,
        bind: Arc<dyn Bind>,
        config: DeviceConfig,
    ) -> Result<Self, TunnelError> {
        config.validate()?;
        if let Some(mark) = config.fwmark {
            bind.set_mark(mark)?;
        }

        let (stop_tx, _) = watch::channel(false);
        let mtu = Arc::new(AtomicUsize::new(tun.mtu().min(MAX_CONTENT_SIZE)));

        let inner = Arc::new(DeviceInner {
            pool: Arc::new(MessageBufferPool::new(config.buffer_pool_capacity)),
            encryption_queue: Arc::new(DropOldestQueue::new(config.queue.encryption_depth)),
            routing: ArcSwap::from_pointee(AllowedIps::new()),
            mtu,
            peers: RwLock::new(HashMap::new()),
            stop_tx,
            stopping: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
            tun,
            bind,
        });

        {
            // subscribe before returning so no event can slip past
            let events = inner.tun.events();
            let mut tasks = inner.tasks.lock();
            for id in 0..inner.config.encryption_workers {
                tasks.push(tokio::spawn(run_encryption_worker(
                    id,
                    Arc::clone(&inner.encryption_queue),
                    Arc::clone(&inner.mtu),
                    inner.stop_tx.subscribe(),
                )));
            }
            tasks.push(tokio::spawn(run_tun_reader(Arc::clone(&inner))));
            tasks.push(tokio::spawn(run_tun_events(Arc::clone(&inner), events)));
        }

        info!(
            workers = inner.config.encryption_workers,
            port = inner.bind.port(),
            "device started"
        );

        Ok(Self { inner })
    }

    /// Add a peer and start its pipeline tasks
    pub fn add_peer(
        &self,
        config: &PeerConfig,
        handshake: Arc<dyn HandshakeCrypto>,
    ) -> Result<Arc<Peer>, TunnelError> {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(DeviceError::ShuttingDown.into());
        }
        config.validate()?;
        let public_key = config.decode_public_key()?;
        let endpoint = config
            .endpoint
            .as_deref()
            .map(parse_endpoint)
            .transpose()?;

        let mut peers = self.inner.peers.write();
        if peers.contains_key(&public_key) {
            return Err(DeviceError::PeerExists.into());
        }

        let peer = Peer::new(
            public_key,
            handshake,
            endpoint,
            config.persistent_keepalive(),
            Arc::clone(&self.inner.pool),
            Arc::clone(&self.inner.encryption_queue),
            Arc::clone(&self.inner.bind),
            self.inner.config.rekey,
            self.inner.config.queue,
        );
        peer.start();
        peers.insert(public_key, Arc::clone(&peer));

        // route the allowed networks to the new peer (validated above)
        let mut table = (**self.inner.routing.load()).clone();
        for net in &config.allowed_ips {
            if let Ok(net) = net.parse::<ipnet::IpNet>() {
                table.insert(net, Arc::clone(&peer));
            }
        }
        self.inner.routing.store(Arc::new(table));

        info!(peer = %peer, "peer added");
        Ok(peer)
    }

    /// Stop a peer, unroute it, and drain its queues
    pub async fn remove_peer(&self, public_key: &[u8; 32]) -> Result<(), TunnelError> {
        let peer = self
            .inner
            .peers
            .write()
            .remove(public_key)
            .ok_or(DeviceError::PeerNotFound)?;

        let mut table = (**self.inner.routing.load()).clone();
        table.remove_peer(&peer);
        self.inner.routing.store(Arc::new(table));

        peer.stop().await;
        info!(peer = %peer, "peer removed");
        Ok(())
    }

    /// Look up a peer by its static public key
    #[must_use]
    pub fn peer(&self, public_key: &[u8; 32]) -> Option<Arc<Peer>> {
        self.inner.peers.read().get(public_key).cloned()
    }

    /// Number of configured peers
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    /// The device's message buffer pool
    #[must_use]
    pub fn pool(&self) -> &Arc<MessageBufferPool> {
        &self.inner.pool
    }

    /// MTU currently applied to padding
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.inner.mtu.load(Ordering::Relaxed)
    }

    /// Stop every task, drain every queue, close the bind
    pub async fn close(&self) {
        self.inner.begin_shutdown().await;
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("device closed");
    }
}

/// Track TUN interface events, keeping the padding MTU current
async fn run_tun_events(device: Arc<DeviceInner>, mut events: broadcast::Receiver<TunEvent>) {
    let mut stop = device.stop_tx.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            event = events.recv() => match event {
                Ok(TunEvent::Up(mtu) | TunEvent::MtuUpdate(mtu)) => {
                    let clamped = mtu.min(MAX_CONTENT_SIZE);
                    device.mtu.store(clamped, Ordering::Relaxed);
                    debug!(mtu = clamped, "TUN MTU updated");
                }
                Ok(TunEvent::Down) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
