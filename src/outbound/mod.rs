//! The outbound pipeline
//!
//! ```text
//! 1. TUN read            (single task)
//! 2. Routing             (same task)
//! 3. Nonce assignment    (one task per peer, sequential)
//! 4. Encryption          (worker pool, parallel)
//! 5. Transmission        (one task per peer, sequential)
//! ```
//!
//! Per-peer packet order must be preserved while encryption happens out of
//! order. Each element carries a latch: the sequencer arms it before
//! handing the element to the shared encryption queue, the worker that
//! seals the element releases it, and the sequential sender, consuming its
//! own FIFO, waits on each element's latch in turn. Whichever worker
//! finishes first, egress follows submission order.
//!
//! Elements entering the encryption queue are laid out with the plaintext
//! after a reserved 16-byte prefix so the transport header is constructed
//! in place.

mod encrypt;
mod reader;
mod sender;
mod sequencer;

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub(crate) use encrypt::run_encryption_worker;
pub(crate) use reader::run_tun_reader;
pub(crate) use sender::run_sequential_sender;
pub(crate) use sequencer::run_nonce_sequencer;

use crate::io::PooledBuffer;
use crate::noise::Keypair;
use crate::peer::Peer;
use crate::queue::{DropOldestQueue, Latch};

/// Mutable payload of a work element, guarded by a short-lived lock.
///
/// Stage hand-off serializes real access; the lock satisfies the compiler
/// and the occasional cross-stage race (drop-oldest eviction).
pub(crate) struct ElementState {
    /// Owned message buffer; taken by the sender to release it early
    pub buffer: Option<PooledBuffer>,
    /// The packet as a sub-range of `buffer`; starts at the transport
    /// header offset until sealing extends it over header and tag
    pub packet: Range<usize>,
    /// Transport counter, assigned exactly once by the sequencer
    pub nonce: u64,
    /// Session keys the element will be sealed under
    pub keypair: Option<Arc<Keypair>>,
    /// Owning peer
    pub peer: Option<Arc<Peer>>,
}

/// The unit of work flowing through every pipeline stage.
///
/// Shared between the encryption queue and the owning peer's outbound
/// queue; the buffer returns to the pool when the last reference drops.
pub struct OutboundElement {
    dropped: AtomicBool,
    pub(crate) latch: Latch,
    pub(crate) state: Mutex<ElementState>,
}

impl OutboundElement {
    /// Create an element owning `buffer`, with the packet at `packet`
    pub(crate) fn new(buffer: PooledBuffer, packet: Range<usize>) -> Arc<Self> {
        Arc::new(Self {
            dropped: AtomicBool::new(false),
            latch: Latch::new(),
            state: Mutex::new(ElementState {
                buffer: Some(buffer),
                packet,
                nonce: 0,
                keypair: None,
                peer: None,
            }),
        })
    }

    /// Mark the element dropped; downstream stages skip it
    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dropped(&self) {
        self.dropped.store(false, Ordering::Release);
    }

    /// Whether the element was dropped by queue pressure or teardown
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

/// Submit to a peer queue, marking any displaced element dropped
pub(crate) fn submit_to_peer_queue(
    queue: &DropOldestQueue<Arc<OutboundElement>>,
    elem: Arc<OutboundElement>,
) {
    if let Some(evicted) = queue.push(elem) {
        evicted.mark_dropped();
    }
}

/// Submit to the encryption queue.
///
/// A displaced element additionally has its latch released so a sender
/// waiting on it unblocks, sees the dropped flag, and recycles the buffer.
pub(crate) fn submit_to_encryption_queue(
    queue: &DropOldestQueue<Arc<OutboundElement>>,
    elem: Arc<OutboundElement>,
) {
    if let Some(evicted) = queue.push(elem) {
        evicted.mark_dropped();
        evicted.latch.release();
    }
}
