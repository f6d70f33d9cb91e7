//! Per-peer sequential sender
//!
//! Consumes the peer's outbound queue in FIFO order, waiting on each
//! element's latch, the reordering barrier that turns parallel encryption
//! back into in-order egress. Transmits via the bind, updates counters and
//! timers, kicks the key-freshness check, and recycles the buffer on every
//! exit path (dropped elements, send failures, and successes alike).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::OutboundElement;
use crate::peer::Peer;
use crate::wire::MESSAGE_KEEPALIVE_SIZE;

pub(crate) async fn run_sequential_sender(peer: Arc<Peer>, mut stop: watch::Receiver<bool>) {
    debug!(peer = %peer, "sequential sender started");

    loop {
        let elem: Arc<OutboundElement> = tokio::select! {
            biased;
            _ = stop.changed() => break,
            elem = peer.queues.outbound.pop() => match elem {
                Some(elem) => elem,
                None => break,
            },
        };

        // the reordering barrier; also woken by teardown
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            () = elem.latch.wait() => {}
        }

        if elem.is_dropped() {
            continue;
        }

        // take the buffer out so it returns to the pool as soon as the
        // element leaves scope, wherever this iteration exits
        let (buffer, packet) = {
            let mut state = elem.state.lock();
            debug_assert!(
                state.peer.as_ref().map_or(false, |p| Arc::ptr_eq(p, &peer)),
                "element consumed by a sender that does not own it"
            );
            (state.buffer.take(), state.packet.clone())
        };
        let Some(buffer) = buffer else {
            continue;
        };
        let frame = &buffer[packet];

        if let Err(e) = peer.send_buffer(frame).await {
            debug!(peer = %peer, error = %e, "failed to send authenticated packet");
            continue;
        }

        peer.stats
            .tx_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        peer.stats.tx_packets.fetch_add(1, Ordering::Relaxed);

        peer.timers.any_authenticated_packet_traversal();
        if frame.len() != MESSAGE_KEEPALIVE_SIZE {
            peer.timers.data_sent();
        }
        peer.keep_key_fresh_sending().await;
    }

    debug!(peer = %peer, "sequential sender stopped");
}
