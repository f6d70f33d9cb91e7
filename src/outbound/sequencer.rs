//! Per-peer nonce sequencer
//!
//! Pops elements from the peer's nonce queue, blocks until a usable session
//! keypair exists (triggering handshake initiations while it waits), then
//! assigns the next send counter and hands the element to the shared
//! encryption queue and then the peer's outbound queue, with the latch
//! armed in between, which is what makes out-of-order encryption safe.

use std::sync::Arc;

use tracing::debug;

use super::{submit_to_encryption_queue, submit_to_peer_queue, OutboundElement};
use crate::peer::{Peer, PeerReceivers};

pub(crate) async fn run_nonce_sequencer(peer: Arc<Peer>, mut rx: PeerReceivers) {
    debug!(peer = %peer, "nonce sequencer started");

    'next_packet: loop {
        peer.set_awaiting_key(false);

        let elem: Arc<OutboundElement> = tokio::select! {
            biased;
            _ = rx.stop.changed() => break,
            elem = peer.queues.nonce.pop() => match elem {
                Some(elem) => elem,
                None => break,
            },
        };

        // wait for a usable keypair
        let keypair = loop {
            if let Some(keypair) = peer.keypairs.current() {
                if keypair.usable_for_sending(&peer.rekey) {
                    break keypair;
                }
            }

            peer.set_awaiting_key(true);
            rx.new_keypair.drain();
            if let Err(e) = peer.send_handshake_initiation(false).await {
                debug!(peer = %peer, error = %e, "handshake initiation failed");
            }
            debug!(peer = %peer, "awaiting keypair");

            tokio::select! {
                biased;
                _ = rx.stop.changed() => break 'next_packet,
                () = rx.flush.wait() => {
                    // the session is gone for good: drop everything queued
                    let stale = peer.queues.nonce.drain();
                    debug!(peer = %peer, dropped = stale.len() + 1, "flushed nonce queue");
                    for elem in stale {
                        elem.mark_dropped();
                    }
                    continue 'next_packet;
                }
                () = rx.new_keypair.wait() => {
                    debug!(peer = %peer, "obtained awaited keypair");
                }
            }
        };
        peer.set_awaiting_key(false);

        // populate the work element
        let nonce = keypair.next_send_nonce();
        // re-test: concurrent senders may have exhausted the counter space
        if nonce >= peer.rekey.reject_after_messages {
            continue;
        }

        {
            let mut state = elem.state.lock();
            state.nonce = nonce;
            state.keypair = Some(Arc::clone(&keypair));
            state.peer = Some(Arc::clone(&peer));
        }
        elem.clear_dropped();
        elem.latch.arm();

        // parallel queue first, then the sequential one
        submit_to_encryption_queue(&peer.encryption_queue, Arc::clone(&elem));
        submit_to_peer_queue(&peer.queues.outbound, elem);
    }

    peer.set_awaiting_key(false);
    debug!(peer = %peer, "nonce sequencer stopped");
}
