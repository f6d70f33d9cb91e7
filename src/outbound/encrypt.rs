//! Encryption workers
//!
//! A fixed pool of tasks, one per CPU by default, all feeding from the
//! shared encryption queue. Each worker writes the transport header into
//! the element's reserved prefix, zero-pads the plaintext to the next
//! multiple of 16 (never past the TUN MTU), seals in place, and releases
//! the element's latch for the sequential sender.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::{ElementState, OutboundElement};
use crate::queue::DropOldestQueue;
use crate::wire::{
    self, MESSAGE_TRANSPORT_HEADER_SIZE, PADDING_MULTIPLE, POLY1305_TAG_SIZE,
};

pub(crate) async fn run_encryption_worker(
    id: usize,
    queue: Arc<DropOldestQueue<Arc<OutboundElement>>>,
    mtu: Arc<AtomicUsize>,
    mut stop: watch::Receiver<bool>,
) {
    debug!(worker = id, "encryption worker started");

    loop {
        let elem: Arc<OutboundElement> = tokio::select! {
            biased;
            _ = stop.changed() => break,
            elem = queue.pop() => match elem {
                Some(elem) => elem,
                None => break,
            },
        };

        // the sender re-checks too; this just skips wasted sealing
        if elem.is_dropped() {
            elem.latch.release();
            continue;
        }

        {
            let mut state = elem.state.lock();
            seal_element(&mut state, mtu.load(Ordering::Relaxed));
        }
        elem.latch.release();
    }

    debug!(worker = id, "encryption worker stopped");
}

/// Header, padding, and in-place seal for one element
fn seal_element(state: &mut ElementState, mtu: usize) {
    let keypair = state
        .keypair
        .clone()
        .expect("sequenced element carries a keypair");
    let nonce = state.nonce;
    let start = state.packet.start;
    let len = state.packet.len();
    let buffer = state
        .buffer
        .as_mut()
        .expect("sequenced element owns its buffer");

    debug_assert_eq!(start, MESSAGE_TRANSPORT_HEADER_SIZE);

    wire::write_transport_header(
        &mut buffer[start - MESSAGE_TRANSPORT_HEADER_SIZE..start],
        keypair.remote_index,
        nonce,
    );

    // zero-extend to the next multiple of 16; the MTU wins over the multiple
    let padded = wire::padded_len(len, mtu);
    debug_assert!(padded % PADDING_MULTIPLE == 0 || padded == mtu || padded == len);
    buffer[start + len..start + padded].fill(0);

    let tag = keypair.seal_transport(nonce, &mut buffer[start..start + padded]);
    buffer[start + padded..start + padded + POLY1305_TAG_SIZE].copy_from_slice(tag.as_slice());

    // the packet now spans header, ciphertext, and tag
    state.packet = start - MESSAGE_TRANSPORT_HEADER_SIZE..start + padded + POLY1305_TAG_SIZE;
}
