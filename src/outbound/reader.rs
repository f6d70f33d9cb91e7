//! TUN reader
//!
//! Single task. Reads one plaintext IP packet at a time into a pooled
//! buffer at the transport-header offset, classifies it by the version
//! nibble, routes it to a peer, and submits it to that peer's nonce queue.
//! Packets that cannot proceed (empty reads, oversize, unknown version,
//! unrouted destination, stopped peer) are discarded by reusing the buffer
//! for the next read. A read error is fatal and tears the device down.

use std::sync::Arc;

use tracing::{debug, error};

use super::{submit_to_peer_queue, OutboundElement};
use crate::device::DeviceInner;
use crate::wire::{
    IPV4_HEADER_LEN, IPV4_OFFSET_DST, IPV6_HEADER_LEN, IPV6_OFFSET_DST, MAX_CONTENT_SIZE,
    MESSAGE_TRANSPORT_HEADER_SIZE,
};

pub(crate) async fn run_tun_reader(device: Arc<DeviceInner>) {
    debug!("TUN reader started");

    let mut spare = Some(device.pool.get());

    loop {
        let mut buffer = match spare.take() {
            Some(buffer) => buffer,
            None => device.pool.get(),
        };

        let offset = MESSAGE_TRANSPORT_HEADER_SIZE;
        let size = match device.tun.read(&mut buffer[..], offset).await {
            Ok(size) => size,
            Err(e) => {
                error!(error = %e, "failed to read packet from TUN device");
                device.begin_shutdown().await;
                debug!("TUN reader stopped");
                return;
            }
        };

        if size == 0 || size > MAX_CONTENT_SIZE {
            spare = Some(buffer);
            continue;
        }

        let packet = &buffer[offset..offset + size];

        // classify by the IP version nibble and route on the destination
        let peer = match packet[0] >> 4 {
            4 => {
                if packet.len() < IPV4_HEADER_LEN {
                    spare = Some(buffer);
                    continue;
                }
                let dst: [u8; 4] = packet[IPV4_OFFSET_DST..IPV4_OFFSET_DST + 4]
                    .try_into()
                    .expect("fixed-width slice");
                device.routing.load().lookup_v4(dst)
            }
            6 => {
                if packet.len() < IPV6_HEADER_LEN {
                    spare = Some(buffer);
                    continue;
                }
                let dst: [u8; 16] = packet[IPV6_OFFSET_DST..IPV6_OFFSET_DST + 16]
                    .try_into()
                    .expect("fixed-width slice");
                device.routing.load().lookup_v6(dst)
            }
            version => {
                debug!(version, "received packet with unknown IP version");
                spare = Some(buffer);
                continue;
            }
        };

        let Some(peer) = peer else {
            spare = Some(buffer);
            continue;
        };

        if !peer.is_running() {
            spare = Some(buffer);
            continue;
        }

        // a stalled sequencer means the last initiation may have been lost
        if peer.awaiting_key() {
            if let Err(e) = peer.send_handshake_initiation(false).await {
                debug!(peer = %peer, error = %e, "handshake retrigger failed");
            }
        }

        let elem = OutboundElement::new(buffer, offset..offset + size);
        submit_to_peer_queue(&peer.queues.nonce, elem);
    }
}
