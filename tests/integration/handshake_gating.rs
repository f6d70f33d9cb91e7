//! Handshake gating: the no-key stall, the flush escape hatch, and the
//! initiation rate limit as observed end to end.

use std::time::Duration;

use rust_tunnel::wire::MESSAGE_INITIATION_SIZE;

use super::{transport_counter, Harness};

#[tokio::test(flavor = "multi_thread")]
async fn test_no_key_stall_then_unblock() {
    let harness = Harness::new();

    // no keypair installed: the packet stalls and an initiation fires
    harness.inject_v4(80).await;

    let sent = tokio::time::timeout(Duration::from_secs(5), harness.bind.next_sent())
        .await
        .expect("initiation should fire")
        .unwrap();
    assert_eq!(sent.data.len(), MESSAGE_INITIATION_SIZE);
    assert_eq!(&sent.data[0..4], &[1, 0, 0, 0]);
    assert_eq!(harness.handshake.initiation_count(), 1);
    assert!(harness.peer.awaiting_key());

    // more traffic within the rate-limit window adds no initiations
    harness.inject_v4(80).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.handshake.initiation_count(), 1);

    // the key arrives: everything queued behind the stall drains in order
    harness.install_keypair();
    let first = harness.next_transport().await;
    assert_eq!(transport_counter(&first), 0);
    let second = harness.next_transport().await;
    assert_eq!(transport_counter(&second), 1);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_drops_queued_packets() {
    let harness = Harness::new();

    for _ in 0..3 {
        harness.inject_v4(60).await;
    }

    // wait until the sequencer is actually stalled on the first packet
    tokio::time::timeout(Duration::from_secs(5), async {
        while !harness.peer.awaiting_key() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sequencer should stall without a key");

    harness.peer.flush_nonce_queue();

    // give the flush time to land, then prove nothing was transmitted
    tokio::time::sleep(Duration::from_millis(100)).await;
    let transports = harness
        .bind
        .drain_sent()
        .await
        .into_iter()
        .filter(|d| d.data[0] == 4)
        .count();
    assert_eq!(transports, 0, "flushed packets must not hit the wire");

    // the flushed buffers all returned to the pool
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.device.pool().stats().in_flight() > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("flushed buffers should return");

    // the peer keeps working: new traffic proceeds once a key exists
    harness.install_keypair();
    harness.inject_v4(60).await;
    let datagram = harness.next_transport().await;
    assert_eq!(transport_counter(&datagram), 0);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_key_smoke() {
    let harness = Harness::new();

    harness.inject_v4(44).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.install_keypair();
    let datagram = harness.next_transport().await;
    assert_eq!(transport_counter(&datagram), 0);
    // 44 pads to 48: 16 + 48 + 16
    assert_eq!(datagram.len(), 80);

    harness.device.close().await;
}
