//! Boundary behaviors: degenerate TUN reads, unroutable packets, padding
//! edges, and the IPv6 path.

use std::time::Duration;

use rust_tunnel::wire::MAX_CONTENT_SIZE;

use super::{ipv4_packet, ipv6_packet, transport_counter, Harness};

/// Inject, wait briefly, and count transport datagrams
async fn transports_after(harness: &Harness, wait: Duration) -> usize {
    tokio::time::sleep(wait).await;
    harness
        .bind
        .drain_sent()
        .await
        .into_iter()
        .filter(|d| d.data[0] == 4)
        .count()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zero_byte_read_is_discarded() {
    let harness = Harness::new();
    harness.install_keypair();

    harness.tun.inject(Vec::new()).await.unwrap();
    assert_eq!(transports_after(&harness, Duration::from_millis(100)).await, 0);

    // the reader kept going
    harness.inject_v4(40).await;
    let datagram = harness.next_transport().await;
    assert_eq!(transport_counter(&datagram), 0);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_ip_version_is_discarded() {
    let harness = Harness::new();
    harness.install_keypair();

    let mut bogus = ipv4_packet([10, 0, 0, 7], 40);
    bogus[0] = 0x70; // version nibble 7
    harness.tun.inject(bogus).await.unwrap();
    assert_eq!(transports_after(&harness, Duration::from_millis(100)).await, 0);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unrouted_destination_is_discarded() {
    let harness = Harness::new();
    harness.install_keypair();

    harness
        .tun
        .inject(ipv4_packet([192, 168, 77, 1], 40))
        .await
        .unwrap();
    assert_eq!(transports_after(&harness, Duration::from_millis(100)).await, 0);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversize_packet_is_discarded() {
    let harness = Harness::new();
    harness.install_keypair();

    harness
        .tun
        .inject(vec![0x45; MAX_CONTENT_SIZE + 1])
        .await
        .unwrap();
    assert_eq!(transports_after(&harness, Duration::from_millis(100)).await, 0);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_truncated_ipv4_header_is_discarded() {
    let harness = Harness::new();
    harness.install_keypair();

    // version nibble says 4 but only 8 bytes arrive
    harness.tun.inject(vec![0x45, 0, 0, 8, 0, 0, 0, 0]).await.unwrap();
    assert_eq!(transports_after(&harness, Duration::from_millis(100)).await, 0);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ipv6_packets_route_and_seal() {
    let harness = Harness::new();
    harness.install_keypair();

    let mut dst = [0u8; 16];
    dst[0] = 0xfd;
    dst[15] = 0x42;
    harness.tun.inject(ipv6_packet(dst, 60)).await.unwrap();

    let datagram = harness.next_transport().await;
    // 60 pads to 64: 16 + 64 + 16
    assert_eq!(datagram.len(), 96);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_padding_invariant_across_lengths() {
    let harness = Harness::new();
    harness.install_keypair();

    let mtu = harness.device.mtu();
    for len in [20usize, 21, 31, 32, 100, 333, 1419] {
        harness.inject_v4(len).await;
        let datagram = harness.next_transport().await;
        let sealed = datagram.len() - 32;

        assert!(sealed >= len, "padding never shrinks ({len})");
        assert!(
            sealed % 16 == 0 || sealed == mtu,
            "sealed length {sealed} for {len} is neither 16-aligned nor the MTU"
        );
        assert!(sealed <= mtu, "padding never exceeds the MTU ({len})");
    }

    harness.device.close().await;
}
