//! End-to-end pipeline scenarios: basic sends, ordering under parallel
//! encryption, the message-count hard cap, and buffer conservation.

use std::sync::atomic::Ordering;
use std::time::Duration;

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};
use rand::RngCore;
use rust_tunnel::RekeyConfig;

use super::{
    ipv4_packet, test_config, transport_counter, transport_receiver, Harness, REMOTE_INDEX,
    SEND_KEY,
};

#[tokio::test(flavor = "multi_thread")]
async fn test_single_peer_basic_send() {
    let harness = Harness::new();
    let keypair = harness.install_keypair();

    harness.inject_v4(100).await;

    let datagram = harness.next_transport().await;
    // 16 header + 112 padded plaintext + 16 tag
    assert_eq!(datagram.len(), 144);
    assert_eq!(transport_receiver(&datagram), REMOTE_INDEX);
    assert_eq!(transport_counter(&datagram), 0);
    assert_eq!(keypair.send_nonce.load(Ordering::Relaxed), 1);

    let stats = harness.peer.stats.snapshot();
    assert_eq!(stats.tx_packets, 1);
    assert_eq!(stats.tx_bytes, 144);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sealed_packet_opens_to_padded_plaintext() {
    let harness = Harness::new();
    harness.install_keypair();

    let packet = ipv4_packet([10, 0, 0, 7], 50);
    harness.tun.inject(packet.clone()).await.unwrap();

    let datagram = harness.next_transport().await;
    let padded_len = datagram.len() - 32;

    let mut ciphertext = datagram[16..16 + padded_len].to_vec();
    let tag = Tag::clone_from_slice(&datagram[16 + padded_len..]);
    let nonce_bytes = {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&datagram[8..16]);
        nonce
    };
    ChaCha20Poly1305::new(Key::from_slice(&SEND_KEY))
        .decrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), &[], &mut ciphertext, &tag)
        .expect("datagram must open under the session key");

    assert_eq!(&ciphertext[..50], &packet[..]);
    assert!(ciphertext[50..].iter().all(|&b| b == 0), "padding is zeros");

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_parallel_workers_in_order_egress() {
    // four workers race over these; the latch must restore submission order
    let harness = Harness::new();
    harness.install_keypair();

    let mut rng = rand::thread_rng();
    let total = 48;
    for _ in 0..total {
        // vary the payload size so workers finish out of order
        let len = 20 + (rng.next_u32() as usize % 1000);
        harness.tun.inject(ipv4_packet([10, 0, 0, 7], len)).await.unwrap();
    }

    for expected in 0..total {
        let datagram = harness.next_transport().await;
        assert_eq!(
            transport_counter(&datagram),
            expected,
            "counters must arrive strictly in submission order"
        );
    }

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reject_after_messages_cap() {
    let harness = Harness::new();
    let keypair = harness.install_keypair();
    let reject = RekeyConfig::default().reject_after_messages;
    keypair.send_nonce.store(reject - 1, Ordering::Relaxed);

    harness.inject_v4(40).await;
    harness.inject_v4(40).await;

    // the first packet takes the last usable counter
    let datagram = harness.next_transport().await;
    assert_eq!(transport_counter(&datagram), reject - 1);

    // the second finds the keypair exhausted: handshake fires, nothing sent
    tokio::time::sleep(Duration::from_millis(100)).await;
    let extra: Vec<_> = harness
        .bind
        .drain_sent()
        .await
        .into_iter()
        .filter(|d| d.data[0] == 4)
        .collect();
    assert!(extra.is_empty(), "no transport datagram past the cap");
    assert!(harness.handshake.initiation_count() >= 1);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_keepalive_is_32_byte_datagram() {
    let harness = Harness::new();
    harness.install_keypair();

    assert!(harness.peer.send_keepalive());

    let datagram = harness.next_transport().await;
    assert_eq!(datagram.len(), 32);
    assert_eq!(transport_counter(&datagram), 0);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stalled_peer_does_not_starve_others() {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let harness = Harness::new();
    harness.install_keypair();

    // a second peer with no keypair: its pipeline stalls on the handshake
    let stalled_handshake = super::StubHandshake::new();
    let _stalled = harness
        .device
        .add_peer(
            &rust_tunnel::PeerConfig {
                public_key: BASE64.encode([0x02; 32]),
                endpoint: Some("192.0.2.20:51820".into()),
                allowed_ips: vec!["10.0.1.0/24".into()],
                persistent_keepalive_secs: None,
            },
            stalled_handshake,
        )
        .unwrap();

    // saturate the stalled peer, interleaved with live traffic
    for _ in 0..10 {
        harness
            .tun
            .inject(ipv4_packet([10, 0, 1, 9], 64))
            .await
            .unwrap();
        harness
            .tun
            .inject(ipv4_packet([10, 0, 0, 7], 64))
            .await
            .unwrap();
    }

    // every live-peer packet still flows
    for expected in 0..10 {
        let datagram = harness.next_transport().await;
        assert_eq!(transport_counter(&datagram), expected);
    }

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transient_send_failure_keeps_pipeline_alive() {
    let harness = Harness::new();
    harness.install_keypair();

    harness.bind.set_fail_sends(true);
    harness.inject_v4(60).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.bind.set_fail_sends(false);

    harness.inject_v4(60).await;
    let datagram = harness.next_transport().await;
    // the failed packet consumed counter 0 and was dropped on the floor
    assert_eq!(transport_counter(&datagram), 1);

    harness.device.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_every_buffer_returns_to_the_pool() {
    let harness = Harness::new();
    harness.install_keypair();

    for _ in 0..20 {
        harness.inject_v4(200).await;
    }
    for _ in 0..20 {
        harness.next_transport().await;
    }

    harness.device.close().await;

    let stats = harness.device.pool().stats();
    assert_eq!(
        stats.in_flight(),
        0,
        "gets {} returns {} discards {}",
        stats.gets(),
        stats.returns(),
        stats.discards()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queue_pressure_drops_oldest_not_newest() {
    // a config with tiny queues and a single worker to force eviction
    let config = rust_tunnel::DeviceConfig {
        queue: rust_tunnel::QueueConfig {
            encryption_depth: 4,
            nonce_depth: 4,
            outbound_depth: 4,
        },
        encryption_workers: 1,
        ..test_config()
    };
    let harness = Harness::with_config(config);
    harness.install_keypair();

    for _ in 0..64 {
        harness.inject_v4(32).await;
    }

    // whatever survives arrives in strictly increasing counter order
    tokio::time::sleep(Duration::from_millis(300)).await;
    let counters: Vec<u64> = harness
        .bind
        .drain_sent()
        .await
        .into_iter()
        .filter(|d| d.data[0] == 4)
        .map(|d| transport_counter(&d.data))
        .collect();
    assert!(!counters.is_empty());
    assert!(
        counters.windows(2).all(|w| w[0] < w[1]),
        "egress counters must be strictly increasing: {counters:?}"
    );

    harness.device.close().await;
}
