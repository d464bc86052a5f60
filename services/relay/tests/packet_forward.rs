mod harness;

use std::net::SocketAddr;

use harness::{packet_device, PacketDeviceHandle, TestCerts, TEST_TIMEOUT};
use quinn::ConnectionError;
use sluice_relay::shutdown::{error_channel, ErrorQueue};
use sluice_relay::{QuicListenerConfig, RelayError, TunConnector, TunListener, QUIC_ALPN};
use tokio::time::timeout;

fn spawn_tun_listener(certs: &TestCerts) -> (SocketAddr, PacketDeviceHandle, ErrorQueue) {
    let (device, handle) = packet_device();
    let listener = TunListener::bind(
        QuicListenerConfig::new("127.0.0.1:0".parse().unwrap()),
        &certs.server_config(Some(QUIC_ALPN)),
        device,
    )
    .unwrap();

    let addr = listener.local_addr().unwrap();
    let (reporter, queue) = error_channel();
    tokio::spawn(listener.serve(reporter));
    (addr, handle, queue)
}

#[tokio::test]
async fn packets_cross_one_datagram_each() {
    let certs = TestCerts::generate();
    let (addr, mut server, _queue) = spawn_tun_listener(&certs);

    let (mut client_device, mut client) = packet_device();
    let connector = TunConnector::new(certs.quic_session(addr));
    let forwarding = tokio::spawn(async move { connector.run(&mut client_device).await });

    for len in [100usize, 40, 600] {
        client.inject.send(vec![len as u8; len]).unwrap();
        let packet = timeout(TEST_TIMEOUT, server.captured.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.len(), len);
        assert!(packet.iter().all(|b| *b == len as u8));
    }

    server.inject.send(vec![7u8; 300]).unwrap();
    let packet = timeout(TEST_TIMEOUT, client.captured.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet, vec![7u8; 300]);

    // Closing the client device ends forwarding on both sides.
    drop(client.inject);
    let stats = timeout(TEST_TIMEOUT, forwarding)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.packets_to_peer, 3);
    assert_eq!(stats.packets_from_peer, 1);
    assert_eq!(stats.bytes_to_peer, 740);
}

#[tokio::test]
async fn second_peer_is_rejected_while_device_leased() {
    let certs = TestCerts::generate();
    let (addr, mut server, mut queue) = spawn_tun_listener(&certs);

    let (mut first_device, first) = packet_device();
    let first_connector = TunConnector::new(certs.quic_session(addr));
    tokio::spawn(async move { first_connector.run(&mut first_device).await });

    // Wait until the first peer holds the device.
    first.inject.send(vec![1u8; 64]).unwrap();
    timeout(TEST_TIMEOUT, server.captured.recv())
        .await
        .unwrap()
        .unwrap();

    let second = certs.quic_session(addr);
    let connection = timeout(TEST_TIMEOUT, second.connection())
        .await
        .unwrap()
        .unwrap();
    let reason = timeout(TEST_TIMEOUT, connection.closed()).await.unwrap();
    match reason {
        ConnectionError::ApplicationClosed(close) => assert_eq!(&close.reason[..], b"busy"),
        other => panic!("expected busy close, got {other:?}"),
    }

    let err = timeout(TEST_TIMEOUT, queue.recv()).await.unwrap().unwrap();
    assert!(matches!(err, RelayError::DeviceBusy { .. }));

    drop(first);
}
