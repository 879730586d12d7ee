//! Integration coverage for `Transport`: open/accept over real loopback UDP
//! tunnels, and bidirectional byte-exact delivery (§8 property 1, single
//! path).

use std::sync::Arc;
use std::time::Duration;

use kcp_mux::{AddrBucketSelector, KcpOptions, Transport, TransportOptions};

fn loopback() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn open_accept_and_echo_round_trip() {
    let server = Transport::new(
        Arc::new(AddrBucketSelector::new()),
        KcpOptions::fast3(),
        TransportOptions::default(),
    );
    let server_tunnel = server.new_tunnel(loopback()).await.unwrap();

    let client = Transport::new(
        Arc::new(AddrBucketSelector::new()),
        KcpOptions::fast3(),
        TransportOptions::default(),
    );
    client.new_tunnel(loopback()).await.unwrap();

    let server_task = tokio::spawn({
        let server = server.clone();
        async move {
            let stream = server.accept().await.unwrap();
            let data = stream.read().await.unwrap();
            stream.write(&data).await.unwrap();
        }
    });

    let client_stream = client.open(vec![server_tunnel.local_addr()]).unwrap();
    client_stream.write(b"hello multipath").await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), client_stream.read())
        .await
        .expect("timed out waiting for echo")
        .unwrap();
    assert_eq!(&echoed[..], b"hello multipath");

    server_task.await.unwrap();
    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn large_payload_survives_fragmentation_and_reassembly() {
    let server = Transport::new(
        Arc::new(AddrBucketSelector::new()),
        KcpOptions::fast3(),
        TransportOptions::default(),
    );
    let server_tunnel = server.new_tunnel(loopback()).await.unwrap();

    let client = Transport::new(
        Arc::new(AddrBucketSelector::new()),
        KcpOptions::fast3(),
        TransportOptions::default(),
    );
    client.new_tunnel(loopback()).await.unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

    let server_task = tokio::spawn({
        let server = server.clone();
        let expected_len = payload.len();
        async move {
            let stream = server.accept().await.unwrap();
            let mut received = Vec::new();
            while received.len() < expected_len {
                received.extend_from_slice(&stream.read().await.unwrap());
            }
            received
        }
    });

    let client_stream = client.open(vec![server_tunnel.local_addr()]).unwrap();
    client_stream.write(&payload).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), server_task)
        .await
        .expect("timed out waiting for reassembly")
        .unwrap();
    assert_eq!(received, payload);

    client.close().await.unwrap();
    server.close().await.unwrap();
}
