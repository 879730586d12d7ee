//! End-to-end scenarios from §8: duplicate-delivery idempotency under
//! parallel transmit, and a lossy bidirectional transfer.

use std::sync::Arc;
use std::time::Duration;

use kcp_mux::{AddrBucketSelector, KcpOptions, Transport, TransportOptions};
use md5::{Digest, Md5};

fn loopback() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// §8 property 2: with `parallel_xmit = 3` and no loss, every segment
/// arrives on up to three independent paths; the engine must dedup and
/// deliver exactly once, while the transport's `repeat_segs` counter shows
/// the duplicates were seen and discarded.
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_delivery_under_parallel_transmit_is_idempotent() {
    let server = Transport::new(
        Arc::new(AddrBucketSelector::new()),
        KcpOptions::fast3(),
        TransportOptions::default(),
    );
    let mut server_addrs = Vec::new();
    for _ in 0..3 {
        server_addrs.push(server.new_tunnel(loopback()).await.unwrap().local_addr());
    }

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
            stream.read().await.unwrap()
        }
    });

    let client_stream = client.open(server_addrs).unwrap();
    client_stream.set_parallel_xmit(3);
    client_stream.write(b"duplicate me please").await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("timed out waiting for delivery")
        .unwrap();
    assert_eq!(&received[..], b"duplicate me please");

    // Give the extra copies time to land and be discarded.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.snmp().repeat_segs() > 0, "expected duplicate segments to be observed");

    client.close().await.unwrap();
    server.close().await.unwrap();
}

/// §8 scenario A (scaled down): a bidirectional transfer over a lossy
/// tunnel still completes with byte-exact content.
#[tokio::test(flavor = "multi_thread")]
async fn bidirectional_transfer_survives_packet_loss() {
    let server = Transport::new(
        Arc::new(AddrBucketSelector::new()),
        KcpOptions::fast3(),
        TransportOptions::default(),
    );
    let server_tunnel = server.new_tunnel(loopback()).await.unwrap();
    server_tunnel.simulate(20, 0, 0);

    let client = Transport::new(
        Arc::new(AddrBucketSelector::new()),
        KcpOptions::fast3(),
        TransportOptions::default(),
    );
    let client_tunnel = client.new_tunnel(loopback()).await.unwrap();
    client_tunnel.simulate(20, 0, 0);

    let payload: Vec<u8> = (0..65_536u32).map(|i| (i % 256) as u8).collect();

    let server_task = tokio::spawn({
        let server = server.clone();
        let want = payload.clone();
        async move {
            let stream = server.accept().await.unwrap();
            let mut received = Vec::new();
            while received.len() < want.len() {
                received.extend_from_slice(&stream.read().await.unwrap());
            }
            let echoed = received.clone();
            stream.write(&echoed).await.unwrap();
            received
        }
    });

    let client_stream = client.open(vec![server_tunnel.local_addr()]).unwrap();
    client_stream.write(&payload).await.unwrap();

    let want_digest = Md5::digest(&payload);

    let server_received = tokio::time::timeout(Duration::from_secs(30), server_task)
        .await
        .expect("timed out waiting for server-side reassembly")
        .unwrap();
    assert_eq!(Md5::digest(&server_received), want_digest);

    let mut echoed = Vec::new();
    while echoed.len() < payload.len() {
        let chunk = tokio::time::timeout(Duration::from_secs(30), client_stream.read())
            .await
            .expect("timed out waiting for echo")
            .unwrap();
        echoed.extend_from_slice(&chunk);
    }
    assert_eq!(Md5::digest(&echoed), want_digest);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

/// §8 scenario B (scaled down): many concurrent streams each round-trip a
/// batch of small packets without cross-contaminating each other's data.
#[tokio::test(flavor = "multi_thread")]
async fn many_concurrent_streams_echo_independently() {
    const STREAMS: usize = 20;
    const PACKETS: usize = 20;

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

    let server_loop = tokio::spawn({
        let server = server.clone();
        async move {
            for _ in 0..STREAMS {
                let stream = server.accept().await.unwrap();
                tokio::spawn(async move {
                    loop {
                        match stream.read().await {
                            Ok(data) => {
                                if stream.write(&data).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                });
            }
        }
    });

    let mut clients = Vec::new();
    for n in 0..STREAMS {
        let client = client.clone();
        let remote = server_tunnel.local_addr();
        clients.push(tokio::spawn(async move {
            let stream = client.open(vec![remote]).unwrap();
            for i in 0..PACKETS {
                let msg = format!("stream-{n}-packet-{i}");
                stream.write(msg.as_bytes()).await.unwrap();
                let echoed = stream.read().await.unwrap();
                assert_eq!(&echoed[..], msg.as_bytes());
            }
        }));
    }

    for handle in clients {
        tokio::time::timeout(Duration::from_secs(15), handle)
            .await
            .expect("stream timed out")
            .unwrap();
    }

    server_loop.abort();
    client.close().await.unwrap();
    server.close().await.unwrap();
}
