//! Minimal echo server over two UDP tunnels, demonstrating multipath
//! accept/read/write. Usage: `echo-server 127.0.0.1:7001 127.0.0.1:7002`.

use std::net::SocketAddr;
use std::sync::Arc;

use kcp_mux::{AddrBucketSelector, KcpOptions, TransportOptions, Transport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    kcp_mux::logging::init_tracing();

    let laddrs: Vec<SocketAddr> = std::env::args()
        .skip(1)
        .map(|s| s.parse().expect("invalid local address"))
        .collect();
    let laddrs = if laddrs.is_empty() {
        vec!["127.0.0.1:8001".parse()?, "127.0.0.1:8002".parse()?]
    } else {
        laddrs
    };

    let selector = Arc::new(AddrBucketSelector::new());
    let transport = Transport::new(selector, KcpOptions::fast(), TransportOptions::default());

    for addr in &laddrs {
        transport.new_tunnel(*addr).await?;
    }
    tracing::info!(?laddrs, "echo server listening");

    loop {
        let stream = transport.accept().await?;
        tracing::info!(stream = %stream.id(), "accepted stream");
        tokio::spawn(async move {
            loop {
                match stream.read().await {
                    Ok(data) => {
                        if stream.write(&data).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::info!(%err, "stream closed");
                        break;
                    }
                }
            }
        });
    }
}
