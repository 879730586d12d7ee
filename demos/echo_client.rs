//! Minimal echo client exercising a multipath stream: connects over two
//! local tunnels to two remote endpoints and round-trips a handful of
//! packets. Usage:
//! `echo-client 127.0.0.1:7001 127.0.0.1:7002 -- 127.0.0.1:8001 127.0.0.1:8002`.

use std::net::SocketAddr;
use std::sync::Arc;

use kcp_mux::{AddrBucketSelector, KcpOptions, TransportOptions, Transport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    kcp_mux::logging::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let split = args.iter().position(|a| a == "--").unwrap_or(args.len());
    let laddrs: Vec<SocketAddr> = if split == 0 {
        vec!["127.0.0.1:7001".parse()?, "127.0.0.1:7002".parse()?]
    } else {
        args[..split].iter().map(|s| s.parse().expect("invalid local address")).collect()
    };
    let raddrs: Vec<SocketAddr> = if split >= args.len().saturating_sub(1) {
        vec!["127.0.0.1:8001".parse()?, "127.0.0.1:8002".parse()?]
    } else {
        args[split + 1..].iter().map(|s| s.parse().expect("invalid remote address")).collect()
    };

    let selector = Arc::new(AddrBucketSelector::new());
    let transport = Transport::new(selector, KcpOptions::fast(), TransportOptions::default());
    for addr in &laddrs {
        transport.new_tunnel(*addr).await?;
    }

    let stream = transport.open(raddrs.clone())?;
    stream.set_parallel_xmit(raddrs.len().max(1));
    tracing::info!(?laddrs, ?raddrs, stream = %stream.id(), "opened stream");

    for i in 0..10u32 {
        let payload = format!("ping-{i}");
        stream.write(payload.as_bytes()).await?;
        let echoed = stream.read().await?;
        println!("{}", String::from_utf8_lossy(&echoed));
    }

    stream.close().await?;
    transport.close().await?;
    Ok(())
}
