//! §8 property 7: multipath route selection splits roughly evenly across
//! same-bucket tunnels, and losing one does not starve a stream transmitting
//! with `parallel_xmit >= 2`.

use std::sync::Arc;

use kcp_mux::{AddrBucketSelector, RouteSelector};
use kcp_mux::broker::MsgBroker;
use kcp_mux::buffer_pool::BufferPool;
use kcp_mux::scheduler::TimedScheduler;
use kcp_mux::snmp::Snmp;
use kcp_mux::time::SystemTimeProvider;
use kcp_mux::tunnel::Tunnel;

async fn bind_tunnel(broker: Arc<MsgBroker>, scheduler: Arc<TimedScheduler>) -> Arc<Tunnel> {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    Arc::new(
        Tunnel::bind(
            "127.0.0.1:0".parse().unwrap(),
            tx,
            broker,
            scheduler,
            Arc::new(Snmp::new()),
        )
        .await
        .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn pick_round_robins_evenly_within_a_bucket() {
    let pool = Arc::new(BufferPool::new(4096));
    let broker = MsgBroker::new(4, 2, pool);
    let scheduler = Arc::new(TimedScheduler::new(Arc::new(SystemTimeProvider)));

    let selector = AddrBucketSelector::new();
    let a = bind_tunnel(broker.clone(), scheduler.clone()).await;
    let b = bind_tunnel(broker.clone(), scheduler.clone()).await;
    selector.add_tunnel(a.clone());
    selector.add_tunnel(b.clone());

    let remote = "127.0.0.1:9".parse().unwrap();
    let mut a_hits = 0;
    let mut b_hits = 0;
    for _ in 0..200 {
        let picks = selector.pick(&[remote]);
        assert_eq!(picks.len(), 1);
        if picks[0].local_addr() == a.local_addr() {
            a_hits += 1;
        } else if picks[0].local_addr() == b.local_addr() {
            b_hits += 1;
        } else {
            panic!("pick returned a tunnel outside the bucket");
        }
    }
    assert_eq!(a_hits, 100);
    assert_eq!(b_hits, 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn losing_one_tunnel_still_leaves_a_path_for_parallel_transmit() {
    let pool = Arc::new(BufferPool::new(4096));
    let broker = MsgBroker::new(4, 2, pool);
    let scheduler = Arc::new(TimedScheduler::new(Arc::new(SystemTimeProvider)));

    let selector = AddrBucketSelector::new();
    let a = bind_tunnel(broker.clone(), scheduler.clone()).await;
    let b = bind_tunnel(broker, scheduler).await;
    selector.add_tunnel(a.clone());
    selector.add_tunnel(b.clone());

    a.close();
    assert!(a.is_closed());

    let remote_a = "127.0.0.1:9".parse().unwrap();
    let remote_b = "127.0.0.1:10".parse().unwrap();
    // With two remotes, pick() still yields one tunnel per remote; the
    // output on the closed one fails, but the other path remains usable.
    let picks = selector.pick(&[remote_a, remote_b]);
    assert_eq!(picks.len(), 2);
    let payload = bytes::Bytes::from_static(b"x");
    let results: Vec<_> = picks
        .iter()
        .map(|t| t.output("127.0.0.1:1".parse().unwrap(), payload.clone()))
        .collect();
    assert!(results.iter().any(|r| r.is_ok()));
}
