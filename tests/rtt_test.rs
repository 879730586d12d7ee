//! §8 property 5: RTO growth under a loss storm, and the "xmit == 1 only"
//! RTT-sampling rule that keeps retransmitted segments from corrupting the
//! estimator.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use kcp_mux::buffer_pool::BufferPool;
use kcp_mux::config::KcpOptions;
use kcp_mux::kcp::KcpEngine;
use kcp_mux::segment::{Cmd, Segment};
use kcp_mux::snmp::Snmp;
use kcp_mux::time::SystemTimeProvider;

fn ack_segment(conv: u32, sn: u32, ts: u32, una: u32) -> Bytes {
    let mut seg = Segment::new(conv, Cmd::Ack, Bytes::new());
    seg.sn = sn;
    seg.ts = ts;
    seg.una = una;
    seg.wnd = 32;
    let mut buf = BytesMut::new();
    seg.encode(&mut buf);
    buf.freeze()
}

fn engine() -> KcpEngine {
    let mut opts = KcpOptions::normal();
    opts.nocwnd = true;
    opts.snd_wnd = 64;
    opts.rcv_wnd = 64;
    KcpEngine::new(
        99,
        opts,
        Arc::new(SystemTimeProvider),
        Arc::new(Snmp::new()),
        Arc::new(BufferPool::new(4096)),
    )
}

#[test]
fn rto_does_not_shrink_across_a_loss_storm() {
    let mut eng = engine();
    for _ in 0..25 {
        eng.send(b"x").unwrap();
    }
    eng.flush(0);
    assert_eq!(eng.snd_nxt(), 25);

    // Establish a baseline from clean, first-transmission acks (sn 0..10).
    for sn in 0..10u32 {
        eng.input(ack_segment(99, sn, 0, sn + 1), 50).unwrap();
    }
    let pre_storm_rto = eng.rx_rto();
    assert!(pre_storm_rto > 0);

    // sn 10..24 go unacked long enough to force a timeout retransmit.
    eng.flush(pre_storm_rto + 60_000);

    assert!(eng.rx_rto() >= pre_storm_rto);
}

#[test]
fn retransmitted_segments_do_not_contribute_rtt_samples() {
    let mut eng = engine();
    for _ in 0..5 {
        eng.send(b"x").unwrap();
    }
    eng.flush(0);

    // Force sn 0 to a second transmission (xmit == 2) via a timeout.
    eng.flush(60_000);

    let rto_before = eng.rx_rto();
    // Ack it now with a timestamp chosen to look like an implausibly small
    // RTT; since xmit > 1 at ack time, this sample must be rejected.
    eng.input(ack_segment(99, 0, 60_000, 1), 60_001).unwrap();
    assert_eq!(eng.rx_rto(), rto_before);
}
