//! §4.5 — the KCP engine: a pure state machine, no I/O. Field names follow
//! the independent Rust KCP port in the reference pack
//! (`other_examples/036dadae_..._kcp.rs.rs`), whose `conv`/`snd_una`/
//! `snd_nxt`/`rcv_nxt`/`cwnd`/`ssthresh` naming matches this spec's §3
//! directly; the flush/input/recv algorithm itself is authored against
//! §4.5.1-§4.5.5 since that port's data model still differs in places.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::buffer_pool::BufferPool;
use crate::config::{KcpOptions, IKCP_DEADLINK, IKCP_OVERHEAD, IKCP_PROBE_INIT, IKCP_PROBE_LIMIT, IKCP_RTO_MAX, IKCP_THRESH_INIT};
use crate::error::{Error, Result};
use crate::segment::{Cmd, Segment};
use crate::snmp::Snmp;
use crate::time::TimeProvider;

const ASK_SEND: u8 = 1;
const ASK_TELL: u8 = 2;

pub struct KcpEngine {
    pub conv: u32,
    opts: KcpOptions,
    #[allow(dead_code)]
    time: Arc<dyn TimeProvider>,
    snmp: Arc<Snmp>,
    pool: Arc<BufferPool>,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    snd_wnd: u16,
    rcv_wnd: u16,
    rmt_wnd: u16,

    cwnd: u32,
    incr: u32,
    ssthresh: u32,

    rx_srtt: u32,
    rx_rttval: u32,
    rx_rto: u32,
    rx_minrto: u32,

    interval: u32,
    nodelay: bool,
    fast_resend: u32,
    fast_limit: u32,
    nocwnd: bool,
    stream_mode: bool,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    acklist: VecDeque<(u32, u32)>,

    ts_probe: u32,
    probe_wait: u32,
    probe: u8,

    dead: bool,

    /// Segments sent / retransmitted on the most recent `flush` call, used
    /// by the stream's parallel-transmit heuristic (§4.6).
    last_flush_out: u32,
    last_flush_retrans: u32,
}

impl KcpEngine {
    pub fn new(
        conv: u32,
        opts: KcpOptions,
        time: Arc<dyn TimeProvider>,
        snmp: Arc<Snmp>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            conv,
            rx_minrto: crate::config::IKCP_RTO_MIN,
            interval: opts.interval,
            nodelay: opts.nodelay,
            fast_resend: opts.fast_resend,
            fast_limit: crate::config::IKCP_FASTACK_LIMIT,
            nocwnd: opts.nocwnd,
            snd_wnd: opts.snd_wnd,
            rcv_wnd: opts.rcv_wnd,
            opts,
            time,
            snmp,
            pool,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            rmt_wnd: crate::config::IKCP_WND_RCV,
            // Classic KCP slow-start initial window: starting at 0 would make
            // the first flush's cwnd_eff collapse to 0 and promote nothing.
            cwnd: 1,
            incr: 0,
            ssthresh: IKCP_THRESH_INIT,
            rx_srtt: 0,
            rx_rttval: 0,
            rx_rto: crate::config::IKCP_RTO_DEF,
            stream_mode: true,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            acklist: VecDeque::new(),
            ts_probe: 0,
            probe_wait: 0,
            probe: 0,
            dead: false,
            last_flush_out: 0,
            last_flush_retrans: 0,
        }
    }

    /// `(segments_out, segments_retransmitted)` from the most recent flush.
    pub fn last_flush_counts(&self) -> (u32, u32) {
        (self.last_flush_out, self.last_flush_retrans)
    }

    pub fn set_stream_mode(&mut self, on: bool) {
        self.stream_mode = on;
    }

    pub fn set_window(&mut self, snd_wnd: u16, rcv_wnd: u16) {
        self.snd_wnd = snd_wnd;
        self.rcv_wnd = rcv_wnd;
    }

    pub fn set_nodelay(&mut self, nodelay: bool, interval: u32, fast_resend: u32, nocwnd: bool) {
        self.nodelay = nodelay;
        self.interval = interval;
        self.fast_resend = fast_resend;
        self.nocwnd = nocwnd;
    }

    pub fn is_dead_link(&self) -> bool {
        self.dead
    }

    pub fn mss(&self) -> usize {
        self.opts.mss()
    }

    pub fn snd_wnd(&self) -> u16 {
        self.snd_wnd
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn rx_rto(&self) -> u32 {
        self.rx_rto
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    /// Bytes in flight plus still-queued, used by the stream's blocking
    /// `write` to decide whether the caller should suspend (§4.6).
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    fn wnd_unused(&self) -> u16 {
        let len = self.rcv_queue.len() as u16;
        if len < self.rcv_wnd {
            self.rcv_wnd - len
        } else {
            0
        }
    }

    /// §4.5.1 — fragments `payload` into `snd_queue` entries of at most
    /// `mss` bytes, extending an under-full trailing segment first in
    /// stream mode. Never blocks.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::Programmer("send requires a non-empty payload"));
        }
        let mss = self.mss();
        let mut remaining = payload;

        if self.stream_mode {
            if let Some(last) = self.snd_queue.back_mut() {
                if last.data.len() < mss {
                    let room = mss - last.data.len();
                    let take = room.min(remaining.len());
                    if take > 0 {
                        let mut data = BytesMut::with_capacity(last.data.len() + take);
                        data.extend_from_slice(&last.data);
                        data.extend_from_slice(&remaining[..take]);
                        last.data = data.freeze();
                        remaining = &remaining[take..];
                    }
                }
            }
        }

        if remaining.is_empty() {
            return Ok(());
        }

        let count = (remaining.len() + mss - 1) / mss;
        if count > 256 {
            // frg counts fragments down from `count - 1`; anything past 256
            // segments doesn't fit in its u8 and would silently wrap.
            return Err(Error::OversizePayload(payload.len()));
        }
        for i in 0..count {
            let start = i * mss;
            let end = (start + mss).min(remaining.len());
            let mut seg = Segment::new(self.conv, Cmd::Push, Bytes::copy_from_slice(&remaining[start..end]));
            seg.frg = (count - 1 - i) as u8;
            self.snd_queue.push_back(seg);
        }
        Ok(())
    }

    /// §4.5.4 — pops the next complete message (a run of segments ending in
    /// `frg == 0`) from `rcv_queue`, or fails transiently if none is ready.
    pub fn recv(&mut self) -> Result<Bytes> {
        if self.rcv_queue.is_empty() || !self.rcv_queue.iter().any(|s| s.frg == 0) {
            return Err(Error::WouldBlock);
        }
        let len_before = self.rcv_queue.len() as u16;
        let mut data = BytesMut::new();
        loop {
            let seg = self.rcv_queue.pop_front().expect("checked non-empty above");
            let last = seg.frg == 0;
            data.extend_from_slice(&seg.data);
            if last {
                break;
            }
        }
        let len_after = self.rcv_queue.len() as u16;
        if len_before >= self.rcv_wnd && len_after < self.rcv_wnd {
            self.probe |= ASK_TELL;
        }
        Ok(data.freeze())
    }

    /// §9.1 "Close-write marker": a zero-payload `PUSH` segment the peer
    /// treats as "no further `frg`-chain will start here." `send()` itself
    /// rejects empty payloads since it exists for application data.
    pub fn send_close_marker(&mut self) {
        let mut seg = Segment::new(self.conv, Cmd::Push, Bytes::new());
        seg.frg = 0;
        self.snd_queue.push_back(seg);
    }

    pub fn peek_size(&self) -> Option<usize> {
        let mut size = 0usize;
        for seg in self.rcv_queue.iter() {
            size += seg.data.len();
            if seg.frg == 0 {
                return Some(size);
            }
        }
        None
    }

    /// §4.5.3 — feed one inbound datagram (already stripped of its UUID
    /// prefix) into the engine.
    pub fn input(&mut self, mut datagram: Bytes, now_ms: u32) -> Result<()> {
        while !datagram.is_empty() {
            let seg = match Segment::decode(&mut datagram) {
                Ok(seg) => seg,
                Err(_) => {
                    self.snmp.incr_in_errs();
                    return Err(Error::MalformedSegment("segment stream truncated"));
                }
            };
            if seg.conv != self.conv {
                self.snmp.incr_in_errs();
                return Err(Error::ConvMismatch { expected: self.conv, got: seg.conv });
            }
            self.snmp.incr_in_segs();
            self.rmt_wnd = seg.wnd;
            self.parse_una(seg.una);
            self.update_snd_una();

            match seg.cmd {
                Cmd::Ack => self.handle_ack(&seg, now_ms),
                Cmd::Push => self.handle_push(seg),
                Cmd::Wask => self.probe |= ASK_TELL,
                Cmd::Wins => {}
            }
        }
        Ok(())
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(front) = self.snd_buf.front() {
            if front.sn < una {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn update_snd_una(&mut self) {
        self.snd_una = self.snd_buf.front().map(|s| s.sn).unwrap_or(self.snd_nxt);
    }

    fn handle_ack(&mut self, seg: &Segment, now_ms: u32) {
        if seg.sn < self.snd_una || seg.sn >= self.snd_nxt {
            return;
        }
        if let Some(pos) = self.snd_buf.iter().position(|s| s.sn == seg.sn) {
            let removed = self.snd_buf.remove(pos).expect("position just found");
            if removed.xmit == 1 {
                let rtt = now_ms.wrapping_sub(removed.ts);
                self.update_rtt(rtt);
            }
            self.update_snd_una();
            self.on_ack_cwnd_increase();
        }
        for s in self.snd_buf.iter_mut() {
            if s.sn < seg.sn {
                s.fastack += 1;
            }
        }
    }

    fn handle_push(&mut self, seg: Segment) {
        if seg.sn >= self.rcv_nxt.wrapping_add(self.rcv_wnd as u32) {
            return;
        }
        self.acklist.push_back((seg.sn, seg.ts));

        if seg.sn < self.rcv_nxt {
            self.snmp.incr_repeat_segs();
            return;
        }
        if self.rcv_buf.iter().any(|s| s.sn == seg.sn) {
            self.snmp.incr_repeat_segs();
            return;
        }
        let pos = self.rcv_buf.iter().position(|s| s.sn > seg.sn).unwrap_or(self.rcv_buf.len());
        self.rcv_buf.insert(pos, seg);

        while let Some(front) = self.rcv_buf.front() {
            if front.sn == self.rcv_nxt {
                let seg = self.rcv_buf.pop_front().expect("front just matched");
                self.rcv_queue.push_back(seg);
                self.rcv_nxt += 1;
            } else {
                break;
            }
        }
    }

    fn update_rtt(&mut self, rtt: u32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = (self.rx_srtt as i64 - rtt as i64).unsigned_abs() as u32;
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = (7 * self.rx_srtt + rtt) / 8;
            if self.rx_srtt < 1 {
                self.rx_srtt = 1;
            }
        }
        let rto = self.rx_srtt + 4 * self.rx_rttval;
        self.rx_rto = rto.clamp(self.rx_minrto, IKCP_RTO_MAX);
    }

    fn on_ack_cwnd_increase(&mut self) {
        let mss = self.mss() as u32;
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr += mss;
        } else {
            let incr = self.incr.max(mss);
            self.incr = incr + (mss * mss / incr + mss / 16).max(1);
            if (self.cwnd + 1) * mss <= self.incr {
                self.cwnd = self.incr / mss.max(1);
            }
        }
        self.cwnd = self.cwnd.clamp(1, self.rmt_wnd.max(1) as u32);
    }

    /// §4.5.2 — the heartbeat. Returns the encoded outbound datagrams
    /// (MTU-sized at most), not yet prefixed with the stream's UUID.
    pub fn flush(&mut self, now_ms: u32) -> Vec<Bytes> {
        let mtu = self.opts.mtu;
        // Pulled from the pool rather than freshly allocated: the packing
        // buffer is the hot-path allocation §4.1 exists to avoid.
        let mut buf = self.pool.get();
        buf.clear();
        // Flushes almost always emit a handful of MTU-sized datagrams; a
        // small inline buffer avoids a heap allocation on the common case.
        let mut out: SmallVec<[Bytes; 4]> = SmallVec::new();
        let mut lost = false;
        let mut change = false;
        let mut flushed_out = 0u32;
        let mut flushed_retrans = 0u32;

        let wnd = self.wnd_unused();

        // 1. Drain acklist.
        while let Some((sn, ts)) = self.acklist.pop_front() {
            let mut seg = Segment::new(self.conv, Cmd::Ack, Bytes::new());
            seg.sn = sn;
            seg.ts = ts;
            seg.wnd = wnd;
            seg.una = self.rcv_nxt;
            if buf.len() + seg.encoded_len() > mtu {
                out.push(buf.split().freeze());
            }
            seg.encode(&mut buf);
            self.snmp.incr_out_segs();
        }

        // 2. Zero-window probe.
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = IKCP_PROBE_INIT;
                self.ts_probe = now_ms + self.probe_wait;
            } else if now_ms >= self.ts_probe {
                self.probe_wait += self.probe_wait / 2;
                self.probe_wait = self.probe_wait.min(IKCP_PROBE_LIMIT);
                self.ts_probe = now_ms + self.probe_wait;
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        if self.probe & ASK_SEND != 0 {
            let mut seg = Segment::new(self.conv, Cmd::Wask, Bytes::new());
            seg.wnd = wnd;
            seg.una = self.rcv_nxt;
            if buf.len() + seg.encoded_len() > mtu {
                out.push(buf.split().freeze());
            }
            seg.encode(&mut buf);
        }
        if self.probe & ASK_TELL != 0 {
            let mut seg = Segment::new(self.conv, Cmd::Wins, Bytes::new());
            seg.wnd = wnd;
            seg.una = self.rcv_nxt;
            if buf.len() + seg.encoded_len() > mtu {
                out.push(buf.split().freeze());
            }
            seg.encode(&mut buf);
        }
        self.probe = 0;

        // 3. Effective congestion window.
        let mut cwnd_eff = self.snd_wnd.min(self.rmt_wnd) as u32;
        if !self.nocwnd {
            cwnd_eff = cwnd_eff.min(self.cwnd);
        }

        // 4. Promote snd_queue -> snd_buf.
        while self.snd_nxt < self.snd_una + cwnd_eff {
            match self.snd_queue.pop_front() {
                Some(mut seg) => {
                    seg.sn = self.snd_nxt;
                    self.snd_nxt += 1;
                    seg.una = self.rcv_nxt;
                    seg.rto = self.rx_rto;
                    seg.resendts = now_ms + seg.rto;
                    seg.fastack = 0;
                    seg.xmit = 0;
                    self.snd_buf.push_back(seg);
                }
                None => break,
            }
        }

        // 5. Walk snd_buf deciding retransmission.
        for seg in self.snd_buf.iter_mut() {
            let mut transmit = false;
            if seg.xmit == 0 {
                transmit = true;
                seg.rto = self.rx_rto;
                seg.resendts = now_ms + seg.rto;
            } else if now_ms >= seg.resendts {
                transmit = true;
                if self.nodelay {
                    seg.rto += self.rx_rto / 2;
                } else {
                    seg.rto += seg.rto.max(self.rx_rto);
                }
                seg.resendts = now_ms + seg.rto;
                lost = true;
                self.snmp.incr_lost_segs();
            } else if seg.fastack >= self.fast_resend
                && self.fast_resend > 0
                && (!self.nocwnd || seg.xmit <= self.fast_limit)
            {
                transmit = true;
                seg.fastack = 0;
                seg.resendts = now_ms + seg.rto;
                change = true;
                self.snmp.incr_fast_retrans_segs();
            }

            if transmit {
                seg.ts = now_ms;
                seg.wnd = wnd;
                seg.una = self.rcv_nxt;
                if buf.len() + seg.encoded_len() > mtu {
                    out.push(buf.split().freeze());
                }
                seg.encode(&mut buf);
                let was_retransmit = seg.xmit > 0;
                seg.xmit += 1;
                self.snmp.incr_out_segs();
                flushed_out += 1;
                if was_retransmit {
                    self.snmp.incr_retrans_segs();
                    flushed_retrans += 1;
                }
                if seg.xmit > IKCP_DEADLINK {
                    self.dead = true;
                }
            }
        }

        if !buf.is_empty() {
            out.push(buf.split().freeze());
        }
        self.pool.put(buf);

        if change {
            let inflight = self.snd_buf.len() as u32;
            self.ssthresh = (inflight / 2).max(2);
            self.cwnd = self.ssthresh + self.fast_resend;
            self.incr = self.cwnd * self.mss() as u32;
        }
        if lost {
            self.ssthresh = (cwnd_eff / 2).max(2);
            self.cwnd = 1;
            self.incr = self.mss() as u32;
        }
        self.cwnd = self.cwnd.max(1);

        self.last_flush_out = flushed_out;
        self.last_flush_retrans = flushed_retrans;

        out.into_vec()
    }

    /// Earliest absolute ms at which `flush` should next be called.
    pub fn check(&self, now_ms: u32) -> u32 {
        let mut next = now_ms + self.interval;
        if let Some(front) = self.snd_buf.front() {
            next = next.min(front.resendts.max(now_ms));
        }
        if self.rmt_wnd == 0 && self.ts_probe != 0 {
            next = next.min(self.ts_probe);
        }
        next
    }
}
