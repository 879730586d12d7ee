//! §4.6 — the stream: blocking semantics, deadlines, and multipath output
//! layered over one KCP engine.
//!
//! Grounded on `tox-sequenced/src/session.rs`'s flush-on-input /
//! wakeup-scheduling idiom: an inbound datagram posts an `EXCLUSIVE`, 0 ms
//! scheduler entry keyed by the stream's id rather than calling flush
//! inline, so a burst of input collapses into a single pending flush, and
//! the same entry is reused to drive the engine's own RTO/probe timers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::buffer_pool::BufferPool;
use crate::config::{KcpOptions, TransportOptions};
use crate::error::{Error, Result};
use crate::kcp::KcpEngine;
use crate::route::RouteSelector;
use crate::scheduler::{fnv1a32, Mode, TimedScheduler};
use crate::segment::frame_datagram;
use crate::snmp::Snmp;
use crate::time::TimeProvider;
use crate::tunnel::Tunnel;

/// `conv` is the low 32 bits of the stream's UUID (§6.1).
pub fn conv_from_uuid(id: &Uuid) -> u32 {
    let bytes = id.as_bytes();
    u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]])
}

struct Parallelism {
    k: usize,
    floor_expiry_ms: u32,
    ticks: u32,
    out_acc: u64,
    retrans_acc: u64,
}

/// One user-visible reliable byte channel (§4.6).
pub struct Stream {
    id: Uuid,
    engine: Mutex<KcpEngine>,
    scheduler: Arc<TimedScheduler>,
    selector: Arc<dyn RouteSelector>,
    remote_addrs: Vec<SocketAddr>,
    time: Arc<dyn TimeProvider>,
    topts: TransportOptions,
    parallelism: Mutex<Parallelism>,
    deadline: Mutex<Option<StdInstant>>,
    readable: Notify,
    writable: Notify,
    closed: AtomicBool,
    dead: AtomicBool,
    close_write_sent: AtomicBool,
    closed_tx: mpsc::UnboundedSender<Uuid>,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        opts: KcpOptions,
        topts: TransportOptions,
        remote_addrs: Vec<SocketAddr>,
        selector: Arc<dyn RouteSelector>,
        scheduler: Arc<TimedScheduler>,
        time: Arc<dyn TimeProvider>,
        snmp: Arc<Snmp>,
        pool: Arc<BufferPool>,
        closed_tx: mpsc::UnboundedSender<Uuid>,
    ) -> Arc<Self> {
        let conv = conv_from_uuid(&id);
        let engine = KcpEngine::new(conv, opts, time.clone(), snmp, pool);
        Arc::new(Self {
            id,
            engine: Mutex::new(engine),
            scheduler,
            selector,
            remote_addrs,
            time,
            topts,
            parallelism: Mutex::new(Parallelism {
                k: 1,
                floor_expiry_ms: 0,
                ticks: 0,
                out_acc: 0,
                retrans_acc: 0,
            }),
            deadline: Mutex::new(None),
            readable: Notify::new(),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            close_write_sent: AtomicBool::new(false),
            closed_tx,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Feeds one inbound datagram (UUID prefix already stripped) into the
    /// engine and schedules an immediate flush.
    pub fn input(self: &Arc<Self>, datagram: Bytes) {
        let now = self.time.now_ms();
        let ok = {
            let mut eng = self.engine.lock();
            eng.input(datagram, now).is_ok()
        };
        self.readable.notify_waiters();
        if ok {
            self.schedule_flush(0);
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.dead.load(Ordering::Acquire) {
            return Err(Error::DeadLink);
        }
        if self.is_closed() {
            return Err(Error::ClosedPipe);
        }
        Ok(())
    }

    pub async fn write(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut offset = 0;
        while offset < data.len() {
            let (mss, snd_wnd, wait) = {
                let eng = self.engine.lock();
                (eng.mss(), eng.snd_wnd() as usize, eng.wait_snd())
            };
            // A single `engine.send()` call fragments into at most 256
            // segments (`frg` is a `u8`), so cap each chunk accordingly on
            // top of the window-sized cap.
            let cap = (mss * snd_wnd.max(1)).min(mss * 256);
            if wait >= snd_wnd.max(1) {
                self.await_deadline(self.writable.notified()).await?;
                continue;
            }
            self.check_open()?;
            let take = cap.min(data.len() - offset);
            {
                let mut eng = self.engine.lock();
                eng.send(&data[offset..offset + take])?;
            }
            offset += take;
            self.schedule_flush(0);
        }
        Ok(())
    }

    pub async fn read(self: &Arc<Self>) -> Result<Bytes> {
        loop {
            let attempt = { self.engine.lock().recv() };
            match attempt {
                Ok(data) => return Ok(data),
                Err(Error::WouldBlock) => {
                    self.check_open()?;
                    self.await_deadline(self.readable.notified()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn close_write(self: &Arc<Self>) -> Result<()> {
        if self.close_write_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            self.engine.lock().send_close_marker();
        }
        self.schedule_flush(0);
        Ok(())
    }

    /// Waits for outstanding unacked data to drain (bounded by a fixed
    /// grace period), then tears the stream down and notifies the owning
    /// transport so it can drop its map entry.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.close_write();
        let grace = StdInstant::now() + Duration::from_secs(2);
        loop {
            let pending = self.engine.lock().wait_snd();
            if pending == 0 || StdInstant::now() >= grace {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        let _ = self.closed_tx.send(self.id);
        Ok(())
    }

    pub fn set_deadline(&self, deadline: Option<StdInstant>) {
        *self.deadline.lock() = deadline;
    }

    pub fn set_window(&self, snd_wnd: u16, rcv_wnd: u16) {
        self.engine.lock().set_window(snd_wnd, rcv_wnd);
    }

    pub fn set_nodelay(&self, nodelay: bool, interval: u32, resend: u32, nc: bool) {
        self.engine.lock().set_nodelay(nodelay, interval, resend, nc);
    }

    pub fn set_parallel_xmit(&self, k: usize) {
        let cap = self.remote_addrs.len().max(1);
        self.parallelism.lock().k = k.clamp(1, cap);
    }

    fn schedule_flush(self: &Arc<Self>, delay_ms: u32) {
        let key = fnv1a32(self.id.as_bytes());
        let this = self.clone();
        let _ = self.scheduler.trace(key, Mode::Exclusive, delay_ms, move || {
            this.run_flush();
        });
    }

    fn run_flush(self: Arc<Self>) {
        let now = self.time.now_ms();
        let (datagrams, out, retrans, dead, next) = {
            let mut eng = self.engine.lock();
            let datagrams = eng.flush(now);
            let (out, retrans) = eng.last_flush_counts();
            let dead = eng.is_dead_link();
            let next = eng.check(now);
            (datagrams, out, retrans, dead, next)
        };

        self.update_parallelism(out, retrans, now);

        if !datagrams.is_empty() {
            self.dispatch(datagrams);
        }
        self.writable.notify_waiters();

        if dead && !self.closed.swap(true, Ordering::AcqRel) {
            self.dead.store(true, Ordering::Release);
            self.readable.notify_waiters();
            self.writable.notify_waiters();
            let _ = self.closed_tx.send(self.id);
            return;
        }
        if self.is_closed() {
            return;
        }

        let delay = next.saturating_sub(now).max(1);
        self.schedule_flush(delay);
    }

    fn update_parallelism(&self, out: u32, retrans: u32, now: u32) {
        let mut p = self.parallelism.lock();
        p.ticks += 1;
        p.out_acc += out as u64;
        p.retrans_acc += retrans as u64;
        if p.ticks < self.topts.parallel_check_periods {
            return;
        }
        let ratio = if p.out_acc > 0 {
            p.retrans_acc as f64 / p.out_acc as f64
        } else {
            0.0
        };
        let max_k = self.remote_addrs.len().max(1);
        if ratio > self.topts.parallel_stream_rate {
            if p.k < max_k {
                p.k += 1;
            }
            p.floor_expiry_ms = now + self.topts.parallel_duration_ms;
        } else if now >= p.floor_expiry_ms && p.k > self.topts.parallel_xmit_min.max(1) {
            p.k -= 1;
        }
        p.ticks = 0;
        p.out_acc = 0;
        p.retrans_acc = 0;
    }

    fn dispatch(&self, datagrams: Vec<Bytes>) {
        if self.remote_addrs.is_empty() {
            return;
        }
        let id_bytes = *self.id.as_bytes();
        let k = self.parallelism.lock().k;
        let picks: Vec<Arc<Tunnel>> = self.selector.pick(&self.remote_addrs);
        for segs in datagrams {
            let framed = frame_datagram(&id_bytes, &segs).freeze();
            for (tunnel, addr) in picks.iter().zip(self.remote_addrs.iter()).take(k) {
                if let Err(err) = tunnel.output(*addr, framed.clone()) {
                    tracing::debug!(stream = %self.id, %err, "dropped outbound datagram");
                }
            }
        }
    }

    async fn await_deadline<F: std::future::Future<Output = ()>>(&self, fut: F) -> Result<()> {
        let deadline = *self.deadline.lock();
        match deadline {
            Some(instant) => {
                let tokio_instant = tokio::time::Instant::from_std(instant);
                tokio::time::timeout_at(tokio_instant, fut).await.map_err(|_| Error::Timeout)
            }
            None => {
                fut.await;
                Ok(())
            }
        }
    }
}
