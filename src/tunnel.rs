//! §4.4 — one UDP socket plus its read/write loops.
//!
//! Grounded on `examples/original_source/tunnel.go`'s `UDPTunnel`: a
//! `dieOnce`-guarded close, an `output` path with loss/delay simulation
//! ahead of the broker push, and `inputcb`-style demultiplexing on read.
//! The callback is a channel rather than a back-reference to the transport
//! (§9.1 "Callback cycle resolution").

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::batch::{self, RecvBatchSlot, SendBatchSlot};
use crate::broker::MsgBroker;
use crate::config::IKCP_OVERHEAD;
use crate::error::{Error, Result};
use crate::scheduler::TimedScheduler;
use crate::snmp::Snmp;

const RECV_BATCH: usize = 32;
const UUID_LEN: usize = 16;

/// One UDP socket, its read/write loops, and optional fault-injection knobs
/// used by the end-to-end loss/jitter tests (§8).
pub struct Tunnel {
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    broker: Arc<MsgBroker>,
    scheduler: Arc<TimedScheduler>,
    closed: Arc<AtomicBool>,
    loss_pct: AtomicU32,
    delay_min_ms: AtomicU32,
    delay_max_ms: AtomicU32,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl Tunnel {
    /// Binds `laddr`, spawns the read and write loops, and starts routing
    /// inbound payloads (stripped of their UUID prefix) to `inbound_tx`.
    pub async fn bind(
        laddr: SocketAddr,
        inbound_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
        broker: Arc<MsgBroker>,
        scheduler: Arc<TimedScheduler>,
        snmp: Arc<Snmp>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(laddr)
            .await
            .map_err(|source| Error::Io { addr: Some(laddr), source })?;
        let local_addr = socket.local_addr().map_err(|source| Error::Io { addr: None, source })?;
        let socket = Arc::new(socket);
        let closed = Arc::new(AtomicBool::new(false));

        let read_task = tokio::spawn(Self::read_loop(
            socket.clone(),
            inbound_tx,
            snmp,
            closed.clone(),
        ));
        let write_task = tokio::spawn(Self::write_loop(socket.clone(), broker.clone(), closed.clone()));

        tracing::info!(%local_addr, "tunnel bound");

        Ok(Self {
            local_addr,
            socket,
            broker,
            scheduler,
            closed,
            loss_pct: AtomicU32::new(0),
            delay_min_ms: AtomicU32::new(0),
            delay_max_ms: AtomicU32::new(0),
            read_task,
            write_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Test hook (§4.4 Simulation): `loss_pct` in `[0, 100]`, `delay_max_ms`
    /// of `0` disables delay entirely.
    pub fn simulate(&self, loss_pct: u32, delay_min_ms: u32, delay_max_ms: u32) {
        tracing::warn!(
            addr = %self.local_addr,
            loss_pct,
            delay_min_ms,
            delay_max_ms,
            "tunnel fault injection enabled"
        );
        self.loss_pct.store(loss_pct.min(100), Ordering::Relaxed);
        self.delay_min_ms.store(delay_min_ms, Ordering::Relaxed);
        self.delay_max_ms.store(delay_max_ms, Ordering::Relaxed);
    }

    /// Queues one outbound datagram, applying loss/delay simulation first.
    pub fn output(&self, addr: SocketAddr, datagram: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedPipe);
        }

        let loss = self.loss_pct.load(Ordering::Relaxed);
        if loss > 0 && rand::thread_rng().gen_range(0..100) < loss {
            return Ok(());
        }

        let delay_max = self.delay_max_ms.load(Ordering::Relaxed);
        if delay_max == 0 {
            self.broker.push(vec![(addr, datagram)]);
            return Ok(());
        }

        let delay_min = self.delay_min_ms.load(Ordering::Relaxed);
        let delay = if delay_max > delay_min {
            rand::thread_rng().gen_range(delay_min..delay_max)
        } else {
            delay_min
        };
        let broker = self.broker.clone();
        self.scheduler.run_after(delay, move || {
            broker.push(vec![(addr, datagram)]);
        });
        Ok(())
    }

    /// Idempotent: closing twice is a no-op, matching `dieOnce` in the
    /// original source.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(addr = %self.local_addr, "tunnel closing");
        self.read_task.abort();
        self.write_task.abort();
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        inbound_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
        snmp: Arc<Snmp>,
        closed: Arc<AtomicBool>,
    ) {
        let mut backing: Vec<Vec<u8>> = (0..RECV_BATCH).map(|_| vec![0u8; 2048]).collect();
        loop {
            if closed.load(Ordering::Acquire) {
                return;
            }
            let mut slots: Vec<RecvBatchSlot<'_>> =
                backing.iter_mut().map(|b| RecvBatchSlot::new(b.as_mut_slice())).collect();
            match batch::recv_many(&socket, &mut slots).await {
                Ok(filled) => {
                    for slot in slots.iter().take(filled) {
                        let Some(addr) = slot.addr() else { continue };
                        let payload = slot.payload();
                        if payload.len() < UUID_LEN + IKCP_OVERHEAD {
                            snmp.incr_in_errs();
                            continue;
                        }
                        if inbound_tx.send((addr, Bytes::copy_from_slice(payload))).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "tunnel read loop error");
                    return;
                }
            }
        }
    }

    async fn write_loop(socket: Arc<UdpSocket>, broker: Arc<MsgBroker>, closed: Arc<AtomicBool>) {
        loop {
            if closed.load(Ordering::Acquire) {
                return;
            }
            // `acquire` only returns once its shard has something queued, so
            // `drained` is never empty here.
            let mut drained = Vec::new();
            let ticket = broker.acquire(&mut drained).await;

            let mut remaining = drained.clone();
            while !remaining.is_empty() {
                let mut slots: Vec<SendBatchSlot<'_>> =
                    remaining.iter().map(|(addr, payload)| SendBatchSlot::new(payload, *addr)).collect();
                match batch::send_many(&socket, &mut slots).await {
                    Ok(sent) if sent > 0 => {
                        remaining.drain(..sent);
                    }
                    Ok(_) => break,
                    Err(err) => {
                        tracing::error!(%err, "tunnel write loop error");
                        break;
                    }
                }
            }

            broker.release(ticket, drained);
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}
