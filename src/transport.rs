//! §4.7 — the transport: stream map, tunnel registry, accept queue, and the
//! demultiplexer that ties tunnel reads to stream input.
//!
//! Grounded on `examples/original_source/transport.go`'s `UDPTransport`:
//! `newStreamUUID`/map-then-queue on first sight of a conversation, `Dial`
//! allocating a v1 UUID, `Accept` blocking on a channel, idempotent `Close`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::{Context, Timestamp, Uuid};

use crate::broker::MsgBroker;
use crate::buffer_pool::BufferPool;
use crate::config::{KcpOptions, TransportOptions};
use crate::error::{Error, Result};
use crate::route::RouteSelector;
use crate::scheduler::{fnv1a32, SchedulerPool};
use crate::segment;
use crate::snmp::Snmp;
use crate::stream::Stream;
use crate::time::{SystemTimeProvider, TimeProvider};
use crate::tunnel::Tunnel;

const STREAM_MAP_SHARDS: usize = 16;

struct StreamMap {
    shards: Vec<Mutex<HashMap<Uuid, Arc<Stream>>>>,
}

impl StreamMap {
    fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, id: &Uuid) -> &Mutex<HashMap<Uuid, Arc<Stream>>> {
        let h = id.as_u128() as usize;
        &self.shards[h % self.shards.len()]
    }

    fn get(&self, id: &Uuid) -> Option<Arc<Stream>> {
        self.shard_for(id).lock().get(id).cloned()
    }

    fn insert(&self, id: Uuid, stream: Arc<Stream>) {
        self.shard_for(&id).lock().insert(id, stream);
    }

    fn remove(&self, id: &Uuid) {
        self.shard_for(id).lock().remove(id);
    }

    fn drain_all(&self) -> Vec<Arc<Stream>> {
        self.shards.iter().flat_map(|shard| shard.lock().drain().map(|(_, v)| v).collect::<Vec<_>>()).collect()
    }
}

/// Allocates a v1 (time + node-id) UUID, as `Dial` does in the original
/// source; the node id is random per process rather than MAC-derived.
fn new_stream_id() -> Uuid {
    static CONTEXT: Context = Context::new(0);
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let ts = Timestamp::from_unix(&CONTEXT, now.as_secs(), now.subsec_nanos());
    let node_id: [u8; 6] = rand::random();
    Uuid::new_v1(ts, &node_id)
}

/// Owns every stream, tunnel, and the shared broker/scheduler context for
/// one multipath KCP endpoint.
pub struct Transport {
    streams: Arc<StreamMap>,
    tunnels: Mutex<HashMap<SocketAddr, Arc<Tunnel>>>,
    selector: Arc<dyn RouteSelector>,
    accept_tx: mpsc::Sender<Arc<Stream>>,
    accept_rx: AsyncMutex<mpsc::Receiver<Arc<Stream>>>,
    broker: Arc<MsgBroker>,
    pool: Arc<BufferPool>,
    scheduler_pool: Arc<SchedulerPool>,
    time: Arc<dyn TimeProvider>,
    snmp: Arc<Snmp>,
    opts: KcpOptions,
    topts: TransportOptions,
    closed: AtomicBool,
    closed_tx: mpsc::UnboundedSender<Uuid>,
    inbound_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
}

impl Transport {
    pub fn new(selector: Arc<dyn RouteSelector>, opts: KcpOptions, topts: TransportOptions) -> Arc<Self> {
        Self::with_time(selector, opts, topts, Arc::new(SystemTimeProvider))
    }

    pub fn with_time(
        selector: Arc<dyn RouteSelector>,
        opts: KcpOptions,
        topts: TransportOptions,
        time: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        let snmp = Arc::new(Snmp::new());
        let pool = Arc::new(BufferPool::new(4096));
        let broker = MsgBroker::new(topts.broker_shards, topts.broker_limit, pool.clone());
        let scheduler_pool = Arc::new(SchedulerPool::new(topts.scheduler_pool_size, time.clone()));
        let (accept_tx, accept_rx) = mpsc::channel(topts.accept_backlog);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel::<Uuid>();
        let streams = Arc::new(StreamMap::new(STREAM_MAP_SHARDS));

        let transport = Arc::new(Self {
            streams: streams.clone(),
            tunnels: Mutex::new(HashMap::new()),
            selector,
            accept_tx,
            accept_rx: AsyncMutex::new(accept_rx),
            broker,
            pool,
            scheduler_pool,
            time,
            snmp,
            opts,
            topts,
            closed: AtomicBool::new(false),
            closed_tx,
            inbound_tx,
        });

        tokio::spawn(Self::demux_loop(transport.clone(), inbound_rx));
        tokio::spawn(Self::reap_loop(streams, closed_rx));
        transport
    }

    /// Binds a new UDP tunnel and registers it with the route selector.
    pub async fn new_tunnel(self: &Arc<Self>, local_addr: SocketAddr) -> Result<Arc<Tunnel>> {
        let tunnel = Arc::new(
            Tunnel::bind(
                local_addr,
                self.inbound_tx.clone(),
                self.broker.clone(),
                self.scheduler_pool.next().clone(),
                self.snmp.clone(),
            )
            .await?,
        );
        {
            let mut tunnels = self.tunnels.lock();
            if tunnels.contains_key(&tunnel.local_addr()) {
                return Err(Error::Programmer("duplicate tunnel address"));
            }
            tunnels.insert(tunnel.local_addr(), tunnel.clone());
        }
        self.selector.add_tunnel(tunnel.clone());
        Ok(tunnel)
    }

    /// Active open: allocates a stream bound to `remote_addrs`, `k = 1`.
    pub fn open(self: &Arc<Self>, remote_addrs: Vec<SocketAddr>) -> Result<Arc<Stream>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedPipe);
        }
        if remote_addrs.is_empty() {
            return Err(Error::Programmer("open requires at least one remote address"));
        }
        let id = new_stream_id();
        // Keyed EXCLUSIVE flush entries (`Stream::schedule_flush`) stripe by
        // `fnv1a32(id) mod N`, so the pool instance is chosen the same way
        // here rather than round-robin.
        let stream = Stream::new(
            id,
            self.opts,
            self.topts,
            remote_addrs,
            self.selector.clone(),
            self.scheduler_pool.for_key(fnv1a32(id.as_bytes())).clone(),
            self.time.clone(),
            self.snmp.clone(),
            self.pool.clone(),
            self.closed_tx.clone(),
        );
        self.streams.insert(id, stream.clone());
        Ok(stream)
    }

    /// Blocks for the next passively-opened stream.
    pub async fn accept(self: &Arc<Self>) -> Result<Arc<Stream>> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or(Error::ClosedPipe)
    }

    pub fn snmp(&self) -> &Arc<Snmp> {
        &self.snmp
    }

    /// Idempotent: signals every stream, drains the accept queue, closes
    /// every tunnel.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for stream in self.streams.drain_all() {
            let _ = stream.close().await;
        }
        self.accept_rx.lock().await.close();
        let tunnels: Vec<Arc<Tunnel>> = {
            let mut guard = self.tunnels.lock();
            guard.drain().map(|(_, t)| t).collect()
        };
        for tunnel in tunnels {
            tunnel.close();
        }
        Ok(())
    }

    async fn demux_loop(transport: Arc<Self>, mut inbound_rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
        while let Some((addr, datagram)) = inbound_rx.recv().await {
            if transport.closed.load(Ordering::Acquire) {
                continue;
            }
            let (uuid_bytes, payload) = match segment::split_datagram(datagram) {
                Ok(v) => v,
                Err(_) => {
                    transport.snmp.incr_in_errs();
                    continue;
                }
            };
            let id = Uuid::from_bytes(uuid_bytes);

            if let Some(stream) = transport.streams.get(&id) {
                stream.input(payload);
                continue;
            }

            let stream = Stream::new(
                id,
                transport.opts,
                transport.topts,
                vec![addr],
                transport.selector.clone(),
                transport.scheduler_pool.for_key(fnv1a32(id.as_bytes())).clone(),
                transport.time.clone(),
                transport.snmp.clone(),
                transport.pool.clone(),
                transport.closed_tx.clone(),
            );
            transport.streams.insert(id, stream.clone());
            stream.input(payload);

            if transport.accept_tx.try_send(stream.clone()).is_err() {
                tracing::warn!(%id, "accept queue full, dropping newly accepted stream");
            }
        }
    }

    async fn reap_loop(streams: Arc<StreamMap>, mut closed_rx: mpsc::UnboundedReceiver<Uuid>) {
        while let Some(id) = closed_rx.recv().await {
            streams.remove(&id);
        }
    }
}
