//! # kcp-mux
//!
//! A reliable, ordered, congestion-controlled multipath stream transport
//! built on top of UDP, inspired by KCP.
//!
//! ## Architecture
//!
//! - **Reliability**: selective ACKs, fast retransmit, and an RFC 6298-style
//!   RTO estimator, one instance per stream ([`kcp::KcpEngine`]).
//! - **Multipath**: each stream may duplicate its outbound segments across
//!   several UDP tunnels, picked by a pluggable [`route::RouteSelector`].
//! - **Scheduling**: a single-threaded, keyed timed scheduler
//!   ([`scheduler::TimedScheduler`]) drives every stream's RTO/probe timers
//!   and deadline wakeups.
//! - **I/O**: sharded, double-buffered outbound queues ([`broker::MsgBroker`])
//!   feed batched UDP sends on platforms that support `sendmmsg`/`recvmmsg`.

pub mod batch;
pub mod broker;
pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod kcp;
pub mod logging;
pub mod route;
pub mod scheduler;
pub mod segment;
pub mod snmp;
pub mod stream;
pub mod time;
pub mod transport;
pub mod tunnel;

pub use config::{KcpOptions, TransportOptions};
pub use error::{Error, Result};
pub use route::{AddrBucketSelector, RouteSelector};
pub use snmp::Snmp;
pub use stream::Stream;
pub use transport::Transport;
pub use tunnel::Tunnel;
