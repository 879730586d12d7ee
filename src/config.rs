//! Wire-level and transport-level tunables (§6.1, §4.7, §4.2, §4.3).

pub const IKCP_OVERHEAD: usize = 24;
pub const IKCP_MTU_DEF: usize = 1400;
pub const IKCP_RTO_DEF: u32 = 200;
pub const IKCP_RTO_MIN: u32 = 100;
pub const IKCP_RTO_MAX: u32 = 60_000;
pub const IKCP_WND_SND: u16 = 32;
pub const IKCP_WND_RCV: u16 = 32;
pub const IKCP_INTERVAL: u32 = 100;
pub const IKCP_DEADLINK: u32 = 20;
pub const IKCP_THRESH_INIT: u32 = 2;
pub const IKCP_PROBE_INIT: u32 = 7_000;
pub const IKCP_PROBE_LIMIT: u32 = 120_000;
pub const IKCP_FASTACK_LIMIT: u32 = 5;

pub const CMD_PUSH: u8 = 81;
pub const CMD_ACK: u8 = 82;
pub const CMD_WASK: u8 = 83;
pub const CMD_WINS: u8 = 84;

/// The four named profiles for `(nodelay, interval, resend, nc)` from §6.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KcpOptions {
    pub nodelay: bool,
    pub interval: u32,
    pub fast_resend: u32,
    pub nocwnd: bool,
    pub mtu: usize,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
}

impl Default for KcpOptions {
    fn default() -> Self {
        Self::normal()
    }
}

impl KcpOptions {
    pub fn normal() -> Self {
        Self {
            nodelay: false,
            interval: 40,
            fast_resend: 0,
            nocwnd: false,
            mtu: IKCP_MTU_DEF,
            snd_wnd: IKCP_WND_SND,
            rcv_wnd: IKCP_WND_RCV,
        }
    }

    pub fn fast() -> Self {
        Self {
            nodelay: false,
            interval: 30,
            fast_resend: 2,
            nocwnd: true,
            ..Self::normal()
        }
    }

    pub fn fast2() -> Self {
        Self {
            nodelay: true,
            interval: 20,
            fast_resend: 2,
            nocwnd: true,
            ..Self::normal()
        }
    }

    pub fn fast3() -> Self {
        Self {
            nodelay: true,
            interval: 10,
            fast_resend: 2,
            nocwnd: true,
            ..Self::normal()
        }
    }

    pub fn mss(&self) -> usize {
        self.mtu - IKCP_OVERHEAD
    }
}

/// Transport-wide knobs not carried by an individual KCP engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// Bounded capacity of the passive-open accept queue (§4.7).
    pub accept_backlog: usize,
    /// Number of shards `Q` in the message broker (§4.3).
    pub broker_shards: usize,
    /// Concurrent-consumer limit `L` on the message broker (§4.3).
    pub broker_limit: usize,
    /// Number of timed-scheduler instances `N` in the pool (§4.2).
    pub scheduler_pool_size: usize,
    /// Lower bound for the per-stream parallel transmit count `k` (§4.6).
    pub parallel_xmit_min: usize,
    /// Number of consecutive flush ticks examined by the parallelism
    /// heuristic (§4.6).
    pub parallel_check_periods: u32,
    /// Retransmit/out-segment ratio above which `k` is raised (§4.6).
    pub parallel_stream_rate: f64,
    /// How long a raised `k` is held before it may be lowered again (ms).
    pub parallel_duration_ms: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            accept_backlog: 128,
            broker_shards: 8,
            broker_limit: 4,
            scheduler_pool_size: 4,
            parallel_xmit_min: 1,
            parallel_check_periods: 10,
            parallel_stream_rate: 0.2,
            parallel_duration_ms: 5_000,
        }
    }
}
