//! Ambient observability counters (§6.3). The export format and exact field
//! names are out of scope; only the counters themselves are specified as
//! ambient infrastructure every component updates.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;

static GLOBAL: Lazy<Snmp> = Lazy::new(Snmp::new);

/// Process-wide default counters for short-lived tools that don't want to
/// thread an explicit `Arc<Snmp>` through (§9 "Globals").
pub fn global() -> &'static Snmp {
    &GLOBAL
}

#[derive(Debug, Default)]
pub struct Snmp {
    pub in_segs: AtomicU64,
    pub out_segs: AtomicU64,
    pub in_errs: AtomicU64,
    pub retrans_segs: AtomicU64,
    pub fast_retrans_segs: AtomicU64,
    pub repeat_segs: AtomicU64,
    pub lost_segs: AtomicU64,
}

impl Snmp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_segs(&self) -> u64 {
        self.in_segs.load(Ordering::Relaxed)
    }
    pub fn out_segs(&self) -> u64 {
        self.out_segs.load(Ordering::Relaxed)
    }
    pub fn in_errs(&self) -> u64 {
        self.in_errs.load(Ordering::Relaxed)
    }
    pub fn retrans_segs(&self) -> u64 {
        self.retrans_segs.load(Ordering::Relaxed)
    }
    pub fn fast_retrans_segs(&self) -> u64 {
        self.fast_retrans_segs.load(Ordering::Relaxed)
    }
    pub fn repeat_segs(&self) -> u64 {
        self.repeat_segs.load(Ordering::Relaxed)
    }
    pub fn lost_segs(&self) -> u64 {
        self.lost_segs.load(Ordering::Relaxed)
    }

    pub(crate) fn incr_in_segs(&self) {
        self.in_segs.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_out_segs(&self) {
        self.out_segs.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_in_errs(&self) {
        self.in_errs.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_retrans_segs(&self) {
        self.retrans_segs.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_fast_retrans_segs(&self) {
        self.fast_retrans_segs.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_repeat_segs(&self) {
        self.repeat_segs.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_lost_segs(&self) {
        self.lost_segs.fetch_add(1, Ordering::Relaxed);
    }
}
