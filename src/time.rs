//! Deterministic time seam: a `TimeProvider` trait split between a
//! real-clock implementation and a manually-advanced test double.

use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    fn now_instant(&self) -> Instant;
    fn now_ms(&self) -> u32;
}

#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_ms(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u32
    }
}

/// A manually-advanced clock for scheduler/RTO/flush tests that need exact
/// control over elapsed time rather than racing the real clock.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: RwLock<Instant>,
    ms: RwLock<u32>,
}

impl ManualTimeProvider {
    pub fn new() -> Self {
        Self {
            instant: RwLock::new(Instant::now()),
            ms: RwLock::new(0),
        }
    }

    pub fn advance(&self, delta: Duration) {
        *self.instant.write().unwrap() += delta;
        *self.ms.write().unwrap() += delta.as_millis() as u32;
    }

    pub fn set_ms(&self, ms: u32) {
        *self.ms.write().unwrap() = ms;
    }
}

impl Default for ManualTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        *self.instant.read().unwrap()
    }

    fn now_ms(&self) -> u32 {
        *self.ms.read().unwrap()
    }
}
