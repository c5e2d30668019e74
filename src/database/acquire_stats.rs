//! Acquire latency observed through pool events.
//!
//! [`AcquireStats`] is a [`PoolEventListener`]; the pool registers one ahead of
//! caller listeners so every borrow, timeout and connect failure is counted
//! from the same event stream the metrics collector sees.

use crate::database::events::{PoolEvent, PoolEventListener};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Borrows that waited at least this long are counted as slow.
pub const DEFAULT_SLOW_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct AcquireStats {
    slow_wait: Duration,
    borrows: AtomicU64,
    wait_sum_us: AtomicU64,
    longest_wait_us: AtomicU64,
    slow_waits: AtomicU64,
    timeouts: AtomicU64,
    connect_failures: AtomicU64,
}

impl Default for AcquireStats {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_WAIT)
    }
}

impl AcquireStats {
    pub fn new(slow_wait: Duration) -> Self {
        Self {
            slow_wait,
            borrows: AtomicU64::new(0),
            wait_sum_us: AtomicU64::new(0),
            longest_wait_us: AtomicU64::new(0),
            slow_waits: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
        }
    }

    fn record_borrow(&self, wait: Duration) {
        let wait_us = u64::try_from(wait.as_micros()).unwrap_or(u64::MAX);
        self.borrows.fetch_add(1, Ordering::Relaxed);
        self.wait_sum_us.fetch_add(wait_us, Ordering::Relaxed);
        self.longest_wait_us.fetch_max(wait_us, Ordering::Relaxed);
        if wait >= self.slow_wait {
            self.slow_waits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Relaxed loads; fields may lag each other by an in-flight borrow.
    pub fn snapshot(&self) -> AcquireStatsSnapshot {
        let borrows = self.borrows.load(Ordering::Relaxed);
        let wait_sum_us = self.wait_sum_us.load(Ordering::Relaxed);
        let mean_wait_ms = if borrows == 0 {
            0.0
        } else {
            wait_sum_us as f64 / borrows as f64 / 1_000.0
        };

        AcquireStatsSnapshot {
            borrows,
            slow_waits: self.slow_waits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            mean_wait_ms,
            longest_wait_ms: self.longest_wait_us.load(Ordering::Relaxed) as f64 / 1_000.0,
        }
    }
}

impl PoolEventListener for AcquireStats {
    fn on_event(&self, event: &PoolEvent) {
        match event {
            PoolEvent::Acquire { wait } => self.record_borrow(*wait),
            PoolEvent::AcquireTimeout { .. } => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            PoolEvent::Error { .. } => {
                self.connect_failures.fetch_add(1, Ordering::Relaxed);
            }
            PoolEvent::Connect
            | PoolEvent::Release
            | PoolEvent::Remove { .. }
            | PoolEvent::Rejected => {}
        }
    }
}

/// Point-in-time view of [`AcquireStats`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AcquireStatsSnapshot {
    pub borrows: u64,
    pub slow_waits: u64,
    pub timeouts: u64,
    pub connect_failures: u64,
    pub mean_wait_ms: f64,
    pub longest_wait_ms: f64,
}
