//! # Query Metrics
//!
//! [`MetricsCollector`] keeps the in-process counters behind
//! [`QueryExecutor::metrics`](crate::executor::QueryExecutor::metrics):
//!
//! - Counters are atomics, so `metrics()` never waits on a query or on the pool.
//! - The running average latency sits behind a mutex and is updated with
//!   `avg' = (avg * (n - 1) + d) / n`.
//! - The collector is registered as a [`PoolEventListener`] and tracks borrowed
//!   connections and pool failures from pool events.
//!
//! Every update is mirrored into the OpenTelemetry instruments in [`otel`].

pub mod otel;

use crate::database::{PoolEvent, PoolEventListener, PoolStatus};
use crate::logging::{log_pool_event, log_slow_query};
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// How many slow queries are kept for inspection
const SLOW_QUERY_HISTORY: usize = 32;

/// Pool occupancy as reported in [`QueryMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub total_count: u32,
    pub idle_count: u32,
    pub waiting_count: u32,
}

impl From<PoolStatus> for PoolCounts {
    fn from(status: PoolStatus) -> Self {
        Self {
            total_count: status.total_count,
            idle_count: status.idle_count,
            waiting_count: status.waiting_count,
        }
    }
}

/// Read-only snapshot of query and pool metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMetrics {
    /// Connections currently borrowed by callers
    pub active_connections: i64,
    pub total_queries: u64,
    pub slow_queries: u64,
    pub errors: u64,
    pub avg_query_time_ms: f64,
    pub pool_status: PoolCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowQueryRecord {
    pub query: String,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Anything that can produce a [`QueryMetrics`] snapshot.
pub trait MetricsSource: Send + Sync {
    fn metrics(&self) -> QueryMetrics;
}

#[derive(Debug, Default)]
struct LatencyAverage {
    samples: u64,
    avg_ms: f64,
}

#[derive(Debug)]
pub struct MetricsCollector {
    active_connections: AtomicI64,
    total_queries: AtomicU64,
    slow_queries: AtomicU64,
    errors: AtomicU64,
    latency: Mutex<LatencyAverage>,
    slow_query_threshold: Duration,
    recent_slow: Mutex<VecDeque<SlowQueryRecord>>,
}

impl MetricsCollector {
    pub fn new(slow_query_threshold: Duration) -> Self {
        otel::init();
        Self {
            active_connections: AtomicI64::new(0),
            total_queries: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency: Mutex::new(LatencyAverage::default()),
            slow_query_threshold,
            recent_slow: Mutex::new(VecDeque::with_capacity(SLOW_QUERY_HISTORY)),
        }
    }

    /// Count a call to `execute`. Called once per call, not per attempt.
    pub fn record_query_started(&self, query: &str) {
        self.total_queries.fetch_add(1, Ordering::AcqRel);
        if let Some(counter) = otel::QUERIES_TOTAL.get() {
            counter.add(1, &[KeyValue::new("query", query.to_string())]);
        }
    }

    /// Fold an attempt duration into the running average.
    ///
    /// Durations are per attempt: a retried call contributes one sample per
    /// attempt that reached the operation, and each slow attempt is counted
    /// and logged on its own. Returns `true` when the attempt was slower than
    /// the slow query threshold.
    pub fn record_duration(&self, query: &str, duration: Duration) -> bool {
        let duration_ms = duration.as_secs_f64() * 1000.0;
        {
            let mut latency = self.latency.lock();
            latency.samples += 1;
            let n = latency.samples as f64;
            latency.avg_ms = (latency.avg_ms * (n - 1.0) + duration_ms) / n;
        }

        if let Some(histogram) = otel::QUERY_DURATION.get() {
            histogram.record(duration_ms, &[KeyValue::new("query", query.to_string())]);
        }

        if duration <= self.slow_query_threshold {
            return false;
        }

        self.slow_queries.fetch_add(1, Ordering::AcqRel);
        log_slow_query(query, duration, self.slow_query_threshold);
        if let Some(counter) = otel::SLOW_QUERIES_TOTAL.get() {
            counter.add(1, &[KeyValue::new("query", query.to_string())]);
        }

        let mut recent = self.recent_slow.lock();
        if recent.len() == SLOW_QUERY_HISTORY {
            recent.pop_front();
        }
        recent.push_back(SlowQueryRecord {
            query: query.to_string(),
            duration_ms: duration.as_millis() as u64,
            recorded_at: Utc::now(),
        });
        true
    }

    /// Count one failed attempt or pool failure.
    ///
    /// One call can add several errors: each failed attempt counts, and a
    /// cancellation that lands during backoff counts again on top of the
    /// transient failure that caused the backoff.
    pub fn record_error(&self, error_kind: &str) {
        self.errors.fetch_add(1, Ordering::AcqRel);
        if let Some(counter) = otel::ERRORS_TOTAL.get() {
            counter.add(1, &[KeyValue::new("error_kind", error_kind.to_string())]);
        }
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn total_queries(&self) -> u64 {
        self.total_queries.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Acquire)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        self.slow_query_threshold
    }

    /// Most recent slow queries, oldest first.
    pub fn recent_slow_queries(&self) -> Vec<SlowQueryRecord> {
        self.recent_slow.lock().iter().cloned().collect()
    }

    /// Combine counters with a pool status read.
    pub fn snapshot(&self, pool: PoolStatus) -> QueryMetrics {
        let avg_query_time_ms = self.latency.lock().avg_ms;
        QueryMetrics {
            active_connections: self.active_connections.load(Ordering::Acquire),
            total_queries: self.total_queries.load(Ordering::Acquire),
            slow_queries: self.slow_queries.load(Ordering::Acquire),
            errors: self.errors.load(Ordering::Acquire),
            avg_query_time_ms,
            pool_status: pool.into(),
        }
    }

    fn adjust_active(&self, delta: i64) {
        let active = self.active_connections.fetch_add(delta, Ordering::AcqRel) + delta;
        if let Some(gauge) = otel::ACTIVE_CONNECTIONS.get() {
            gauge.record(active, &[]);
        }
    }
}

impl PoolEventListener for MetricsCollector {
    fn on_event(&self, event: &PoolEvent) {
        match event {
            PoolEvent::Acquire { .. } => self.adjust_active(1),
            PoolEvent::Release => self.adjust_active(-1),
            PoolEvent::AcquireTimeout { waited } => {
                self.record_error("pool_exhausted");
                log_pool_event(
                    "acquire_timeout",
                    "pool",
                    Some(&format!("waited {}ms", waited.as_millis())),
                );
            }
            PoolEvent::Rejected => self.record_error("shutdown_in_progress"),
            PoolEvent::Error { error } => self.record_error(error.kind().as_str()),
            PoolEvent::Connect => log_pool_event("connect", "pool", None),
            PoolEvent::Remove { reason } => {
                log_pool_event("remove", "pool", Some(&format!("{reason:?}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;

    fn status(total: u32, idle: u32, waiting: u32) -> PoolStatus {
        PoolStatus {
            total_count: total,
            idle_count: idle,
            waiting_count: waiting,
            max_connections: 10,
            is_closed: false,
        }
    }

    #[test]
    fn test_running_average() {
        let collector = MetricsCollector::new(Duration::from_millis(100));
        collector.record_duration("a", Duration::from_millis(10));
        collector.record_duration("b", Duration::from_millis(20));
        collector.record_duration("c", Duration::from_millis(60));

        let snapshot = collector.snapshot(status(0, 0, 0));
        assert!((snapshot.avg_query_time_ms - 30.0).abs() < 1e-9);
        assert_eq!(snapshot.slow_queries, 0);
    }

    #[test]
    fn test_slow_query_threshold_is_strict() {
        let collector = MetricsCollector::new(Duration::from_millis(100));
        assert!(!collector.record_duration("at_threshold", Duration::from_millis(100)));
        assert!(collector.record_duration("over", Duration::from_millis(101)));

        let recent = collector.recent_slow_queries();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].query, "over");
        assert_eq!(recent[0].duration_ms, 101);
    }

    #[test]
    fn test_slow_history_is_bounded() {
        let collector = MetricsCollector::new(Duration::from_millis(1));
        for i in 0..(SLOW_QUERY_HISTORY + 5) {
            collector.record_duration(&format!("q{i}"), Duration::from_millis(5));
        }
        let recent = collector.recent_slow_queries();
        assert_eq!(recent.len(), SLOW_QUERY_HISTORY);
        assert_eq!(recent[0].query, "q5");
    }

    #[test]
    fn test_pool_events_drive_active_and_errors() {
        let collector = MetricsCollector::new(Duration::from_millis(100));
        collector.on_event(&PoolEvent::Acquire {
            wait: Duration::ZERO,
        });
        collector.on_event(&PoolEvent::Acquire {
            wait: Duration::ZERO,
        });
        collector.on_event(&PoolEvent::Release);
        assert_eq!(collector.active_connections(), 1);

        collector.on_event(&PoolEvent::AcquireTimeout {
            waited: Duration::from_millis(100),
        });
        collector.on_event(&PoolEvent::Error {
            error: DbError::from_message("connection refused"),
        });
        collector.on_event(&PoolEvent::Connect);
        assert_eq!(collector.errors(), 2);
    }

    #[test]
    fn test_snapshot_copies_pool_counts() {
        let collector = MetricsCollector::new(Duration::from_millis(100));
        collector.record_query_started("list_schools");
        let snapshot = collector.snapshot(status(4, 1, 2));
        assert_eq!(snapshot.total_queries, 1);
        assert_eq!(
            snapshot.pool_status,
            PoolCounts {
                total_count: 4,
                idle_count: 1,
                waiting_count: 2
            }
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["pool_status"]["waiting_count"], 2);
    }
}
