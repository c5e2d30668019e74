//! # Query Metrics (OpenTelemetry)
//!
//! OpenTelemetry instruments mirroring [`MetricsCollector`](super::MetricsCollector):
//! - Query execution and slow query counters
//! - Query duration histogram
//! - Error counter by kind
//! - Borrowed connection gauge
//!
//! Instruments are recorded through the global meter provider; without an
//! installed provider they are no-ops.
//!
//! ## Usage
//!
//! ```rust
//! use resilient_db::metrics::otel::*;
//! use opentelemetry::KeyValue;
//!
//! init();
//! if let Some(counter) = QUERIES_TOTAL.get() {
//!     counter.add(1, &[KeyValue::new("query", "list_schools")]);
//! }
//! ```

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use std::sync::OnceLock;

static QUERY_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    QUERY_METER.get_or_init(|| opentelemetry::global::meter_provider().meter("resilient-db"))
}

// Counters

/// Total number of query executions started
///
/// Labels:
/// - query: operation name passed to `execute`
pub fn queries_total() -> Counter<u64> {
    meter()
        .u64_counter("resilient_db.queries.total")
        .with_description("Total number of query executions started")
        .build()
}

/// Total number of query attempts slower than the slow query threshold
pub fn slow_queries_total() -> Counter<u64> {
    meter()
        .u64_counter("resilient_db.queries.slow.total")
        .with_description("Total number of slow query attempts")
        .build()
}

/// Total number of failed attempts and pool errors
///
/// Labels:
/// - error_kind: pool_exhausted, connection_reset, timeout, business, ...
pub fn errors_total() -> Counter<u64> {
    meter()
        .u64_counter("resilient_db.errors.total")
        .with_description("Total number of failed query attempts and pool errors")
        .build()
}

// Histograms

/// Query attempt duration in milliseconds, acquire included
pub fn query_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("resilient_db.query.duration")
        .with_description("Query attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

// Gauges

/// Connections currently borrowed from the pool
pub fn active_connections() -> Gauge<i64> {
    meter()
        .i64_gauge("resilient_db.pool.active_connections")
        .with_description("Connections currently borrowed from the pool")
        .build()
}

pub static QUERIES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
pub static SLOW_QUERIES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
pub static ERRORS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
pub static QUERY_DURATION: OnceLock<Histogram<f64>> = OnceLock::new();
pub static ACTIVE_CONNECTIONS: OnceLock<Gauge<i64>> = OnceLock::new();

/// Initialize all query metrics
pub fn init() {
    QUERIES_TOTAL.get_or_init(queries_total);
    SLOW_QUERIES_TOTAL.get_or_init(slow_queries_total);
    ERRORS_TOTAL.get_or_init(errors_total);
    QUERY_DURATION.get_or_init(query_duration);
    ACTIVE_CONNECTIONS.get_or_init(active_connections);
}
