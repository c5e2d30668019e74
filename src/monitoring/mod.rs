//! # Monitoring
//!
//! - [`health`]: periodic health snapshots and threshold warnings

pub mod health;

pub use health::{evaluate, HealthMonitor, HealthReport, HealthThresholds, HealthWarning};
