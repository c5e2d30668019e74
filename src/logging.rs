//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and a JSON log file.
//! `RUST_LOG` takes precedence over the environment-derived level.

use crate::config::loader::detect_environment;
use chrono::Utc;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::OnceLock;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Directory the JSON log file is written to, relative to the working directory
pub const DEFAULT_LOG_DIR: &str = "log";

static LOGGER_INITIALIZED: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration,
/// writing the JSON log file under [`DEFAULT_LOG_DIR`].
///
/// Safe to call repeatedly; only the first call installs a subscriber. If a
/// global subscriber already exists (tests, embedding applications) it is left alone.
pub fn init_structured_logging() {
    init_structured_logging_in(Path::new(DEFAULT_LOG_DIR));
}

/// Same as [`init_structured_logging`] with the JSON log file under `log_dir`.
pub fn init_structured_logging_in(log_dir: &Path) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = detect_environment();
        let log_level = get_log_level(&environment);

        let file_layer = match fs::create_dir_all(log_dir) {
            Ok(()) => {
                let pid = process::id();
                let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
                let file_appender = tracing_appender::rolling::never(
                    log_dir,
                    format!("{environment}.{pid}.{timestamp}.log"),
                );
                Some(tracing_appender::non_blocking(file_appender))
            }
            Err(e) => {
                eprintln!("Failed to create log directory {}: {e}", log_dir.display());
                None
            }
        };

        let (file_writer, guard) = match file_layer {
            Some((writer, guard)) => (Some(writer), Some(guard)),
            None => (None, None),
        };

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(env_filter(&log_level)),
            )
            .with(file_writer.map(|writer| {
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(env_filter(&log_level))
            }));

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            log_level = %log_level,
            file_output = guard.is_some(),
            "🔧 STRUCTURED LOGGING: Initialized"
        );

        guard
    });
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Log level for an environment name
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log the outcome of one query execution
pub fn log_query_operation(
    query: &str,
    status: &str,
    attempts: u32,
    duration: Duration,
    details: Option<&str>,
) {
    tracing::info!(
        query = %query,
        status = %status,
        attempts = attempts,
        duration_ms = duration.as_millis() as u64,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "💾 QUERY_OPERATION"
    );
}

/// Warn about a query slower than the configured threshold
pub fn log_slow_query(query: &str, duration: Duration, threshold: Duration) {
    tracing::warn!(
        query = %query,
        duration_ms = duration.as_millis() as u64,
        threshold_ms = threshold.as_millis() as u64,
        timestamp = %Utc::now().to_rfc3339(),
        "🐢 SLOW_QUERY"
    );
}

/// Log a pool lifecycle transition
pub fn log_pool_event(event: &str, target: &str, details: Option<&str>) {
    tracing::debug!(
        event = %event,
        target_db = %target,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🏊 POOL_EVENT"
    );
}
