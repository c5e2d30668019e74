//! # Graceful Shutdown
//!
//! [`ShutdownCoordinator`] turns SIGTERM/SIGINT into one bounded drain of the
//! connection pool. Background tasks such as the health monitor watch the
//! coordinator's [`CancellationToken`] and stop when it fires.

use crate::config::ShutdownConfig;
use crate::database::{ConnectionManager, ConnectionPool, DrainOutcome};
use crate::executor::QueryExecutor;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Something that can stop accepting work and wait for in-flight work to finish.
#[async_trait]
pub trait Drainable: Send + Sync {
    async fn drain(&self, timeout: Duration) -> DrainOutcome;
}

#[async_trait]
impl<M: ConnectionManager> Drainable for ConnectionPool<M> {
    async fn drain(&self, timeout: Duration) -> DrainOutcome {
        self.close(timeout).await
    }
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    drain_timeout: Duration,
    target: Arc<dyn Drainable>,
    outcome: OnceCell<DrainOutcome>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("drain_timeout", &self.drain_timeout)
            .field("shutting_down", &self.token.is_cancelled())
            .field("outcome", &self.outcome.get())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new(target: Arc<dyn Drainable>, config: &ShutdownConfig) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout: config.drain_timeout(),
            target,
            outcome: OnceCell::new(),
        }
    }

    /// Coordinate shutdown of an executor's pool with its configured drain timeout.
    pub fn for_executor<M: ConnectionManager>(executor: &QueryExecutor<M>) -> Self {
        Self::new(
            Arc::new(executor.pool().clone()),
            &executor.config().shutdown,
        )
    }

    /// Cancelled once shutdown starts. Queries given this token through
    /// `QueryOptions::with_cancellation` are abandoned instead of drained.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drain and close the pool. Concurrent and repeated calls share the
    /// outcome of the first one.
    pub async fn shutdown(&self) -> DrainOutcome {
        self.token.cancel();
        *self
            .outcome
            .get_or_init(|| async {
                info!(
                    drain_timeout_ms = self.drain_timeout.as_millis() as u64,
                    "🛑 Initiating graceful shutdown"
                );
                let outcome = self.target.drain(self.drain_timeout).await;
                match outcome {
                    DrainOutcome::TimedOut { outstanding, .. } => warn!(
                        outstanding,
                        "⚠️ Shutdown drain timed out; remaining connections close on return"
                    ),
                    _ => info!(?outcome, "✅ Graceful shutdown complete"),
                }
                outcome
            })
            .await
    }

    /// Wait for SIGTERM/SIGINT (or a programmatic [`shutdown`](Self::shutdown))
    /// and then drain.
    pub async fn run_until_signal(&self) -> DrainOutcome {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("🛑 Shutdown signal received, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                info!("Shutdown requested");
            }
        }
        self.shutdown().await
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
