//! Integration tests for query execution: retries, transactions, metrics and cancellation

mod common;

use common::{mock_executor, mock_executor_with, LogCapture};
use futures::future::BoxFuture;
use resilient_db::error::{DbError, DbErrorKind, QueryError};
use resilient_db::executor::QueryOptions;
use resilient_db::test_helpers::{test_config, MockConnection};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_successful_call_updates_metrics_and_releases_connection() {
    let (_manager, executor) = mock_executor();
    let before = executor.metrics();

    let id = executor
        .execute(
            "load_roster",
            |conn| Box::pin(async move { Ok(conn.id) }),
            QueryOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(id, 1);

    let after = executor.metrics();
    assert_eq!(after.total_queries, before.total_queries + 1);
    assert_eq!(after.active_connections, before.active_connections);
    assert_eq!(after.errors, 0);
    assert_eq!(after.pool_status.idle_count, 1);
}

#[tokio::test]
async fn test_transient_failure_exhausts_retry_attempts() {
    let (_manager, executor) = mock_executor();
    let calls = Arc::new(AtomicU32::new(0));
    let policy = executor.retry_policy();
    let attempts = executor.config().pool.retry_attempts;

    let started = Instant::now();
    let err = executor
        .execute(
            "flaky_lookup",
            {
                let calls = Arc::clone(&calls);
                move |_conn| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Err::<(), _>(DbError::from_message("read ECONNRESET")) })
                }
            },
            QueryOptions::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), attempts);
    assert!(started.elapsed() >= policy.total_delay(attempts));
    match err {
        QueryError::TransientConnection {
            query,
            attempts: reported,
            source,
        } => {
            assert_eq!(query, "flaky_lookup");
            assert_eq!(reported, attempts);
            assert_eq!(source.kind(), DbErrorKind::ConnectionReset);
        }
        other => panic!("expected TransientConnection, got {other:?}"),
    }

    let metrics = executor.metrics();
    assert_eq!(metrics.total_queries, 1);
    assert_eq!(metrics.errors, u64::from(attempts));
    assert_eq!(metrics.active_connections, 0);
}

#[tokio::test]
async fn test_terminal_failure_is_attempted_once() {
    let (_manager, executor) = mock_executor();
    let calls = Arc::new(AtomicU32::new(0));

    let err = executor
        .execute(
            "create_athlete",
            {
                let calls = Arc::clone(&calls);
                move |_conn| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async {
                        Err::<(), _>(DbError::from_sqlstate(
                            "23505",
                            "duplicate key value violates unique constraint",
                        ))
                    })
                }
            },
            QueryOptions::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        err,
        QueryError::TerminalQuery { ref source, .. } if source.kind() == DbErrorKind::ConstraintViolation
    ));
    assert_eq!(executor.metrics().errors, 1);
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let (_manager, executor) = mock_executor();
    let calls = Arc::new(AtomicU32::new(0));

    let value = executor
        .execute(
            "eventually_ok",
            {
                let calls = Arc::clone(&calls);
                move |_conn| {
                    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Box::pin(async move {
                        if call < 3 {
                            Err(DbError::from_sqlstate("40001", "could not serialize access"))
                        } else {
                            Ok(call)
                        }
                    })
                }
            },
            QueryOptions::transactional(),
        )
        .await
        .unwrap();

    assert_eq!(value, 3);
    let metrics = executor.metrics();
    assert_eq!(metrics.total_queries, 1);
    assert_eq!(metrics.errors, 2);
}

#[tokio::test]
async fn test_slow_query_is_counted_and_logged() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let (_manager, executor) = mock_executor();

    executor
        .execute(
            "slow_report",
            |_conn| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(120)).await;
                    Ok(())
                })
            },
            QueryOptions::new(),
        )
        .await
        .unwrap();

    let metrics = executor.metrics();
    assert_eq!(metrics.slow_queries, 1);
    assert!(metrics.avg_query_time_ms >= 120.0);

    let output = logs.contents();
    assert!(output.contains("SLOW_QUERY"), "missing warning in: {output}");
    assert!(output.contains("slow_report"));
    assert!(output.contains("duration_ms="));

    let recent = executor.metrics_collector().recent_slow_queries();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].query, "slow_report");
}

#[tokio::test]
async fn test_slow_attempts_are_counted_per_attempt() {
    let (_manager, executor) = mock_executor();
    let calls = Arc::new(AtomicU32::new(0));

    executor
        .execute(
            "slow_then_retried",
            {
                let calls = Arc::clone(&calls);
                move |_conn| {
                    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(120)).await;
                        if call == 1 {
                            Err(DbError::from_sqlstate("40001", "could not serialize access"))
                        } else {
                            Ok(())
                        }
                    })
                }
            },
            QueryOptions::new(),
        )
        .await
        .unwrap();

    // One call, two slow attempts: both are counted and both feed the average
    let metrics = executor.metrics();
    assert_eq!(metrics.total_queries, 1);
    assert_eq!(metrics.errors, 1);
    assert_eq!(metrics.slow_queries, 2);
    assert!(metrics.avg_query_time_ms >= 120.0);
    assert_eq!(executor.metrics_collector().recent_slow_queries().len(), 2);
}

#[tokio::test]
async fn test_fast_query_is_not_slow() {
    let (_manager, executor) = mock_executor();
    executor
        .execute("quick", |_conn| Box::pin(async { Ok(()) }), QueryOptions::new())
        .await
        .unwrap();
    assert_eq!(executor.metrics().slow_queries, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_never_see_total_below_completed() {
    let (_manager, executor) = mock_executor();
    let executor = Arc::new(executor);
    let completed = Arc::new(AtomicU64::new(0));
    let done = CancellationToken::new();

    let reader = {
        let executor = Arc::clone(&executor);
        let completed = Arc::clone(&completed);
        let done = done.clone();
        tokio::spawn(async move {
            let mut observations = 0u64;
            while !done.is_cancelled() {
                let finished = completed.load(Ordering::SeqCst);
                let total = executor.metrics().total_queries;
                assert!(
                    total >= finished,
                    "total_queries {total} below completed calls {finished}"
                );
                observations += 1;
                tokio::task::yield_now().await;
            }
            observations
        })
    };

    let mut workers = Vec::new();
    for worker in 0..8 {
        let executor = Arc::clone(&executor);
        let completed = Arc::clone(&completed);
        workers.push(tokio::spawn(async move {
            for i in 0..25 {
                executor
                    .execute(
                        &format!("worker_{worker}_{i}"),
                        |_conn| Box::pin(async { Ok(()) }),
                        QueryOptions::new(),
                    )
                    .await
                    .unwrap();
                completed.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }
    done.cancel();

    assert!(reader.await.unwrap() > 0);
    assert_eq!(executor.metrics().total_queries, 200);
    assert_eq!(executor.metrics().active_connections, 0);
}

#[tokio::test]
async fn test_cancellation_during_operation_is_terminal() {
    let (manager, executor) = mock_executor();
    let token = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        })
    };

    let started = Instant::now();
    let err = executor
        .execute(
            "long_running",
            {
                let calls = Arc::clone(&calls);
                move |_conn| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    })
                }
            },
            QueryOptions::transactional().with_cancellation(token),
        )
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, QueryError::Cancelled { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Abandoned mid-transaction: the connection is closed, never reused
    let status = executor.pool().status();
    assert_eq!(status.total_count, 0);
    assert_eq!(status.idle_count, 0);
    assert_eq!(manager.stats().commits, 0);
    assert_eq!(executor.metrics().active_connections, 0);
}

#[tokio::test]
async fn test_cancellation_during_backoff() {
    let mut config = test_config();
    config.retry.base_delay_ms = 2_000;
    config.retry.max_delay_ms = 2_000;
    let (_manager, executor) = mock_executor_with(config);
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        })
    };

    let started = Instant::now();
    let err = executor
        .execute(
            "backoff_cancel",
            |_conn| Box::pin(async { Err::<(), _>(DbError::from_message("connection refused")) }),
            QueryOptions::new().with_cancellation(token),
        )
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, QueryError::Cancelled { ref reason, .. } if reason.contains("cancelled")));
    // The refused attempt and the cancellation are both counted
    assert_eq!(executor.metrics().errors, 2);
}

#[tokio::test]
async fn test_already_cancelled_token_skips_acquire() {
    let (manager, executor) = mock_executor();
    let token = CancellationToken::new();
    token.cancel();

    let err = executor
        .execute(
            "never_runs",
            |_conn| Box::pin(async { Ok(()) }),
            QueryOptions::new().with_cancellation(token),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, QueryError::Cancelled { .. }));
    assert_eq!(manager.stats().connects, 0);
}

#[tokio::test]
async fn test_deadline_exceeded() {
    let (_manager, executor) = mock_executor();

    let err = executor
        .execute(
            "deadline",
            |_conn| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                })
            },
            QueryOptions::new().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        QueryError::Cancelled { ref reason, .. } if reason == "deadline exceeded"
    ));
}

fn exploding_handler(_conn: &mut MockConnection) -> BoxFuture<'_, Result<(), DbError>> {
    Box::pin(async {
        let broken = true;
        if broken {
            panic!("handler bug");
        }
        Ok(())
    })
}

#[tokio::test]
async fn test_panic_rolls_back_and_propagates() {
    let (manager, executor) = mock_executor();
    let executor = Arc::new(executor);

    let handle = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            executor
                .execute(
                    "explodes",
                    exploding_handler,
                    QueryOptions::transactional(),
                )
                .await
        })
    };

    let join_error = handle.await.unwrap_err();
    assert!(join_error.is_panic());

    let stats = manager.stats();
    assert_eq!(stats.begins, 1);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.commits, 0);

    let metrics = executor.metrics();
    assert_eq!(metrics.active_connections, 0);
    assert_eq!(metrics.errors, 1);
    assert_eq!(metrics.pool_status.total_count, 0);
}

#[tokio::test]
async fn test_commit_failure_is_reported() {
    let (manager, executor) = mock_executor();
    manager.set_commit_failure(Some(DbError::from_sqlstate(
        "23503",
        "insert or update violates foreign key constraint",
    )));

    let err = executor
        .execute(
            "deferred_fk",
            |_conn| Box::pin(async { Ok(()) }),
            QueryOptions::transactional(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, QueryError::TerminalQuery { .. }));
    assert_eq!(manager.stats().rollbacks, 1);
}
