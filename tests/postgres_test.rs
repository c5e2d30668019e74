//! PostgreSQL integration tests. Require `DATABASE_URL`; run with `cargo test -- --ignored`.

use resilient_db::config::{PoolConfig, ResilientDbConfig};
use resilient_db::error::{DbError, DbErrorKind, QueryError};
use resilient_db::executor::{QueryExecutor, QueryOptions};
use std::env;

fn executor() -> QueryExecutor {
    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let config = ResilientDbConfig::with_pool(PoolConfig {
        max_connections: 2,
        query_timeout_ms: 3_000,
        ..PoolConfig::default()
    });
    QueryExecutor::from_config(config, &database_url).expect("executor")
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn test_health_check_against_postgres() {
    let executor = executor();
    assert!(executor.health_check().await);
    assert_eq!(executor.metrics().active_connections, 0);
    executor.close().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn test_session_guards_applied() {
    let executor = executor();
    let settings = executor
        .execute(
            "show_guards",
            |conn| {
                Box::pin(async move {
                    let statement: String = sqlx::query_scalar("SHOW statement_timeout")
                        .fetch_one(&mut *conn)
                        .await?;
                    let lock: String = sqlx::query_scalar("SHOW lock_timeout")
                        .fetch_one(&mut *conn)
                        .await?;
                    Ok::<_, DbError>((statement, lock))
                })
            },
            QueryOptions::new(),
        )
        .await
        .expect("query succeeds");

    assert_eq!(settings.0, "3s");
    assert_eq!(settings.1, "1s");
    executor.close().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn test_transaction_rolls_back_on_constraint_violation() {
    let executor = executor();
    let err = executor
        .execute(
            "temp_table_violation",
            |conn| {
                Box::pin(async move {
                    sqlx::query("CREATE TEMP TABLE guard_check (id INT PRIMARY KEY)")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("INSERT INTO guard_check VALUES (1), (1)")
                        .execute(&mut *conn)
                        .await?;
                    Ok::<_, DbError>(())
                })
            },
            QueryOptions::transactional(),
        )
        .await
        .unwrap_err();

    match err {
        QueryError::TerminalQuery { source, .. } => {
            assert_eq!(source.kind(), DbErrorKind::ConstraintViolation);
            assert_eq!(source.code(), Some("23505"));
        }
        other => panic!("expected TerminalQuery, got {other:?}"),
    }
    executor.close().await;
}

#[test]
fn test_invalid_database_url_rejected() {
    let err = QueryExecutor::from_config(ResilientDbConfig::default(), "not a url").unwrap_err();
    assert!(matches!(err, QueryError::Configuration(_)));
}
