//! # Query Execution
//!
//! - [`query_executor`] - [`QueryExecutor`] and per-call [`QueryOptions`]
//! - [`retry`] - Exponential backoff schedule
//! - [`invocation`] - State of one call across its tries

pub mod invocation;
pub mod query_executor;
pub mod retry;

pub use invocation::QueryInvocation;
pub use query_executor::{QueryExecutor, QueryOptions};
pub use retry::RetryPolicy;
