//! Per-call state carried through the retry loop.

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

/// One call to `execute`, alive until its terminal outcome.
#[derive(Debug, Clone)]
pub struct QueryInvocation {
    pub id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub use_transaction: bool,
    /// Tries left after the current one
    pub attempts_remaining: u32,
    /// 1-based number of the current try
    pub attempt: u32,
    start: Instant,
}

impl QueryInvocation {
    pub fn new(name: &str, use_transaction: bool, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            started_at: Utc::now(),
            use_transaction,
            attempts_remaining: max_attempts,
            attempt: 0,
            start: Instant::now(),
        }
    }

    /// Move to the next try. Returns `false` once the budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        if self.attempts_remaining == 0 {
            return false;
        }
        self.attempts_remaining -= 1;
        self.attempt += 1;
        true
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts_remaining > 0
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
