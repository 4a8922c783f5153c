//! Bounded retry for read-modify-write conflicts at the ledger store

use crate::{error::SettlementError, SettlementResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for store conflicts
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first
    pub max_retries: u32,
    /// Base delay, doubled per attempt
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails with a non-conflict error, or the
    /// retry budget is spent. The last conflict is surfaced unchanged.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> SettlementResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SettlementResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(SettlementError::StoreConflict(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    debug!(operation = label, attempt, "store conflict: {}", msg);
                    tokio::time::sleep(self.backoff * 2u32.saturating_pow(attempt - 1)).await;
                }
                Err(err @ SettlementError::StoreConflict(_)) => {
                    warn!(operation = label, attempts = attempt + 1, "giving up after store conflicts");
                    return Err(err);
                }
                other => return other,
            }
        }
    }
}
