//! Retrying Transaction Helper
//!
//! Optimistic locking means losers: a conflicting concurrent update fails
//! with [`RepoError::ConcurrencyConflict`] and must be retried in a fresh
//! scope. `run_in_txn` does that with bounded attempts and a jittered delay
//! that grows with the attempt count. Only transient errors retry; anything
//! else aborts immediately.

use crate::error::RepoError;
use crate::txn::TxnContext;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const MAX_RETRIES: u32 = 100;
const MIN_RETRY_WAIT_MS: u64 = 200;
const MAX_RETRY_WAIT_MS: u64 = 1000;
const RETRY_WAIT_INCREMENT_MS: u64 = 100;

/// Execute `body` inside a transaction scope, committing on success and
/// rolling back and retrying on concurrency conflicts (up to 100 attempts).
///
/// # Examples
///
/// ```rust,no_run
/// # use strata_core::txn::run_in_txn;
/// # use strata_core::services::NodeService;
/// # use strata_core::models::{Node, PropValue};
/// # async fn example(service: &NodeService, id: &str) -> Result<(), strata_core::error::RepoError> {
/// run_in_txn(false, |txn| async move {
///     service.set_property(&txn, id, "hits", Some(PropValue::Int(1))).await
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_in_txn<T, F, Fut>(read_only: bool, body: F) -> Result<T, RepoError>
where
    F: Fn(Arc<TxnContext>) -> Fut,
    Fut: Future<Output = Result<T, RepoError>>,
{
    let mut last = None;
    for attempt in 0..MAX_RETRIES {
        let txn = Arc::new(if read_only {
            TxnContext::read_only()
        } else {
            TxnContext::read_write()
        });
        match body(Arc::clone(&txn)).await {
            Ok(value) => {
                txn.commit();
                return Ok(value);
            }
            Err(e) => {
                txn.rollback();
                if !e.is_transient() {
                    return Err(e);
                }
                tracing::debug!(attempt, error = %e, "retrying transaction");
                last = Some(e);
                tokio::time::sleep(delay(attempt)).await;
            }
        }
    }
    Err(last.unwrap_or_else(|| RepoError::conflict("retries exhausted")))
}

fn delay(attempt: u32) -> Duration {
    let mut rng = rand::thread_rng();
    let spread = if attempt > 0 {
        u64::from(attempt) * RETRY_WAIT_INCREMENT_MS
    } else {
        MIN_RETRY_WAIT_MS
    };
    let mut interval = MIN_RETRY_WAIT_MS + rng.gen_range(0..spread);
    if interval >= MAX_RETRY_WAIT_MS {
        interval = MAX_RETRY_WAIT_MS - rng.gen_range(0..MIN_RETRY_WAIT_MS);
    }
    Duration::from_millis(interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn returns_value_on_first_success() {
        let result = run_in_txn(true, |_txn| async { Ok::<_, RepoError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let attempts = AtomicUsize::new(0);
        let result = run_in_txn(false, |_txn| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RepoError::conflict("try again"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn aborts_on_permanent_errors() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = run_in_txn(false, |_txn| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RepoError::invalid_argument("bad")) }
        })
        .await;
        assert!(matches!(result, Err(RepoError::InvalidArgument(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_stays_within_bounds() {
        for attempt in 0..50 {
            let d = delay(attempt).as_millis() as u64;
            assert!(d >= MIN_RETRY_WAIT_MS);
            assert!(d <= MAX_RETRY_WAIT_MS);
        }
    }
}
