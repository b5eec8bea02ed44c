//! Bounded retry for optimistic-concurrency conflicts.
//!
//! Every read-modify-write sequence against the Kubernetes API (defaulting,
//! finalizer bookkeeping, annotation stamping, status updates, pod labeling)
//! races with other writers and can lose with a 409. Those sequences are
//! wrapped here: re-read and re-apply with bounded attempts, then surface.

use crate::error::{OperatorError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default attempt budget for conflict-retried writes
pub const DEFAULT_CONFLICT_RETRIES: usize = 4;

/// Base delay between conflict retries; grows linearly with the attempt
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// attempt budget is exhausted. The closure must perform its own re-read so
/// each attempt operates on a fresh resource version.
pub async fn with_conflict_retry<T, F, Fut>(max_attempts: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                debug!(attempt, max_attempts, "write conflict, retrying");
                tokio::time::sleep(RETRY_BASE_DELAY * attempt as u32).await;
            }
            Err(e) if e.is_conflict() => {
                return Err(OperatorError::ReconcileFailed(format!(
                    "write conflict persisted after {} attempts: {}",
                    attempt, e
                )))
            }
            other => return other,
        }
    }
}
