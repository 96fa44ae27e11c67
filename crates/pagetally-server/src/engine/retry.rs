//! Bounded retry around optimistic shared-store transactions.

use std::future::Future;

use pagetally_core::config::RetryPolicy;
use pagetally_core::error::StoreError;
use pagetally_core::store::StoreResult;

#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Done(T),
    /// Every attempt lost a write race.
    Exhausted,
    /// The store failed with something other than a conflict.
    Failed(StoreError),
}

/// Run `attempt` until it succeeds, fails hard, or the policy's budget of
/// conflicts is spent.
///
/// Conflicts retry immediately up to `policy.burst` times, then the loop
/// sleeps `policy.pause` and starts a new burst. After `policy.max_pauses`
/// pauses the loop gives up.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut burst = 0u32;
    let mut pauses = 0u32;
    loop {
        burst += 1;
        if burst > policy.burst {
            if pauses >= policy.max_pauses {
                return RetryOutcome::Exhausted;
            }
            tokio::time::sleep(policy.pause).await;
            pauses += 1;
            burst = 1;
        }
        match attempt().await {
            Ok(value) => return RetryOutcome::Done(value),
            Err(StoreError::Conflict) => continue,
            Err(e) => return RetryOutcome::Failed(e),
        }
    }
}
