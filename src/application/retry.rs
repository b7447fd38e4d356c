//! Backoff wrapper for transient storage failures inside loops.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;

use crate::domain::models::RetryConfig;
use crate::domain::ports::StorageError;

/// Run a storage operation, retrying transient failures with exponential
/// backoff. Non-transient failures surface immediately.
pub async fn retry_storage<T, Fut, Op>(config: &RetryConfig, mut op: Op) -> Result<T, StorageError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_max_elapsed_time(Some(Duration::from_millis(
            config.max_backoff_ms.saturating_mul(u64::from(config.max_retries)),
        )))
        .build();

    backoff::future::retry(policy, || {
        let fut = op();
        async move {
            fut.await.map_err(|e| {
                if e.is_transient() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}
