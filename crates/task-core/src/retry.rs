use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Error;

/// Retries a transient-I/O operation with capped exponential backoff and
/// jitter (spec.md §7: "max 3 attempts, max 1s"). `is_retryable` decides
/// whether a given error is worth retrying at all; non-retryable errors
/// return immediately on the first attempt.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    max_delay: Duration,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts || !err.retryable() => return Err(err),
            Err(_) => {
                let base_ms = 50u64.saturating_mul(1u64 << (attempt - 1));
                let jitter_ms = rand::thread_rng().gen_range(0..=base_ms.max(1));
                let delay = Duration::from_millis(base_ms + jitter_ms).min(max_delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(3, Duration::from_millis(100), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(Error::Unavailable("transient".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> =
            retry_with_backoff(3, Duration::from_millis(100), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("bad input".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
