//! Exponential backoff with jitter for the transient errors named in the
//! error handling design: Kafka/JetStream publish, JetStream pull, and
//! ClickHouse insert.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Exponential backoff with jitter, capped at 5s, shared by every retry
/// helper in this module.
fn backoff_delay_ms(attempt: u32) -> u64 {
    let base_delay_ms = 50u64.saturating_mul(1u64 << attempt.min(16));
    let jitter = rand::thread_rng().gen_range(0..=base_delay_ms / 2 + 1);
    (base_delay_ms + jitter).min(5_000)
}

/// Retry an idempotent operation with exponential backoff and jitter, up to
/// `attempts` tries. Returns the last error if every attempt fails.
///
/// Backoff respects `shutdown`: a sleep between attempts is cut short if the
/// token is cancelled, and the retry loop returns the last error immediately
/// rather than keep spinning during shutdown.
pub async fn retry_with_backoff<F, Fut, T, E>(
    attempts: u32,
    shutdown: &CancellationToken,
    f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(attempts, shutdown, f, |_| true).await
}

/// Like [`retry_with_backoff`], but `should_retry` decides per-error whether
/// another attempt is worth making at all. An error for which it returns
/// `false` is returned immediately, with no backoff sleep and no further
/// attempts — for errors that are fatal rather than transient (§7: a
/// ClickHouse rejection must surface right away, not after 5 wasted
/// attempts).
pub async fn retry_with_backoff_if<F, Fut, T, E>(
    attempts: u32,
    shutdown: &CancellationToken,
    mut f: F,
    should_retry: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_error = None;

    for attempt in 0..attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }

                tracing::debug!(attempt, error = %e, "retryable operation failed");
                last_error = Some(e);

                if attempt + 1 < attempts {
                    let delay_ms = backoff_delay_ms(attempt);

                    tokio::select! {
                        _ = sleep(Duration::from_millis(delay_ms)) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }
    }

    Err(last_error.expect("loop runs at least once"))
}

/// Unbounded retry with the same backoff shape, used by the ingester's
/// publish loop (§4.1: "up to an unbounded retry budget"). Only returns once
/// `f` succeeds or `shutdown` is cancelled.
pub async fn retry_forever<F, Fut, T, E>(shutdown: &CancellationToken, mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(result) => return Some(result),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "transient error, retrying");
                let delay_ms = backoff_delay_ms(attempt);

                tokio::select! {
                    _ = sleep(Duration::from_millis(delay_ms)) => {}
                    _ = shutdown.cancelled() => return None,
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retry_succeeds_on_third_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let token = CancellationToken::new();

        let result: Result<&str, &str> = retry_with_backoff(5, &token, || {
            let c = c.clone();
            async move {
                let count = c.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err("boom")
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts() {
        let token = CancellationToken::new();
        let result: Result<(), &str> = retry_with_backoff(3, &token, || async { Err("always fails") }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn retry_forever_returns_none_on_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Option<()> = retry_forever(&token, || async { Err::<(), _>("down") }).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn retry_with_backoff_if_stops_immediately_on_non_retryable_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let token = CancellationToken::new();

        let result: Result<(), &str> = retry_with_backoff_if(
            5,
            &token,
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            },
            |_| false,
        )
        .await;

        assert_eq!(result.unwrap_err(), "fatal");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
