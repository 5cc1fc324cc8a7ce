//! Backoff for idempotent calls made outside the reconcile loop's own retry
//!
//! Reconcile failures are retried by the controller's error policy. Two kinds
//! of calls need a tighter loop: reads from the remote suggestion service
//! made in the middle of a pass, and installing the CRDs at start up before
//! any controller runs.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff schedule for a retried call
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts before giving up, 0 retries forever
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Short schedule for remote reads inside a reconcile pass
    ///
    /// Anything longer belongs to the controller's requeue.
    pub fn remote() -> Self {
        Self {
            max_attempts: 3,
            max_delay: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Unbounded schedule for start up, where nothing can proceed without success
    pub fn startup() -> Self {
        Self::default()
    }
}

/// Retry `operation` with jittered exponential backoff until it succeeds
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(config, operation_name, |_| true, operation).await
}

/// Retry `operation` while `should_retry` accepts its error
///
/// Errors the predicate rejects are returned immediately, as is the last
/// error once `max_attempts` is reached.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            return Err(e);
        }
        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "giving up after repeated failures"
            );
            return Err(e);
        }

        let jittered = delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = jittered.as_millis(),
            "retrying"
        );
        tokio::time::sleep(jittered).await;

        delay = delay
            .mul_f64(config.backoff_multiplier)
            .min(config.max_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    fn counting(
        count: &Arc<AtomicU32>,
        fail_first: u32,
        error: &'static str,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, &'static str>> + Send>>
    {
        let count = count.clone();
        move || {
            let count = count.clone();
            Box::pin(async move {
                let n = count.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    Err(error)
                } else {
                    Ok(n)
                }
            })
        }
    }

    #[tokio::test]
    async fn test_first_success_is_returned() {
        let count = Arc::new(AtomicU32::new(0));
        let result = retry_with_backoff(&fast(3), "op", counting(&count, 0, "x")).await;
        assert_eq!(result, Ok(0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    /// Story: the remote server drops a connection, the next attempt succeeds
    #[tokio::test]
    async fn story_transient_failures_are_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let result = retry_with_backoff(&fast(5), "op", counting(&count, 2, "reset")).await;
        assert_eq!(result, Ok(2));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_last_error_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let result = retry_with_backoff(&fast(3), "op", counting(&count, 10, "down")).await;
        assert_eq!(result, Err("down"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    /// Story: a 404 from the remote server will not change by asking again
    #[tokio::test]
    async fn story_rejected_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let result = retry_if(
            &fast(5),
            "op",
            |e: &&str| *e != "not found",
            counting(&count, 10, "not found"),
        )
        .await;
        assert_eq!(result, Err("not found"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remote_schedule_is_bounded() {
        let config = RetryConfig::remote();
        assert_eq!(config.max_attempts, 3);
        assert!(config.max_delay <= Duration::from_secs(2));
        assert_eq!(RetryConfig::startup().max_attempts, 0);
    }
}
