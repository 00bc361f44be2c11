// Segment retry: fixed-delay retry loop shared by segment and key fetching.
//
// Every attempt and every wait observes the job's cancellation token.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DownloadError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Total attempts allowed, initial one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(3),
        }
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    Success(T),
    /// Failed with an error that another attempt may fix.
    Retry(DownloadError),
    /// Failed permanently.
    Fail(DownloadError),
}

impl<T> RetryAction<T> {
    /// Classify a result with [`DownloadError::is_retryable`].
    pub fn from_result(result: Result<T, DownloadError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) if e.is_retryable() => Self::Retry(e),
            Err(e) => Self::Fail(e),
        }
    }
}

/// How a retry loop ended without success.
#[derive(Debug)]
pub struct RetryFailure {
    /// Attempts made, initial one included.
    pub attempts: u32,
    /// Whether the loop stopped because attempts ran out.
    pub exhausted: bool,
    pub error: DownloadError,
}

/// Execute `operation` until it succeeds, fails permanently, or the policy
/// runs out of attempts.
///
/// `operation` receives the 0-indexed attempt number. `on_retry` is called
/// with the upcoming retry number (1-based) and the error that caused it,
/// before the delay starts.
pub async fn retry_with_delay<F, Fut, T, R>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut on_retry: R,
    operation: F,
) -> Result<T, RetryFailure>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
    R: FnMut(u32, &DownloadError),
{
    let cancelled = |attempts| RetryFailure {
        attempts,
        exhausted: false,
        error: DownloadError::Cancelled,
    };

    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(cancelled(attempt));
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => {
                return Err(RetryFailure {
                    attempts: attempt + 1,
                    exhausted: false,
                    error: err,
                });
            }
            RetryAction::Retry(err) => err,
        };

        if err.is_cancelled() || token.is_cancelled() {
            return Err(cancelled(attempt + 1));
        }
        if attempt >= policy.max_retries {
            return Err(RetryFailure {
                attempts: attempt + 1,
                exhausted: true,
                error: err,
            });
        }

        attempt += 1;
        warn!(
            attempt,
            max = policy.max_retries,
            delay_ms = policy.delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        on_retry(attempt, &err);

        tokio::select! {
            _ = token.cancelled() => return Err(cancelled(attempt)),
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request, body read, and decode errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let token = CancellationToken::new();
        let result = retry_with_delay(&policy(3), &token, |_, _| {}, |_| async {
            RetryAction::Success(42u32)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_retries_plus_one() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let retries = Mutex::new(Vec::new());
        let started = tokio::time::Instant::now();

        let failure = retry_with_delay(
            &policy(3),
            &token,
            |n, _| retries.lock().unwrap().push(n),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    RetryAction::<()>::Retry(DownloadError::transient("http://a/1.ts", "HTTP 503"))
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.attempts, 4);
        assert!(failure.exhausted);
        assert!(matches!(failure.error, DownloadError::TransientFetch { .. }));
        assert_eq!(*retries.lock().unwrap(), vec![1, 2, 3]);
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let token = CancellationToken::new();
        let result = retry_with_delay(&policy(3), &token, |_, _| {}, |attempt| async move {
            if attempt < 2 {
                RetryAction::Retry(DownloadError::transient("http://a", "reset"))
            } else {
                RetryAction::Success(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let failure = retry_with_delay(&policy(5), &token, |_, _| {}, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { RetryAction::<()>::Fail(DownloadError::configuration("bad")) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!failure.exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });
        let failure = retry_with_delay(&policy(10), &token, |_, _| {}, |_| async {
            RetryAction::<()>::Retry(DownloadError::transient("http://a", "timeout"))
        })
        .await
        .unwrap_err();
        assert!(failure.error.is_cancelled());
        assert!(!failure.exhausted);
    }

    #[test]
    fn classifies_results() {
        assert!(matches!(
            RetryAction::from_result(Err::<(), _>(DownloadError::transient("u", "r"))),
            RetryAction::Retry(_)
        ));
        assert!(matches!(
            RetryAction::from_result(Err::<(), _>(DownloadError::Cancelled)),
            RetryAction::Fail(_)
        ));
        assert!(matches!(
            RetryAction::from_result(Ok::<_, DownloadError>(1)),
            RetryAction::Success(1)
        ));
    }
}
