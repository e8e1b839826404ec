use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::graphql::client::{ApiError, ApiErrorKind};

pub const MAX_ATTEMPTS: u32 = 18;

const RATE_LIMIT_DELAY: Duration = Duration::from_secs(5);
const QUOTA_DELAY: Duration = Duration::from_secs(20 * 60);
const UNCLASSIFIED_CEILING: Duration = Duration::from_secs(2 * 60 * 60);

/// Bounded retry with classified backoff around remote API calls.
///
/// The delay is a pure function of the failure kind and the attempt number,
/// so the schedule is testable without sleeping through it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Delay before retrying after the given failed attempt (1-based).
    pub fn delay_for(attempt: u32, error: &ApiError) -> Duration {
        match error.kind() {
            ApiErrorKind::RateLimited => RATE_LIMIT_DELAY,
            ApiErrorKind::QuotaExhausted => QUOTA_DELAY,
            ApiErrorKind::Unclassified => match attempt {
                0..=3 => Duration::from_secs(5 * u64::from(attempt)),
                4..=6 => Duration::from_secs(60 * u64::from(attempt)),
                _ => UNCLASSIFIED_CEILING,
            },
        }
    }

    /// Run `op` until it succeeds, attempts are exhausted, or `cancel` fires
    /// during a backoff wait.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.max_attempts {
                        tracing::error!(error = %error, attempt, "api call failed, attempts exhausted");
                        return Err(error.into());
                    }
                    let delay = Self::delay_for(attempt, &error);
                    tracing::warn!(
                        error = %error,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "api call failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn graphql_error(kind: ApiErrorKind) -> ApiError {
        ApiError::Graphql {
            kind,
            message: "boom".into(),
            extensions: None,
        }
    }

    #[test]
    fn rate_limited_delay_is_flat() {
        let err = graphql_error(ApiErrorKind::RateLimited);
        for attempt in [1, 5, 17] {
            assert_eq!(RetryPolicy::delay_for(attempt, &err), Duration::from_secs(5));
        }
    }

    #[test]
    fn quota_delay_is_twenty_minutes() {
        let err = graphql_error(ApiErrorKind::QuotaExhausted);
        assert_eq!(
            RetryPolicy::delay_for(1, &err),
            Duration::from_secs(20 * 60)
        );
    }

    #[test]
    fn unclassified_delay_escalates() {
        let err = graphql_error(ApiErrorKind::Unclassified);
        assert_eq!(RetryPolicy::delay_for(1, &err), Duration::from_secs(5));
        assert_eq!(RetryPolicy::delay_for(2, &err), Duration::from_secs(10));
        assert_eq!(RetryPolicy::delay_for(3, &err), Duration::from_secs(15));
        assert_eq!(RetryPolicy::delay_for(4, &err), Duration::from_secs(240));
        assert_eq!(RetryPolicy::delay_for(5, &err), Duration::from_secs(300));
        assert_eq!(RetryPolicy::delay_for(6, &err), Duration::from_secs(360));
        assert_eq!(
            RetryPolicy::delay_for(7, &err),
            Duration::from_secs(2 * 60 * 60)
        );
        assert_eq!(
            RetryPolicy::delay_for(17, &err),
            Duration::from_secs(2 * 60 * 60)
        );
    }

    #[tokio::test]
    async fn run_returns_first_success() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default();
        let result = policy.run(&cancel, || async { Ok::<_, ApiError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_after_classified_delay() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = policy
            .run(&cancel, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(graphql_error(ApiErrorKind::RateLimited))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn run_gives_up_after_max_attempts() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(3);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run(&cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(graphql_error(ApiErrorKind::RateLimited)) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Api(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_stops_waiting_on_cancellation() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default();

        let waiter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waiter.cancel();
        });

        // Quota backoff is 20 minutes; cancellation must cut it short.
        let result: Result<(), _> = policy
            .run(&cancel, || async {
                Err(graphql_error(ApiErrorKind::QuotaExhausted))
            })
            .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
