use onio_core::config::DispatchConfig;
use onio_core::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bounded exponential backoff for recoverable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `3` means up to four invocations.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            config.task_retry_limit,
            config.task_retry_delay(),
            config.retry_max_delay(),
        )
    }

    /// Delay before retry `n` (1-based): `min(base * 2^(n-1), max)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails non-recoverably, or retries run out.
    /// `op` receives the zero-based attempt number.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_counted(cancel, op).await.0
    }

    /// Like [`execute`](Self::execute), also returning how many invocations were made.
    pub async fn execute_counted<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                let delay = self.delay_for(attempt);
                warn!(
                    attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after recoverable failure"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return (Err(Error::Cancelled("cancelled during retry backoff".to_string())), attempt);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = op(attempt).await;
            attempt += 1;
            match result {
                Ok(v) => {
                    if attempt > 1 {
                        info!(attempts = attempt, "Succeeded after retry");
                    }
                    return (Ok(v), attempt);
                }
                Err(e) if e.is_recoverable() && attempt <= self.max_retries => {
                    warn!(error = %e, attempt, max_retries = self.max_retries, "Attempt failed");
                }
                Err(e) => {
                    if e.is_recoverable() {
                        warn!(error = %e, retries = self.max_retries, "Failed after all retries");
                    }
                    return (Err(e), attempt);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(100), Duration::from_millis(350))
    }

    #[test]
    fn test_delay_schedule_is_capped() {
        let p = policy(5);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_three_means_four_invocations() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let (result, attempts) = policy(3)
            .execute_counted(&CancellationToken::new(), move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::recoverable("upstream 503"))
                }
            })
            .await;
        assert!(result.unwrap_err().is_recoverable());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_elapsed_time() {
        let start = tokio::time::Instant::now();
        let _ = policy(3)
            .execute(&CancellationToken::new(), |_| async {
                Err::<(), _>(Error::recoverable("busy"))
            })
            .await;
        // 100 + 200 + 350
        assert_eq!(start.elapsed(), Duration::from_millis(650));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_second_attempt() {
        let out = policy(3)
            .execute(&CancellationToken::new(), |attempt| async move {
                if attempt == 0 {
                    Err(Error::recoverable("flaky"))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = policy(3)
            .execute(&CancellationToken::new(), move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::Validation("bad expression".into()))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_backoff() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let (result, attempts) = RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(60))
            .execute_counted(&cancel, move |_| {
                let c = c.clone();
                async move {
                    c.cancel();
                    Err::<(), _>(Error::recoverable("down"))
                }
            })
            .await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert_eq!(attempts, 1);
    }
}
