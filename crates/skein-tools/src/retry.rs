use std::future::Future;
use std::time::Duration;

use tracing::debug;

use skein_core::config::{BackoffKind, RetryConfig};
use skein_core::error::{Result, SkeinError};

/// Wraps a single operation with bounded retries and backoff.
///
/// Only errors whose display text contains one of the configured
/// retryable substrings are retried; anything else is terminal on the
/// first failure. Exhausting `max_retries` re-throws the last error.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub base_delay: Duration,
    pub retryable: Vec<String>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.backoff,
            base_delay: Duration::from_millis(config.base_delay_ms),
            retryable: config.retryable_errors.clone(),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffKind::Exponential,
            base_delay: Duration::from_millis(1000),
            retryable: Vec::new(),
        }
    }

    /// Delay before retry number `attempt + 1` (attempt is 0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Linear => self.base_delay * (attempt + 1),
            BackoffKind::Exponential => self.base_delay * 2u32.saturating_pow(attempt),
        }
    }

    /// Whether an error is transient under this policy.
    pub fn is_retryable(&self, err: &SkeinError) -> bool {
        let text = err.to_string().to_lowercase();
        self.retryable
            .iter()
            .any(|marker| text.contains(&marker.to_lowercase()))
    }

    /// Run `op` with this policy. `op` receives the 0-based attempt index.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_retries || !self.is_retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
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
    use tokio::time::Instant;

    fn policy(backoff: BackoffKind, max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff,
            base_delay: Duration::from_millis(1000),
            retryable: vec!["timeout".into(), "connection".into()],
        }
    }

    fn transient() -> SkeinError {
        SkeinError::ToolExecution {
            tool: "t".into(),
            message: "connection reset".into(),
        }
    }

    #[test]
    fn exponential_delays() {
        let p = policy(BackoffKind::Exponential, 3);
        assert_eq!(p.delay_for(0), Duration::from_millis(1000));
        assert_eq!(p.delay_for(1), Duration::from_millis(2000));
        assert_eq!(p.delay_for(2), Duration::from_millis(4000));
    }

    #[test]
    fn linear_delays() {
        let p = policy(BackoffKind::Linear, 3);
        assert_eq!(p.delay_for(0), Duration::from_millis(1000));
        assert_eq!(p.delay_for(1), Duration::from_millis(2000));
        assert_eq!(p.delay_for(2), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let p = policy(BackoffKind::Exponential, 3);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = p
            .run(move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_rethrows_last_error() {
        let p = policy(BackoffKind::Exponential, 3);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let start = Instant::now();
        let result: Result<()> = p
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(result.is_err());
        // Initial call + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1000 + 2000 + 4000 ms of backoff elapsed on the paused clock
        assert_eq!(start.elapsed(), Duration::from_millis(7000));
    }

    #[tokio::test]
    async fn non_retryable_short_circuits() {
        let p = policy(BackoffKind::Exponential, 3);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<()> = p
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SkeinError::SchemaValidation("bad input".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(SkeinError::SchemaValidation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retries_policy() {
        let p = RetryPolicy::none();
        let result: Result<()> = p.run(|_| async { Err(transient()) }).await;
        assert!(result.is_err());
    }
}
