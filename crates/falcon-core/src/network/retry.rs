//! Retry logic with exponential backoff and jitter.
//!
//! A timeout ends one attempt; the backoff computed here decides whether and
//! when the next attempt starts. The two are configured separately.

use crate::config::NetworkConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: NetworkConfig::MAX_RETRIES,
            base_delay: NetworkConfig::RETRY_BASE_DELAY,
            max_delay: NetworkConfig::RETRY_MAX_DELAY,
            exponential_base: NetworkConfig::RETRY_EXPONENTIAL_BASE,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry following `attempt` (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt as i32);
        let capped_secs = (self.base_delay.as_secs_f64() * multiplier).min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Factor in [0.5, 1.5) keeps the mean while avoiding near-zero delays.
            let factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_delay: Duration,
    pub success: bool,
    pub last_error: Option<String>,
}

/// Retry an async operation with exponential backoff.
///
/// Returns the final result together with [`RetryStats`].
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_async_with_hint(config, operation, should_retry, |_| None).await
}

/// Like [`retry_async`], but `delay_hint` may override the computed backoff
/// for a given error (e.g. a server-supplied `Retry-After`). The override is
/// still capped by `max_delay`.
pub async fn retry_async_with_hint<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
    delay_hint: impl Fn(&E) -> Option<Duration>,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut stats = RetryStats::default();
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;

        let err = match operation().await {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };

        stats.last_error = Some(err.to_string());

        if !should_retry(&err) {
            debug!("Error is not retryable: {}", err);
            return (Err(err), stats);
        }

        if attempt + 1 >= max_attempts {
            warn!("All {} attempts exhausted. Last error: {}", max_attempts, err);
            return (Err(err), stats);
        }

        let delay = delay_hint(&err)
            .map(|d| d.min(config.max_delay))
            .unwrap_or_else(|| config.calculate_delay(attempt));
        stats.total_delay += delay;

        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt + 1,
            max_attempts,
            err,
            delay
        );

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3))
            .with_exponential_base(2.0)
            .with_jitter(false);

        assert_eq!(config.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(config.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(config.calculate_delay(5), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(60))
            .with_exponential_base(2.0)
            .with_jitter(true);

        for _ in 0..20 {
            let delay = config.calculate_delay(0);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let (result, stats) = retry_async(
            &fast(),
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("connection reset".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(stats.attempts, 3);
        assert!(stats.success);
    }

    #[tokio::test]
    async fn test_exhausted_keeps_last_error() {
        let (result, stats) = retry_async(
            &fast(),
            || async { Err::<i32, _>("offline".to_string()) },
            |_: &String| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.last_error.as_deref(), Some("offline"));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let (result, stats) = retry_async(
            &fast(),
            || async { Err::<i32, _>("404".to_string()) },
            |e: &String| e != "404",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 1);
    }

    #[tokio::test]
    async fn test_delay_hint_is_capped() {
        let config = fast().with_max_attempts(2).with_max_delay(Duration::from_millis(20));
        let (_, stats) = retry_async_with_hint(
            &config,
            || async { Err::<(), _>("rate limited".to_string()) },
            |_: &String| true,
            |_: &String| Some(Duration::from_secs(30)),
        )
        .await;

        assert_eq!(stats.total_delay, Duration::from_millis(20));
    }
}
