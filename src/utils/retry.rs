use crate::core::config::LlmConfig;
use crate::core::error::PipelineError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(retry_count: usize, delay_seconds: u64) -> Self {
        let base_delay = Duration::from_secs(delay_seconds);
        Self {
            max_retries: retry_count as u32,
            base_delay,
            max_delay: base_delay.saturating_mul(8),
            backoff_multiplier: 2.0,
        }
    }

    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self::new(cfg.retry_count, cfg.retry_delay_seconds)
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay`
    /// plus up to 10% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let millis = (self.base_delay.as_millis() as f64 * multiplier) as u64;
        let delay = Duration::from_millis(millis).min(self.max_delay);
        let jitter_cap = delay.as_millis() as u64 / 10;
        if jitter_cap == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_cap))
    }
}

/// Runs `fut`, mapping an elapsed deadline to [`PipelineError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout {
            seconds: limit.as_secs(),
        }),
    }
}
