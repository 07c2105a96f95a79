use crate::error::QueryError;
use crate::models::RagConfig;
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff shared by the embedding and synthesis backends.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl From<&RagConfig> for RetryPolicy {
    fn from(value: &RagConfig) -> Self {
        Self {
            max_attempts: value.max_retries.max(1),
            base_delay: value.retry_base_delay,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run `operation`, retrying transient failures with exponential backoff.
/// Non-transient errors surface immediately; the last error surfaces once
/// attempts are exhausted.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, QueryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueryError>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(error) => return Err(error),
        }
    }
}
