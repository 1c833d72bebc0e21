use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Bounded retry with exponential backoff for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single store call.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): the capped exponential
    /// step, jittered down by up to half.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let step = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_delay);
        let ceiling = step.as_millis() as u64;
        if ceiling == 0 {
            return step;
        }
        Duration::from_millis(rand::rng().random_range(ceiling / 2..=ceiling))
    }
}

/// Runs `attempt` until it succeeds, fails permanently, or exhausts the
/// policy. Only `Error::Transient` is retried; exhaustion becomes
/// `Error::Unavailable`.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, op: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Err(Error::Transient(detail)) => {
                if retries >= policy.max_retries {
                    warn!("{} gave up after {} retries: {}", op, retries, detail);
                    return Err(Error::Unavailable(format!("{}: {}", op, detail)));
                }
                let delay = policy.delay_for(retries);
                debug!("{} transient failure ({}), retrying in {:?}", op, detail, delay);
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            other => return other,
        }
    }
}
