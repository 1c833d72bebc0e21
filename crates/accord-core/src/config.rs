use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::retry::RetryPolicy;

/// Engine tuning, read from `ACCORD_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Soft cache window for coalesced friend and member reads.
    pub read_cache_ttl: Duration,
    pub reconcile_interval: Duration,
    /// Most messages returned by one history read.
    pub history_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            read_cache_ttl: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(60),
            history_limit: 200,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            retry: RetryPolicy {
                max_retries: env_or("ACCORD_STORE_RETRIES", defaults.retry.max_retries)?,
                timeout: Duration::from_millis(env_or(
                    "ACCORD_STORE_TIMEOUT_MS",
                    defaults.retry.timeout.as_millis() as u64,
                )?),
                ..defaults.retry
            },
            read_cache_ttl: Duration::from_secs(env_or(
                "ACCORD_READ_CACHE_SECS",
                defaults.read_cache_ttl.as_secs(),
            )?),
            reconcile_interval: Duration::from_secs(env_or(
                "ACCORD_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval.as_secs(),
            )?),
            history_limit: defaults.history_limit,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}
