use anyhow::anyhow;
use tracing::error;

use accord_db::{Database, is_transient};

use crate::Engine;
use crate::error::{Error, Result};
use crate::retry::with_backoff;

impl Engine {
    /// Runs an idempotent store call on the blocking pool, bounded by the
    /// configured timeout and retried on transient failures.
    pub(crate) async fn store<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(&Database) -> anyhow::Result<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let policy = &self.inner.config.retry;
        with_backoff(policy, op, || self.store_attempt(op, f.clone())).await
    }

    /// Single attempt for writes that must not be replayed blindly.
    pub(crate) async fn store_once<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match self.store_attempt(op, f).await {
            Err(Error::Transient(detail)) => Err(Error::Unavailable(format!("{}: {}", op, detail))),
            other => other,
        }
    }

    async fn store_attempt<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        let timeout = self.inner.config.retry.timeout;
        let task = tokio::task::spawn_blocking(move || f(&db));

        match tokio::time::timeout(timeout, task).await {
            Err(_) => Err(Error::Transient(format!("{} timed out after {:?}", op, timeout))),
            Ok(Err(join)) => {
                error!("spawn_blocking join error in {}: {}", op, join);
                Err(Error::Internal(anyhow!("{} did not complete: {}", op, join)))
            }
            Ok(Ok(Err(e))) if is_transient(&e) => Err(Error::Transient(format!("{}: {}", op, e))),
            Ok(Ok(Err(e))) => Err(Error::Internal(e.context(op))),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }
}
