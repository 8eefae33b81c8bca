//! Retry with exponential backoff and jitter

use async_trait::async_trait;
use conduit_storage::stream::{self, ByteStream};
use conduit_storage::{
    Capabilities, PutOptions, RequestScope, Result, StorageDriver, DEFAULT_CHUNK_SIZE,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Immutable retry settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,
    /// Cap on any single delay (milliseconds)
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Scale each delay by a random factor in [0.5, 1.5]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based)
    ///
    /// `min(max_delay, initial_delay * multiplier^(retry - 1))`
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `retry`, jittered when enabled
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if !self.jitter {
            return base;
        }
        base.mul_f64(rand::thread_rng().gen_range(0.5..=1.5))
    }

    /// Run `f` until it succeeds, fails with a non-transient error, or
    /// `max_attempts` is reached
    ///
    /// Backoff waits are abandoned as soon as the scope is cancelled.
    pub async fn execute<T, F, Fut>(&self, scope: &RequestScope, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            scope.check()?;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() || attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay(attempt);
                    debug!(
                        request_id = %scope.request_id(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    scope
                        .run(async {
                            tokio::time::sleep(delay).await;
                            Ok(())
                        })
                        .await?;
                    attempt += 1;
                }
            }
        }
    }
}

/// Driver wrapper retrying transient failures
///
/// Put bodies are buffered once and replayed on every attempt. Callers whose
/// writes are not idempotent turn write retries off with
/// [`RetryDriver::without_write_retries`].
pub struct RetryDriver<D> {
    inner: D,
    policy: RetryPolicy,
    retry_writes: bool,
}

impl<D: StorageDriver> RetryDriver<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            retry_writes: true,
        }
    }

    /// Send every put exactly once
    pub fn without_write_retries(mut self) -> Self {
        self.retry_writes = false;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<D: StorageDriver> StorageDriver for RetryDriver<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        self.policy
            .execute(scope, || self.inner.get(scope, container, artifact))
            .await
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        if !self.retry_writes || self.policy.max_attempts <= 1 {
            return self.inner.put(scope, container, artifact, body, options).await;
        }
        let data = scope.run(stream::collect(body)).await?;
        self.policy
            .execute(scope, || {
                let body = stream::chunked(data.clone(), DEFAULT_CHUNK_SIZE);
                self.inner.put(scope, container, artifact, body, options)
            })
            .await
    }

    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        self.policy
            .execute(scope, || self.inner.delete(scope, container, artifact))
            .await
    }

    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        self.policy
            .execute(scope, || self.inner.list(scope, container, prefix))
            .await
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        self.policy
            .execute(scope, || self.inner.exists(scope, container, artifact))
            .await
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        self.policy.execute(scope, || self.inner.health_check(scope)).await
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}
