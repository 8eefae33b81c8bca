//! Bandwidth throttling with a token bucket keyed by bytes

use async_trait::async_trait;
use bytes::Bytes;
use conduit_storage::stream::ByteStream;
use conduit_storage::{Capabilities, PutOptions, RequestScope, Result, StorageDriver, StorageError};
use futures::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::trace;

/// Token bucket settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Sustained throughput
    pub bytes_per_second: u32,
    /// Bucket size; 0 means one second worth of tokens
    pub burst_bytes: u32,
    /// Also throttle the streams returned by `get`
    pub throttle_reads: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: 10 * 1024 * 1024,
            burst_bytes: 0,
            throttle_reads: false,
        }
    }
}

impl ThrottleConfig {
    fn quota(&self) -> Result<(Quota, NonZeroU32)> {
        let rate = NonZeroU32::new(self.bytes_per_second)
            .ok_or_else(|| StorageError::Configuration("throttle bytes_per_second must be positive".into()))?;
        let burst = NonZeroU32::new(self.burst_bytes).unwrap_or(rate);
        Ok((Quota::per_second(rate).allow_burst(burst), burst))
    }
}

/// Shared byte limiter
#[derive(Clone)]
pub struct Throttle {
    limiter: Arc<DefaultDirectRateLimiter>,
    burst: NonZeroU32,
}

impl Throttle {
    pub fn new(config: &ThrottleConfig) -> Result<Self> {
        let (quota, burst) = config.quota()?;
        Ok(Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            burst,
        })
    }

    /// Wait until `bytes` tokens have been taken from the bucket
    ///
    /// Large amounts are taken in burst-sized steps. Returns early with the
    /// scope's error if it is cancelled.
    pub async fn acquire(&self, scope: &RequestScope, bytes: usize) -> Result<()> {
        let mut remaining = bytes;
        while remaining > 0 {
            let step = remaining.min(self.burst.get() as usize);
            let n = NonZeroU32::new(step as u32).unwrap_or(NonZeroU32::MIN);
            scope
                .run(async {
                    self.limiter
                        .until_n_ready(n)
                        .await
                        .map_err(|e| StorageError::Configuration(e.to_string()))
                })
                .await?;
            remaining -= step;
        }
        Ok(())
    }

    /// Pace `body` through the bucket chunk by chunk
    pub fn pace(&self, scope: &RequestScope, body: ByteStream) -> ByteStream {
        let throttle = self.clone();
        let scope = scope.clone();
        body.then(move |chunk| {
            let throttle = throttle.clone();
            let scope = scope.clone();
            async move {
                let chunk: Bytes = chunk?;
                trace!(bytes = chunk.len(), "waiting for throttle tokens");
                throttle.acquire(&scope, chunk.len()).await?;
                Ok(chunk)
            }
        })
        .boxed()
    }
}

/// Driver wrapper bounding sustained upload (and optionally download)
/// throughput
///
/// The payload is never buffered: each chunk waits for tokens as it is pulled
/// by the wrapped driver.
pub struct ThrottledDriver<D> {
    inner: D,
    throttle: Throttle,
    throttle_reads: bool,
}

impl<D: StorageDriver> ThrottledDriver<D> {
    pub fn new(inner: D, config: &ThrottleConfig) -> Result<Self> {
        Ok(Self {
            inner,
            throttle: Throttle::new(config)?,
            throttle_reads: config.throttle_reads,
        })
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }
}

#[async_trait]
impl<D: StorageDriver> StorageDriver for ThrottledDriver<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        let body = self.inner.get(scope, container, artifact).await?;
        if self.throttle_reads {
            Ok(self.throttle.pace(scope, body))
        } else {
            Ok(body)
        }
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        let body = self.throttle.pace(scope, body);
        self.inner.put(scope, container, artifact, body, options).await
    }

    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        self.inner.delete(scope, container, artifact).await
    }

    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(scope, container, prefix).await
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        self.inner.exists(scope, container, artifact).await
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        self.inner.health_check(scope).await
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}
