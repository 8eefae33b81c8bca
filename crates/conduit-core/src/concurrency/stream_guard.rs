//! Counting semaphore over logical streams

use async_trait::async_trait;
use conduit_storage::stream::{self, ByteStream};
use conduit_storage::{
    Capabilities, PutOptions, RequestScope, Result, StorageDriver, StorageError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamGuardConfig {
    /// Streams allowed open at once
    pub max_streams: usize,
}

impl Default for StreamGuardConfig {
    fn default() -> Self {
        Self { max_streams: 64 }
    }
}

/// Limits simultaneously checked-out streams
#[derive(Clone)]
pub struct StreamGuard {
    permits: Arc<Semaphore>,
    max_streams: usize,
}

/// One checked-out stream slot, released on drop
#[derive(Debug)]
pub struct StreamPermit {
    _permit: OwnedSemaphorePermit,
}

impl StreamGuard {
    pub fn new(max_streams: usize) -> Self {
        let max_streams = max_streams.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_streams)),
            max_streams,
        }
    }

    /// Wait (cancellably) for a free slot
    pub async fn acquire(&self, scope: &RequestScope) -> Result<StreamPermit> {
        let permits = Arc::clone(&self.permits);
        let permit = scope
            .run(async move { permits.acquire_owned().await.map_err(|_| StorageError::Shutdown) })
            .await?;
        Ok(StreamPermit { _permit: permit })
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<StreamPermit> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| StreamPermit { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.max_streams - self.available()
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }
}

/// Wrapper holding a stream slot for the life of each get stream and for
/// the duration of each put
pub struct GuardedDriver<D> {
    inner: D,
    guard: StreamGuard,
}

impl<D: StorageDriver> GuardedDriver<D> {
    pub fn new(inner: D, guard: StreamGuard) -> Self {
        Self { inner, guard }
    }

    pub fn guard(&self) -> &StreamGuard {
        &self.guard
    }
}

#[async_trait]
impl<D: StorageDriver> StorageDriver for GuardedDriver<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        let permit = self.guard.acquire(scope).await?;
        trace!(in_use = self.guard.in_use(), "stream slot acquired");
        let body = self.inner.get(scope, container, artifact).await?;
        Ok(stream::with_guard(body, permit))
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        let _permit = self.guard.acquire(scope).await?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_storage::MemoryDriver;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let guard = StreamGuard::new(1);
        let scope = RequestScope::new();
        let held = guard.acquire(&scope).await.unwrap();

        let mut waiter = task::spawn(guard.acquire(&scope));
        assert_pending!(waiter.poll());
        drop(held);
        assert!(waiter.is_woken());
        let _permit = assert_ready_ok!(waiter.poll());
        assert_eq!(guard.available(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_acquire() {
        let guard = StreamGuard::new(1);
        let _held = guard.try_acquire().unwrap();
        let (scope, handle) = RequestScope::new().cancellable();

        let mut waiter = task::spawn(guard.acquire(&scope));
        assert_pending!(waiter.poll());
        handle.cancel();
        assert!(matches!(waiter.poll(), std::task::Poll::Ready(Err(StorageError::Cancelled))));
    }

    #[tokio::test]
    async fn test_get_stream_holds_slot_until_dropped() {
        let inner = MemoryDriver::new();
        let scope = RequestScope::for_tenant("t1".parse().unwrap());
        inner
            .put(&scope, "c", "a", stream::from_bytes("x"), &PutOptions::default())
            .await
            .unwrap();
        let driver = GuardedDriver::new(inner, StreamGuard::new(2));

        let first = driver.get(&scope, "c", "a").await.unwrap();
        let second = driver.get(&scope, "c", "a").await.unwrap();
        assert_eq!(driver.guard().in_use(), 2);
        assert!(driver.guard().try_acquire().is_none());

        drop(first);
        assert_eq!(driver.guard().in_use(), 1);
        assert_eq!(stream::collect(second).await.unwrap().as_ref(), b"x");
        assert_eq!(driver.guard().in_use(), 0);
    }

    #[tokio::test]
    async fn test_failed_get_releases_slot() {
        let driver = GuardedDriver::new(MemoryDriver::new(), StreamGuard::new(1));
        let scope = RequestScope::for_tenant("t1".parse().unwrap());
        assert!(driver.get(&scope, "c", "missing").await.is_err());
        assert_eq!(driver.guard().available(), 1);
    }
}
