//! Fault-injecting driver shared by the wrapper tests

use async_trait::async_trait;
use conduit_storage::{
    ByteStream, MemoryDriver, PutOptions, RequestScope, Result, StorageDriver, StorageError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Memory-backed driver that fails on demand
pub(crate) struct FlakyDriver {
    name: String,
    pub(crate) inner: MemoryDriver,
    failures_left: AtomicUsize,
    down: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyDriver {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: MemoryDriver::named(name),
            failures_left: AtomicUsize::new(0),
            down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` data calls
    pub(crate) fn failing(name: &str, n: usize) -> Self {
        let driver = Self::new(name);
        driver.failures_left.store(n, Ordering::SeqCst);
        driver
    }

    /// Fail every call, health checks included
    pub(crate) fn down(name: &str) -> Self {
        let driver = Self::new(name);
        driver.set_down(true);
        driver
    }

    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn inject(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = self.down.load(Ordering::SeqCst)
            || self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            return Err(StorageError::backend(&self.name, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for FlakyDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        self.inject()?;
        self.inner.get(scope, container, artifact).await
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        self.inject()?;
        self.inner.put(scope, container, artifact, body, options).await
    }

    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        self.inject()?;
        self.inner.delete(scope, container, artifact).await
    }

    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        self.inject()?;
        self.inner.list(scope, container, prefix).await
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        self.inject()?;
        self.inner.exists(scope, container, artifact).await
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::backend(&self.name, "health probe failed"));
        }
        self.inner.health_check(scope).await
    }
}
