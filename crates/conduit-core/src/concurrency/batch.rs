//! Parallel batch execution with per-item results

use bytes::Bytes;
use conduit_storage::stream;
use conduit_storage::{PutOptions, RequestScope, Result, StorageDriver, StorageError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// One object of a batch write
#[derive(Clone, Debug)]
pub struct BatchPut {
    pub container: String,
    pub artifact: String,
    pub data: Bytes,
    pub options: PutOptions,
}

impl BatchPut {
    pub fn new(container: impl Into<String>, artifact: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            container: container.into(),
            artifact: artifact.into(),
            data: data.into(),
            options: PutOptions::default(),
        }
    }
}

/// Fans batches out over a bounded number of concurrent calls
///
/// Results come back in input order, one per item, so failures can be
/// matched to the operation that caused them.
pub struct BatchExecutor<D: ?Sized> {
    driver: Arc<D>,
    concurrency: usize,
}

impl<D: StorageDriver + ?Sized + 'static> BatchExecutor<D> {
    pub fn new(driver: Arc<D>, concurrency: usize) -> Self {
        Self {
            driver,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn put_all(&self, scope: &RequestScope, items: Vec<BatchPut>) -> Vec<Result<()>> {
        self.run(scope, items, |driver, scope, item| async move {
            driver
                .put(
                    &scope,
                    &item.container,
                    &item.artifact,
                    stream::from_bytes(item.data),
                    &item.options,
                )
                .await
        })
        .await
    }

    pub async fn get_all(&self, scope: &RequestScope, keys: Vec<(String, String)>) -> Vec<Result<Bytes>> {
        self.run(scope, keys, |driver, scope, (container, artifact)| async move {
            let body = driver.get(&scope, &container, &artifact).await?;
            scope.run(stream::collect(body)).await
        })
        .await
    }

    pub async fn delete_all(&self, scope: &RequestScope, keys: Vec<(String, String)>) -> Vec<Result<()>> {
        self.run(scope, keys, |driver, scope, (container, artifact)| async move {
            driver.delete(&scope, &container, &artifact).await
        })
        .await
    }

    async fn run<I, T, F, Fut>(&self, scope: &RequestScope, items: Vec<I>, op: F) -> Vec<Result<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(Arc<D>, RequestScope, I) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let total = items.len();
        let permits = Arc::new(Semaphore::new(self.concurrency));

        let handles: Vec<_> = items
            .into_iter()
            .map(|item| {
                let permits = Arc::clone(&permits);
                let call_scope = scope.clone();
                let call = op(Arc::clone(&self.driver), scope.clone(), item);
                tokio::spawn(async move {
                    let _permit = call_scope
                        .run(async move { permits.acquire_owned().await.map_err(|_| StorageError::Shutdown) })
                        .await?;
                    call_scope.run(call).await
                })
            })
            .collect();

        let mut results = Vec::with_capacity(total);
        for handle in handles {
            results.push(
                handle
                    .await
                    .unwrap_or_else(|e| Err(StorageError::Io(std::io::Error::other(e)))),
            );
        }

        let failed = results.iter().filter(|r| r.is_err()).count();
        debug!(total, failed, concurrency = self.concurrency, "batch finished");
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_storage::stream::ByteStream;
    use conduit_storage::{Capabilities, MemoryDriver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Tracks the peak number of concurrent puts
    struct Gauge {
        inner: MemoryDriver,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl StorageDriver for Gauge {
        fn name(&self) -> &str {
            "gauge"
        }

        async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
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
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            let result = self.inner.put(scope, container, artifact, body, options).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            result
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

    fn scope() -> RequestScope {
        RequestScope::for_tenant("t1".parse().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let driver = Arc::new(Gauge {
            inner: MemoryDriver::new(),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let executor = BatchExecutor::new(Arc::clone(&driver), 3);
        let items = (0..12).map(|i| BatchPut::new("c", format!("obj-{}", i), "x")).collect();

        let results = executor.put_all(&scope(), items).await;
        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(driver.peak.load(Ordering::SeqCst), 3);
        assert_eq!(driver.inner.len(), 12);
    }

    #[tokio::test]
    async fn test_results_are_indexed() {
        let driver: Arc<dyn StorageDriver> = Arc::new(MemoryDriver::new());
        let executor = BatchExecutor::new(driver, 4);
        executor
            .put_all(
                &scope(),
                vec![BatchPut::new("c", "a", "1"), BatchPut::new("c", "../bad", "2")],
            )
            .await;

        let results = executor
            .get_all(
                &scope(),
                vec![
                    ("c".into(), "a".into()),
                    ("c".into(), "missing".into()),
                    ("c".into(), "a".into()),
                ],
            )
            .await;
        assert_eq!(results[0].as_ref().unwrap().as_ref(), b"1");
        assert!(results[1].as_ref().unwrap_err().is_not_found());
        assert_eq!(results[2].as_ref().unwrap().as_ref(), b"1");

        let deleted = executor
            .delete_all(&scope(), vec![("c".into(), "a".into()), ("c".into(), "/abs".into())])
            .await;
        assert!(deleted[0].is_ok());
        assert!(matches!(deleted[1], Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_cancelled_scope_fails_every_item() {
        let executor = BatchExecutor::new(Arc::new(MemoryDriver::new()), 2);
        let (scope, handle) = scope().cancellable();
        handle.cancel();
        let results = executor
            .put_all(&scope, vec![BatchPut::new("c", "a", "1"), BatchPut::new("c", "b", "2")])
            .await;
        assert!(results.iter().all(|r| matches!(r, Err(StorageError::Cancelled))));
    }
}
