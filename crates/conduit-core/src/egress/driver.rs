//! Metering wrapper charging reads against the quota and tracker

use super::{BandwidthQuota, EgressTracker};
use async_trait::async_trait;
use conduit_storage::stream::ByteStream;
use conduit_storage::{
    Capabilities, PutOptions, RequestScope, Result, StorageDriver, StorageError, TenantNamespace,
};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// Charges every chunk of every `get` stream to the caller's tenant
///
/// A tenant with nothing left is rejected before the backend is read. A
/// chunk the quota rejects is never delivered; the stream ends with
/// `QuotaExceeded` instead. Writes and metadata calls are not metered.
pub struct EgressDriver<D> {
    inner: D,
    namespace: TenantNamespace,
    quota: Arc<BandwidthQuota>,
    tracker: Arc<EgressTracker>,
}

impl<D: StorageDriver> EgressDriver<D> {
    pub fn new(
        inner: D,
        namespace: TenantNamespace,
        quota: Arc<BandwidthQuota>,
        tracker: Arc<EgressTracker>,
    ) -> Self {
        Self {
            inner,
            namespace,
            quota,
            tracker,
        }
    }

    pub fn quota(&self) -> &Arc<BandwidthQuota> {
        &self.quota
    }

    pub fn tracker(&self) -> &Arc<EgressTracker> {
        &self.tracker
    }
}

#[async_trait]
impl<D: StorageDriver> StorageDriver for EgressDriver<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        let tenant = self.namespace.resolve(scope)?;
        if self.quota.remaining(&tenant) == 0 {
            debug!(%tenant, container, artifact, "egress quota exhausted, read refused");
            return Err(StorageError::QuotaExceeded {
                tenant: tenant.to_string(),
                requested: 0,
                remaining: 0,
            });
        }
        let body = self.inner.get(scope, container, artifact).await?;

        let quota = Arc::clone(&self.quota);
        let tracker = Arc::clone(&self.tracker);
        let metered = stream::unfold(Some(body), move |body| {
            let quota = Arc::clone(&quota);
            let tracker = Arc::clone(&tracker);
            let tenant = tenant.clone();
            async move {
                let mut body = body?;
                let chunk = match body.next().await? {
                    Ok(chunk) => chunk,
                    Err(e) => return Some((Err(e), None)),
                };
                let len = chunk.len() as u64;
                match quota.allow_egress(&tenant, len) {
                    Ok(()) => {
                        tracker.record(&tenant, len);
                        Some((Ok(chunk), Some(body)))
                    }
                    Err(e) => {
                        warn!(%tenant, bytes = len, "egress quota exhausted mid-stream");
                        Some((Err(e), None))
                    }
                }
            }
        });
        Ok(metered.boxed())
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
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
