//! In-memory storage driver for testing and ephemeral deployments

use crate::stream::{self, ByteStream};
use crate::{
    Capabilities, PutOptions, RequestScope, Result, StorageDriver, StorageError, TenantNamespace,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

/// One stored object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// Object content
    pub data: Bytes,
    /// Options given at write time
    pub options: PutOptions,
}

/// An in-memory storage driver
///
/// Clones share the same underlying map.
#[derive(Clone)]
pub struct MemoryDriver {
    name: String,
    namespace: TenantNamespace,
    objects: Arc<DashMap<String, StoredObject>>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// Create a new empty driver named `memory`
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Create a new empty driver with a custom name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: TenantNamespace::default(),
            objects: Arc::new(DashMap::new()),
        }
    }

    /// Use a specific tenant namespace
    pub fn with_namespace(mut self, namespace: TenantNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    /// Get the number of objects stored (all tenants)
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check if the driver is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Get total size of all objects
    pub fn total_size(&self) -> u64 {
        self.objects.iter().map(|entry| entry.value().data.len() as u64).sum()
    }

    /// Raw namespaced keys (all tenants)
    pub fn raw_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Stored object with its options, as seen by `scope`
    pub fn stored(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<Option<StoredObject>> {
        let key = self.namespace.object_key(scope, container, artifact)?;
        Ok(self.objects.get(&key).map(|entry| entry.value().clone()))
    }

    /// Clear all objects
    pub fn clear(&self) {
        self.objects.clear();
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        scope.check()?;
        let key = self.namespace.object_key(scope, container, artifact)?;
        self.objects
            .get(&key)
            .map(|entry| stream::from_bytes(entry.value().data.clone()))
            .ok_or_else(|| StorageError::not_found(container, artifact))
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        let key = self.namespace.object_key(scope, container, artifact)?;
        let data = scope.run(stream::collect(body)).await?;
        self.objects.insert(
            key,
            StoredObject {
                data,
                options: options.clone(),
            },
        );
        Ok(())
    }

    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        scope.check()?;
        let key = self.namespace.object_key(scope, container, artifact)?;
        self.objects.remove(&key);
        Ok(())
    }

    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        scope.check()?;
        let container_prefix = self.namespace.container_prefix(scope, container)?;
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter_map(|entry| {
                TenantNamespace::strip(&container_prefix, entry.key())
                    .filter(|artifact| artifact.starts_with(prefix))
                    .map(str::to_string)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        scope.check()?;
        let key = self.namespace.object_key(scope, container, artifact)?;
        Ok(self.objects.contains_key(&key))
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        scope.check()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            user_metadata: true,
            content_headers: true,
            streaming_upload: false,
            server_side_listing: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TenantId;

    fn scope(tenant: &str) -> RequestScope {
        RequestScope::for_tenant(TenantId::new(tenant).unwrap())
    }

    #[tokio::test]
    async fn test_memory_driver_basic() {
        let driver = MemoryDriver::new();
        let s = scope("t1");

        driver
            .put(&s, "photos", "a.jpg", stream::from_bytes("Hello, World!"), &PutOptions::default())
            .await
            .unwrap();

        assert!(driver.exists(&s, "photos", "a.jpg").await.unwrap());
        let data = stream::collect(driver.get(&s, "photos", "a.jpg").await.unwrap()).await.unwrap();
        assert_eq!(data.as_ref(), b"Hello, World!");
        assert_eq!(driver.raw_keys(), vec!["t-t1/photos/a.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_driver_not_found() {
        let driver = MemoryDriver::new();
        let result = driver.get(&scope("t1"), "photos", "missing").await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_memory_driver_delete_is_idempotent() {
        let driver = MemoryDriver::new();
        let s = scope("t1");
        driver
            .put(&s, "c", "a", stream::from_bytes("x"), &PutOptions::default())
            .await
            .unwrap();
        driver.delete(&s, "c", "a").await.unwrap();
        driver.delete(&s, "c", "a").await.unwrap();
        assert!(!driver.exists(&s, "c", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_driver_tenant_isolation() {
        let driver = MemoryDriver::new();
        let (t1, t2) = (scope("t1"), scope("t2"));

        driver
            .put(&t1, "photos", "a.jpg", stream::from_bytes("one"), &PutOptions::default())
            .await
            .unwrap();
        driver
            .put(&t2, "photos", "a.jpg", stream::from_bytes("two"), &PutOptions::default())
            .await
            .unwrap();

        let one = stream::collect(driver.get(&t1, "photos", "a.jpg").await.unwrap()).await.unwrap();
        let two = stream::collect(driver.get(&t2, "photos", "a.jpg").await.unwrap()).await.unwrap();
        assert_eq!(one.as_ref(), b"one");
        assert_eq!(two.as_ref(), b"two");
        assert_eq!(driver.list(&t1, "photos", "").await.unwrap(), vec!["a.jpg"]);
        assert_eq!(driver.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_driver_list_prefix() {
        let driver = MemoryDriver::new();
        let s = scope("t1");
        for key in ["2024/a", "2024/b", "2025/c"] {
            driver
                .put(&s, "logs", key, stream::from_bytes("x"), &PutOptions::default())
                .await
                .unwrap();
        }
        driver
            .put(&s, "other", "2024/z", stream::from_bytes("x"), &PutOptions::default())
            .await
            .unwrap();

        assert_eq!(driver.list(&s, "logs", "2024/").await.unwrap(), vec!["2024/a", "2024/b"]);
        assert_eq!(driver.list(&s, "logs", "").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_memory_driver_keeps_options() {
        let driver = MemoryDriver::new();
        let s = scope("t1");
        let options = PutOptions::default()
            .with_content_type("image/jpeg")
            .with_metadata("camera", "x100");
        driver
            .put(&s, "photos", "a.jpg", stream::from_bytes("x"), &options)
            .await
            .unwrap();

        let stored = driver.stored(&s, "photos", "a.jpg").unwrap().unwrap();
        assert_eq!(stored.options, options);
    }
}
