//! # Conduit Storage
//!
//! The storage contract of the Conduit gateway and the adapters that speak it.
//!
//! This crate provides:
//! - **Storage contract**: the [`StorageDriver`] trait every adapter and wrapper implements
//! - **Request scope**: tenant identity, deadline and cancellation for one call
//! - **Tenant namespacing**: `t-{tenant}/{container}/{artifact}` key construction
//! - **Adapters**: in-memory, local filesystem, S3-compatible providers and Dropbox
//! - **Handle pool**: bounded, buffer-recycling read handles for the filesystem adapter
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Protocol front end / wrappers (conduit-core)  │
//! ├─────────────────────────────────────────────────────┤
//! │                 StorageDriver Trait                  │
//! ├────────────┬────────────┬────────────┬──────────────┤
//! │  Memory    │   Local    │    S3      │   Dropbox    │
//! │  Driver    │   Driver   │   Driver   │   Driver     │
//! ├────────────┴────────────┴────────────┴──────────────┤
//! │   RAM   │  filesystem  │  S3-compatible  │  drive API │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use conduit_storage::{MemoryDriver, RequestScope, StorageDriver, PutOptions, stream};
//!
//! let driver = MemoryDriver::new();
//! let scope = RequestScope::for_tenant("t1".parse()?);
//! driver.put(&scope, "photos", "a.jpg", stream::from_bytes("hello"), &PutOptions::default()).await?;
//! let data = stream::collect(driver.get(&scope, "photos", "a.jpg").await?).await?;
//! ```

pub mod dropbox;
pub mod error;
pub mod handles;
pub mod local;
pub mod memory;
pub mod options;
pub mod s3;
pub mod scope;
pub mod stream;
pub mod tenant;

pub use dropbox::{DropboxConfig, DropboxDriver};
pub use error::{ErrorKind, Result, StorageError};
pub use handles::{HandleLease, HandlePool};
pub use local::{LocalConfig, LocalDriver};
pub use memory::{MemoryDriver, StoredObject};
pub use options::PutOptions;
pub use s3::{S3Config, S3Driver, S3Provider};
pub use scope::{CancelHandle, RequestScope};
pub use stream::ByteStream;
pub use tenant::{tenant_key, TenantId, TenantNamespace, TenantPolicy};

use async_trait::async_trait;
use std::sync::Arc;

/// Default chunk size for streamed reads (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// What a backend can faithfully store beyond raw bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// User metadata (`x-amz-meta-*`) round-trips
    pub user_metadata: bool,
    /// Content-Type / Cache-Control / Content-Encoding / Content-Language round-trip
    pub content_headers: bool,
    /// Uploads are streamed to the backend without buffering the payload
    pub streaming_upload: bool,
    /// Listing is answered by the backend rather than by a local scan
    pub server_side_listing: bool,
}

/// The storage contract
///
/// Every adapter and every wrapper implements this trait with identical
/// signatures and error semantics, so wrappers nest arbitrarily. Keys are
/// namespaced per tenant by the adapters; callers only ever see
/// `(container, artifact)` pairs.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Human-readable name of this driver (used in logs and errors)
    fn name(&self) -> &str;

    /// Open an object for reading; `NotFound` if absent
    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream>;

    /// Store an object, replacing any previous content
    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()>;

    /// Remove an object; removing an absent object succeeds
    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()>;

    /// Artifact keys in `container` starting with `prefix` (unordered)
    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>>;

    /// Whether an object exists
    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool>;

    /// Cheap liveness probe of the backend
    async fn health_check(&self, scope: &RequestScope) -> Result<()>;

    /// Features this backend supports
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

#[async_trait]
impl<T: StorageDriver + ?Sized> StorageDriver for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        (**self).get(scope, container, artifact).await
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        (**self).put(scope, container, artifact, body, options).await
    }

    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        (**self).delete(scope, container, artifact).await
    }

    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        (**self).list(scope, container, prefix).await
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        (**self).exists(scope, container, artifact).await
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        (**self).health_check(scope).await
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }
}

#[async_trait]
impl<T: StorageDriver + ?Sized> StorageDriver for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        (**self).get(scope, container, artifact).await
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        (**self).put(scope, container, artifact, body, options).await
    }

    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        (**self).delete(scope, container, artifact).await
    }

    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        (**self).list(scope, container, prefix).await
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        (**self).exists(scope, container, artifact).await
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        (**self).health_check(scope).await
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }
}
