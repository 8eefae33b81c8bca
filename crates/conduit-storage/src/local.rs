//! Local filesystem driver
//!
//! Objects live at `{root}/t-{tenant}/{container}/{artifact}`. Writes go to
//! a temp file under `{root}/.staging`, outside every tenant prefix, and are
//! renamed into place, so readers never observe a partial object. Reads are served
//! through a [`HandlePool`] that bounds open file handles.

use crate::handles::HandlePool;
use crate::stream::{self, ByteStream};
use crate::{
    Capabilities, PutOptions, RequestScope, Result, StorageDriver, StorageError, TenantNamespace,
    DEFAULT_CHUNK_SIZE,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Directory under the root that holds in-flight writes
pub const STAGING_DIR: &str = ".staging";

/// Local driver settings
#[derive(Clone, Debug)]
pub struct LocalConfig {
    /// Directory holding all tenants
    pub root: PathBuf,
    /// Maximum files open for reading at once
    pub max_open_handles: usize,
    /// Size of each pooled read buffer
    pub read_buffer_size: usize,
}

impl LocalConfig {
    /// Defaults rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_open_handles: 256,
            read_buffer_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Filesystem-backed driver
pub struct LocalDriver {
    name: String,
    config: LocalConfig,
    namespace: TenantNamespace,
    handles: HandlePool,
}

impl LocalDriver {
    /// Create a driver; the root directory is created lazily
    pub fn new(config: LocalConfig) -> Self {
        let handles = HandlePool::new(config.max_open_handles, config.read_buffer_size);
        Self {
            name: "local".to_string(),
            config,
            namespace: TenantNamespace::default(),
            handles,
        }
    }

    /// Override the driver name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Use a specific tenant namespace
    pub fn with_namespace(mut self, namespace: TenantNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Read-handle pool
    pub fn handles(&self) -> &HandlePool {
        &self.handles
    }

    fn object_path(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<PathBuf> {
        let key = self.namespace.object_key(scope, container, artifact)?;
        Ok(self.config.root.join(key))
    }

    fn staging_path(&self) -> PathBuf {
        self.config.root.join(STAGING_DIR)
    }

    fn container_path(&self, scope: &RequestScope, container: &str) -> Result<PathBuf> {
        let prefix = self.namespace.container_prefix(scope, container)?;
        Ok(self.config.root.join(prefix.trim_end_matches('/')))
    }

    async fn write_file(path: &Path, mut body: ByteStream) -> Result<()> {
        let mut file = fs::File::create(path).await?;
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}


#[async_trait]
impl StorageDriver for LocalDriver {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, scope), fields(backend = %self.name, request_id = %scope.request_id()))]
    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        let path = self.object_path(scope, container, artifact)?;
        let lease = self.handles.acquire(scope).await?;

        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(StorageError::not_found(container, artifact));
            }
            Err(e) => return Err(e.into()),
        };
        if !file.metadata().await?.is_file() {
            return Err(StorageError::not_found(container, artifact));
        }

        let body = futures::stream::try_unfold((file, lease), |(mut file, mut lease)| async move {
            let read = file.read(lease.buffer()).await?;
            if read == 0 {
                return Ok::<_, StorageError>(None);
            }
            let chunk = Bytes::copy_from_slice(&lease.buffer()[..read]);
            Ok(Some((chunk, (file, lease))))
        });
        Ok(body.boxed())
    }

    #[instrument(skip(self, scope, body, _options), fields(backend = %self.name, request_id = %scope.request_id()))]
    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        _options: &PutOptions,
    ) -> Result<()> {
        let path = self.object_path(scope, container, artifact)?;
        scope.check()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = self.staging_path();
        fs::create_dir_all(&staging).await?;

        let tmp = staging.join(format!("{}.tmp", Uuid::new_v4().simple()));
        let written = scope.run(Self::write_file(&tmp, body)).await;
        let result = match written {
            Ok(()) => fs::rename(&tmp, &path).await.map_err(StorageError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                if cleanup.kind() != IoErrorKind::NotFound {
                    warn!(path = %tmp.display(), error = %cleanup, "failed to remove temp file");
                }
            }
            debug!(error = %e, "local write aborted");
        }
        result
    }

    #[instrument(skip(self, scope), fields(backend = %self.name, request_id = %scope.request_id()))]
    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        let path = self.object_path(scope, container, artifact)?;
        scope.check()?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, scope), fields(backend = %self.name, request_id = %scope.request_id()))]
    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        let base = self.container_path(scope, container)?;
        let mut keys = Vec::new();
        let mut pending = vec![(base, String::new())];

        while let Some((dir, relative)) = pending.pop() {
            scope.check()?;
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if relative.is_empty() {
                    name
                } else {
                    format!("{}/{}", relative, name)
                };
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if file_type.is_file() && key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        let path = self.object_path(scope, container, artifact)?;
        scope.check()?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        scope.check()?;
        fs::create_dir_all(&self.config.root).await?;
        let meta = fs::metadata(&self.config.root).await?;
        if !meta.is_dir() {
            return Err(StorageError::backend(
                &self.name,
                format!("{} is not a directory", self.config.root.display()),
            ));
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            user_metadata: false,
            content_headers: false,
            streaming_upload: true,
            server_side_listing: false,
        }
    }
}
