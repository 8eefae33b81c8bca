//! Transparent gzip compression of stored payloads
//!
//! Stored bytes are framed as `CNZ1` + codec byte + payload. Objects without
//! the frame (written before compression was enabled, or by other tools) are
//! returned untouched.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use conduit_storage::stream::{self, ByteStream};
use conduit_storage::{
    Capabilities, PutOptions, RequestScope, Result, StorageDriver, StorageError,
    DEFAULT_CHUNK_SIZE,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::trace;

/// Frame marker
pub const MAGIC: &[u8; 4] = b"CNZ1";

const HEADER_LEN: usize = MAGIC.len() + 1;

/// Codec byte following the marker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Codec {
    /// Payload stored as is
    Stored = 0,
    Gzip = 1,
}

impl Codec {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Codec::Stored),
            1 => Some(Codec::Gzip),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Smaller payloads are stored uncompressed
    pub min_size_bytes: usize,
    /// gzip level, 0-9
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size_bytes: 1024,
            level: 6,
        }
    }
}

fn frame(codec: Codec, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_slice(MAGIC);
    out.put_u8(codec as u8);
    out.put_slice(payload);
    out.freeze()
}

/// Encode a payload for storage
///
/// Compresses when the payload is at least `min_size_bytes` and gzip makes it
/// smaller. Raw payloads that happen to start with the marker are framed as
/// [`Codec::Stored`] so they read back unchanged.
pub fn encode(data: Bytes, config: &CompressionConfig) -> Result<Bytes> {
    if data.len() >= config.min_size_bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(config.level.min(9)));
        encoder.write_all(&data)?;
        let compressed = encoder.finish()?;
        if compressed.len() + HEADER_LEN < data.len() {
            trace!(raw = data.len(), compressed = compressed.len(), "storing gzip frame");
            return Ok(frame(Codec::Gzip, &compressed));
        }
    }
    if data.starts_with(MAGIC) {
        return Ok(frame(Codec::Stored, &data));
    }
    Ok(data)
}

/// Decode stored bytes back to the original payload
pub fn decode(stored: Bytes) -> Result<Bytes> {
    if stored.len() < HEADER_LEN || !stored.starts_with(MAGIC) {
        return Ok(stored);
    }
    match Codec::from_byte(stored[MAGIC.len()]) {
        Some(Codec::Stored) => Ok(stored.slice(HEADER_LEN..)),
        Some(Codec::Gzip) => {
            let mut out = Vec::new();
            GzDecoder::new(&stored[HEADER_LEN..]).read_to_end(&mut out)?;
            Ok(Bytes::from(out))
        }
        None => Err(StorageError::Serialization(format!(
            "unknown compression codec {}",
            stored[MAGIC.len()]
        ))),
    }
}

/// Compressing wrapper
///
/// Payloads are buffered in both directions; compression runs on the blocking
/// pool.
pub struct CompressionDriver<D> {
    inner: D,
    config: CompressionConfig,
}

impl<D: StorageDriver> CompressionDriver<D> {
    pub fn new(inner: D, config: CompressionConfig) -> Self {
        Self { inner, config }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
}

#[async_trait]
impl<D: StorageDriver> StorageDriver for CompressionDriver<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        let body = self.inner.get(scope, container, artifact).await?;
        let stored = scope.run(stream::collect(body)).await?;
        let data = blocking(move || decode(stored)).await?;
        Ok(stream::chunked(data, DEFAULT_CHUNK_SIZE))
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        let data = scope.run(stream::collect(body)).await?;
        let config = self.config.clone();
        let stored = blocking(move || encode(data, &config)).await?;
        self.inner
            .put(scope, container, artifact, stream::chunked(stored, DEFAULT_CHUNK_SIZE), options)
            .await
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
        Capabilities {
            streaming_upload: false,
            ..self.inner.capabilities()
        }
    }
}
