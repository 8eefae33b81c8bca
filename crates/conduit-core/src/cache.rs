//! Tenant-aware LRU cache
//!
//! One recency order spans every tenant, bounded by the total size of the
//! cached payloads rather than by entry count. Keys are `(tenant, key)` pairs
//! so tenants never see each other's entries.
//!
//! Read-through fills are fenced: a fill registers a token when the read
//! starts, and any invalidation of the key in the meantime voids it, so a
//! stream that finishes after a concurrent write never caches old bytes.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use conduit_storage::stream::{self, ByteStream};
use conduit_storage::{
    Capabilities, PutOptions, RequestScope, Result, StorageDriver, TenantId, TenantNamespace,
};
use futures::StreamExt;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Cache settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total bytes of cached payloads
    pub capacity_bytes: u64,
    /// Larger objects are served but never cached by [`CachedDriver`]
    pub max_entry_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024,
            max_entry_bytes: 8 * 1024 * 1024,
        }
    }
}

type CacheKey = (TenantId, String);

/// A cached payload
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub data: Bytes,
    pub size: u64,
    pub last_access: Instant,
    pub access_count: u64,
}

/// Cache counters
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_ratio: f64,
}

struct Inner {
    entries: LruCache<CacheKey, CacheEntry>,
    /// Outstanding read-through fills, by key
    fills: HashMap<CacheKey, u64>,
    next_fill: u64,
    size: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Inner {
    fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Drop an entry and void any fill in flight for it
    fn remove(&mut self, key: &CacheKey) -> bool {
        self.fills.remove(key);
        match self.entries.pop(key) {
            Some(old) => {
                self.size -= old.size;
                true
            }
            None => false,
        }
    }
}

/// Size-bounded LRU shared by all tenants
///
/// Every tenant's entries live under one lock. Eviction picks the least
/// recently used entry across all tenants, and each lookup reorders that
/// list, so per-tenant shards would each need their own budget and could
/// no longer evict globally. Critical sections are a hash lookup and a list
/// splice; payloads are reference-counted and copied outside the lock.
pub struct TenantCache {
    capacity: u64,
    inner: Mutex<Inner>,
}

impl TenantCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity: capacity_bytes,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                fills: HashMap::new(),
                next_fill: 0,
                size: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Look up an entry, marking it most recently used
    ///
    /// The returned buffer is immutable; callers cannot alter the cached copy.
    pub fn get(&self, tenant: &TenantId, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let found = inner.entries.get_mut(&(tenant.clone(), key.to_string())).map(|entry| {
            entry.last_access = Instant::now();
            entry.access_count += 1;
            entry.data.clone()
        });
        match found {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        found
    }

    /// Insert as most recently used, evicting least recently used entries
    /// until it fits
    ///
    /// Returns `false` if the entry is larger than the whole cache.
    pub fn put(&self, tenant: &TenantId, key: &str, data: Bytes) -> bool {
        let cache_key = (tenant.clone(), key.to_string());
        let mut inner = self.inner.lock();
        self.insert(&mut inner, cache_key, data)
    }

    /// Register a read-through fill of `key`; returns its token
    ///
    /// A later fill of the same key supersedes this one.
    pub fn begin_fill(&self, tenant: &TenantId, key: &str) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_fill += 1;
        let token = inner.next_fill;
        inner.fills.insert((tenant.clone(), key.to_string()), token);
        token
    }

    /// Insert the result of a fill unless the key was invalidated since it began
    pub fn complete_fill(&self, tenant: &TenantId, key: &str, token: u64, data: Bytes) -> bool {
        let cache_key = (tenant.clone(), key.to_string());
        let mut inner = self.inner.lock();
        if inner.fills.get(&cache_key) != Some(&token) {
            trace!(%tenant, key, "fill superseded, not cached");
            return false;
        }
        inner.fills.remove(&cache_key);
        self.insert(&mut inner, cache_key, data)
    }

    /// Forget a fill that will never complete
    pub fn abandon_fill(&self, tenant: &TenantId, key: &str, token: u64) {
        let cache_key = (tenant.clone(), key.to_string());
        let mut inner = self.inner.lock();
        if inner.fills.get(&cache_key) == Some(&token) {
            inner.fills.remove(&cache_key);
        }
    }

    /// Fills currently outstanding
    pub fn pending_fills(&self) -> usize {
        self.inner.lock().fills.len()
    }

    fn insert(&self, inner: &mut Inner, cache_key: CacheKey, data: Bytes) -> bool {
        let size = data.len() as u64;
        if size > self.capacity {
            trace!(tenant = %cache_key.0, key = %cache_key.1, size, "entry larger than cache, not cached");
            inner.remove(&cache_key);
            return false;
        }

        inner.remove(&cache_key);
        while inner.size + size > self.capacity {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.size -= evicted.size;
                    inner.evictions += 1;
                }
                None => break,
            }
        }
        inner.entries.push(
            cache_key,
            CacheEntry {
                data,
                size,
                last_access: Instant::now(),
                access_count: 0,
            },
        );
        inner.size += size;
        true
    }

    /// Drop an entry; returns whether one was present
    pub fn remove(&self, tenant: &TenantId, key: &str) -> bool {
        self.inner.lock().remove(&(tenant.clone(), key.to_string()))
    }

    /// Presence check without touching recency or counters
    pub fn contains(&self, tenant: &TenantId, key: &str) -> bool {
        self.inner.lock().entries.contains(&(tenant.clone(), key.to_string()))
    }

    /// Bytes cached for one tenant
    pub fn tenant_usage(&self, tenant: &TenantId) -> u64 {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|((owner, _), _)| owner == tenant)
            .map(|(_, entry)| entry.size)
            .sum()
    }

    /// Drop every entry of one tenant
    pub fn clear_tenant(&self, tenant: &TenantId) {
        let mut inner = self.inner.lock();
        let keys: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|((owner, _), _)| owner == tenant)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            inner.remove(&key);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.fills.clear();
        inner.size = 0;
    }

    /// `hits / (hits + misses)`, 0 before any lookup
    pub fn hit_ratio(&self) -> f64 {
        self.inner.lock().hit_ratio()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            size_bytes: inner.size,
            capacity_bytes: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_ratio: inner.hit_ratio(),
        }
    }
}

/// Accumulates a stream's chunks until it grows past a limit
struct Capture {
    buf: Option<BytesMut>,
    limit: u64,
}

impl Capture {
    fn new(limit: u64) -> Self {
        Self {
            buf: Some(BytesMut::new()),
            limit,
        }
    }

    fn push(&mut self, chunk: &Bytes) {
        let fits = self
            .buf
            .as_ref()
            .map(|buf| (buf.len() + chunk.len()) as u64 <= self.limit)
            .unwrap_or(false);
        if fits {
            if let Some(buf) = self.buf.as_mut() {
                buf.extend_from_slice(chunk);
            }
        } else {
            self.buf = None;
        }
    }

    fn finish(self) -> Option<Bytes> {
        self.buf.map(BytesMut::freeze)
    }
}

/// A read-through fill in flight; abandoned on drop unless completed
struct Fill {
    cache: Arc<TenantCache>,
    tenant: TenantId,
    key: String,
    token: u64,
    capture: Option<Capture>,
}

impl Fill {
    fn push(&mut self, chunk: &Bytes) {
        if let Some(capture) = self.capture.as_mut() {
            capture.push(chunk);
        }
    }

    fn complete(&mut self) {
        let Some(data) = self.capture.take().and_then(Capture::finish) else {
            return;
        };
        if self.cache.complete_fill(&self.tenant, &self.key, self.token, data.clone()) {
            debug!(tenant = %self.tenant, key = %self.key, size = data.len(), "caching object");
        }
    }
}

impl Drop for Fill {
    fn drop(&mut self) {
        self.cache.abandon_fill(&self.tenant, &self.key, self.token);
    }
}

/// Read-through, write-through caching wrapper
pub struct CachedDriver<D> {
    inner: D,
    cache: Arc<TenantCache>,
    namespace: TenantNamespace,
    max_entry_bytes: u64,
}

impl<D: StorageDriver> CachedDriver<D> {
    pub fn new(inner: D, config: &CacheConfig, namespace: TenantNamespace) -> Self {
        Self::with_cache(
            inner,
            Arc::new(TenantCache::new(config.capacity_bytes)),
            config.max_entry_bytes,
            namespace,
        )
    }

    /// Share one cache between several drivers
    pub fn with_cache(inner: D, cache: Arc<TenantCache>, max_entry_bytes: u64, namespace: TenantNamespace) -> Self {
        Self {
            inner,
            cache,
            namespace,
            max_entry_bytes,
        }
    }

    pub fn cache(&self) -> &Arc<TenantCache> {
        &self.cache
    }

    fn key(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<(TenantId, String)> {
        // Validates the pair the same way the adapters do
        self.namespace.object_key(scope, container, artifact)?;
        let tenant = self.namespace.resolve(scope)?;
        Ok((tenant, format!("{}/{}", container, artifact)))
    }
}

#[async_trait]
impl<D: StorageDriver> StorageDriver for CachedDriver<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        let (tenant, key) = self.key(scope, container, artifact)?;
        if let Some(data) = self.cache.get(&tenant, &key) {
            trace!(%tenant, key = %key, "cache hit");
            return Ok(stream::from_bytes(data));
        }

        let token = self.cache.begin_fill(&tenant, &key);
        let fill = Fill {
            cache: Arc::clone(&self.cache),
            tenant,
            key,
            token,
            capture: Some(Capture::new(self.max_entry_bytes)),
        };
        let body = self.inner.get(scope, container, artifact).await?;

        // Populate the cache once the caller has read the whole object
        let teed = futures::stream::unfold(Some((body, fill)), |state| async move {
            let (mut body, mut fill) = state?;
            match body.next().await {
                Some(Ok(chunk)) => {
                    fill.push(&chunk);
                    Some((Ok(chunk), Some((body, fill))))
                }
                Some(Err(e)) => Some((Err(e), None)),
                None => {
                    fill.complete();
                    None
                }
            }
        });
        Ok(teed.boxed())
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        let (tenant, key) = self.key(scope, container, artifact)?;
        self.cache.remove(&tenant, &key);

        let capture = Arc::new(Mutex::new(Capture::new(self.max_entry_bytes)));
        let body = {
            let capture = Arc::clone(&capture);
            body.inspect(move |chunk| {
                if let Ok(chunk) = chunk {
                    capture.lock().push(chunk);
                }
            })
            .boxed()
        };

        let written = self.inner.put(scope, container, artifact, body, options).await;
        // Reads that started while the write was in flight may have seen
        // the old object
        self.cache.remove(&tenant, &key);
        written?;

        let captured = Arc::try_unwrap(capture)
            .ok()
            .and_then(|capture| capture.into_inner().finish());
        if let Some(data) = captured {
            self.cache.put(&tenant, &key, data);
        }
        Ok(())
    }

    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        let (tenant, key) = self.key(scope, container, artifact)?;
        self.cache.remove(&tenant, &key);
        let deleted = self.inner.delete(scope, container, artifact).await;
        self.cache.remove(&tenant, &key);
        deleted
    }

    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(scope, container, prefix).await
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        let (tenant, key) = self.key(scope, container, artifact)?;
        if self.cache.contains(&tenant, &key) {
            return Ok(true);
        }
        self.inner.exists(scope, container, artifact).await
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        self.inner.health_check(scope).await
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}
