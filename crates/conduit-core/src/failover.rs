//! Regional failover with persistent health state
//!
//! Unlike [`FallbackDriver`](crate::FallbackDriver), a region that fails a
//! call is marked unhealthy and skipped by later calls until the background
//! prober sees it pass a health check again. Successful primary writes are
//! replicated to the secondary in the background on a best-effort basis.

use crate::fallback::{common_capabilities, exhausted, next_after, Next};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use conduit_storage::stream::{self, ByteStream};
use conduit_storage::{
    Capabilities, PutOptions, RequestScope, Result, StorageDriver, StorageError,
    DEFAULT_CHUNK_SIZE,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Failover settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Interval between probe rounds (milliseconds)
    pub probe_interval_ms: u64,
    /// Timeout of one health probe (milliseconds)
    pub probe_timeout_ms: u64,
    /// Copy successful primary writes to the secondary in the background
    pub replicate_writes: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            replicate_writes: true,
        }
    }
}

impl FailoverConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// One of the two regions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Primary,
    Secondary,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Primary => f.write_str("primary"),
            Region::Secondary => f.write_str("secondary"),
        }
    }
}

/// Health of both regions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionHealth {
    pub primary_healthy: bool,
    pub secondary_healthy: bool,
    /// When the prober last ran
    pub last_check: Option<DateTime<Utc>>,
}

impl RegionHealth {
    fn is_healthy(&self, region: Region) -> bool {
        match region {
            Region::Primary => self.primary_healthy,
            Region::Secondary => self.secondary_healthy,
        }
    }

    fn set(&mut self, region: Region, healthy: bool) {
        match region {
            Region::Primary => self.primary_healthy = healthy,
            Region::Secondary => self.secondary_healthy = healthy,
        }
    }
}

struct Shared<P, S> {
    name: String,
    primary: P,
    secondary: S,
    config: FailoverConfig,
    health: RwLock<RegionHealth>,
}

impl<P: StorageDriver, S: StorageDriver> Shared<P, S> {
    fn driver(&self, region: Region) -> &dyn StorageDriver {
        match region {
            Region::Primary => &self.primary,
            Region::Secondary => &self.secondary,
        }
    }

    /// Healthy regions in preference order; both when none is healthy
    fn candidates(&self) -> Vec<Region> {
        let health = self.health.read();
        let healthy: Vec<Region> = [Region::Primary, Region::Secondary]
            .into_iter()
            .filter(|region| health.is_healthy(*region))
            .collect();
        if healthy.is_empty() {
            vec![Region::Primary, Region::Secondary]
        } else {
            healthy
        }
    }

    fn mark(&self, region: Region, healthy: bool) {
        let mut health = self.health.write();
        if health.is_healthy(region) == healthy {
            return;
        }
        health.set(region, healthy);
        if healthy {
            info!(failover = %self.name, %region, "region restored");
        } else {
            warn!(failover = %self.name, %region, "region marked unhealthy");
        }
    }

    /// Record a failed call; `Err` ends the routing loop
    fn observe(&self, region: Region, error: StorageError) -> Result<StorageError> {
        match next_after(error) {
            Next::Stop(e) => Err(e),
            Next::Continue(e) => {
                if e.is_transient() {
                    self.mark(region, false);
                } else {
                    debug!(failover = %self.name, %region, error = %e, "region answered, trying next");
                }
                Ok(e)
            }
        }
    }

    async fn probe_unhealthy(&self) -> RegionHealth {
        let unhealthy: Vec<Region> = {
            let health = self.health.read();
            [Region::Primary, Region::Secondary]
                .into_iter()
                .filter(|region| !health.is_healthy(*region))
                .collect()
        };

        for region in unhealthy {
            let scope = RequestScope::new().with_timeout(self.config.probe_timeout());
            match self.driver(region).health_check(&scope).await {
                Ok(()) => self.mark(region, true),
                Err(e) => debug!(failover = %self.name, %region, error = %e, "probe failed"),
            }
        }

        let mut health = self.health.write();
        health.last_check = Some(Utc::now());
        health.clone()
    }
}

/// Primary/secondary regions with health-tracked routing
pub struct FailoverDriver<P, S> {
    shared: Arc<Shared<P, S>>,
    prober: Mutex<Option<JoinHandle<()>>>,
}

impl<P, S> FailoverDriver<P, S>
where
    P: StorageDriver + 'static,
    S: StorageDriver + 'static,
{
    /// Both regions start healthy; probing is not started
    pub fn new(primary: P, secondary: S, config: FailoverConfig) -> Self {
        let name = format!("failover({}, {})", primary.name(), secondary.name());
        Self {
            shared: Arc::new(Shared {
                name,
                primary,
                secondary,
                config,
                health: RwLock::new(RegionHealth {
                    primary_healthy: true,
                    secondary_healthy: true,
                    last_check: None,
                }),
            }),
            prober: Mutex::new(None),
        }
    }

    /// Current health snapshot
    pub fn health(&self) -> RegionHealth {
        self.shared.health.read().clone()
    }

    /// Mark a region unhealthy so calls skip it until a probe restores it
    pub fn mark_unhealthy(&self, region: Region) {
        self.shared.mark(region, false);
    }

    /// Run one probe round against unhealthy regions
    pub async fn probe_now(&self) -> RegionHealth {
        self.shared.probe_unhealthy().await
    }

    /// Start the background prober; no-op if already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_probing(&self) {
        let mut prober = self.prober.lock();
        if prober.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let period = shared.config.probe_interval();
        *prober = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.probe_unhealthy().await;
            }
        }));
        debug!(failover = %self.shared.name, ?period, "prober started");
    }

    /// Stop the background prober
    pub fn stop_probing(&self) {
        if let Some(handle) = self.prober.lock().take() {
            handle.abort();
            debug!(failover = %self.shared.name, "prober stopped");
        }
    }

    /// Whether the prober task is running
    pub fn is_probing(&self) -> bool {
        self.prober
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    fn replicate(&self, scope: &RequestScope, container: &str, artifact: &str, data: Bytes, options: &PutOptions) {
        let shared = Arc::clone(&self.shared);
        let scope = scope.detached();
        let container = container.to_string();
        let artifact = artifact.to_string();
        let options = options.clone();
        tokio::spawn(async move {
            let body = stream::chunked(data, DEFAULT_CHUNK_SIZE);
            match shared.secondary.put(&scope, &container, &artifact, body, &options).await {
                Ok(()) => debug!(failover = %shared.name, %container, %artifact, "replicated to secondary"),
                Err(e) => warn!(
                    failover = %shared.name,
                    request_id = %scope.request_id(),
                    %container,
                    %artifact,
                    error = %e,
                    "replication to secondary failed"
                ),
            }
        });
    }
}

impl<P, S> Drop for FailoverDriver<P, S> {
    fn drop(&mut self) {
        if let Some(handle) = self.prober.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl<P, S> StorageDriver for FailoverDriver<P, S>
where
    P: StorageDriver + 'static,
    S: StorageDriver + 'static,
{
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        let mut last = None;
        for region in self.shared.candidates() {
            match self.shared.driver(region).get(scope, container, artifact).await {
                Ok(body) => return Ok(body),
                Err(e) => last = Some(self.shared.observe(region, e)?),
            }
        }
        Err(self.exhausted(last))
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
        let mut last = None;
        for region in self.shared.candidates() {
            let body = stream::chunked(data.clone(), DEFAULT_CHUNK_SIZE);
            match self.shared.driver(region).put(scope, container, artifact, body, options).await {
                Ok(()) => {
                    if region == Region::Primary && self.shared.config.replicate_writes {
                        self.replicate(scope, container, artifact, data, options);
                    }
                    return Ok(());
                }
                Err(e) => last = Some(self.shared.observe(region, e)?),
            }
        }
        Err(self.exhausted(last))
    }

    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        // Replicas may exist in either region regardless of health
        let mut deleted = false;
        let mut last = None;
        for region in [Region::Primary, Region::Secondary] {
            match self.shared.driver(region).delete(scope, container, artifact).await {
                Ok(()) => deleted = true,
                Err(e) => last = Some(self.shared.observe(region, e)?),
            }
        }
        match (deleted, last) {
            (true, Some(e)) => {
                warn!(failover = %self.shared.name, container, artifact, error = %e, "best-effort delete failed in one region");
                Ok(())
            }
            (true, None) => Ok(()),
            (false, last) => Err(self.exhausted(last)),
        }
    }

    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        let mut last = None;
        for region in self.shared.candidates() {
            match self.shared.driver(region).list(scope, container, prefix).await {
                Ok(keys) => return Ok(keys),
                Err(e) => last = Some(self.shared.observe(region, e)?),
            }
        }
        Err(self.exhausted(last))
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        let mut answered = false;
        let mut last = None;
        for region in self.shared.candidates() {
            match self.shared.driver(region).exists(scope, container, artifact).await {
                Ok(true) => return Ok(true),
                Ok(false) => answered = true,
                Err(e) => last = Some(self.shared.observe(region, e)?),
            }
        }
        if answered {
            return Ok(false);
        }
        Err(self.exhausted(last))
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        let mut last = None;
        for region in [Region::Primary, Region::Secondary] {
            match self.shared.driver(region).health_check(scope).await {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(self.shared.observe(region, e)?),
            }
        }
        Err(self.exhausted(last))
    }

    fn capabilities(&self) -> Capabilities {
        common_capabilities(self.shared.primary.capabilities(), self.shared.secondary.capabilities())
    }
}

impl<P, S> FailoverDriver<P, S> {
    fn exhausted(&self, last: Option<StorageError>) -> StorageError {
        match last {
            Some(e) => exhausted(&self.shared.name, e),
            None => StorageError::AllBackendsFailed {
                chain: self.shared.name.clone(),
                last: Box::new(StorageError::Configuration("no region attempted".into())),
            },
        }
    }
}
