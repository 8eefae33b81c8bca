//! Integration tests for the Conduit gateway
//!
//! These tests exercise composed driver graphs end-to-end across crates.

use async_trait::async_trait;
use conduit_cli::{Gateway, GatewayConfig};
use conduit_core::{
    BandwidthQuota, CacheConfig, CircuitBreakerConfig, CompressionConfig, EgressTracker,
    FailoverConfig, FailoverDriver, FallbackDriver, QuotaConfig, Region, RetryPolicy,
    StackBuilder, StreamGuard, ThrottleConfig,
};
use conduit_storage::{
    stream, ByteStream, LocalConfig, LocalDriver, MemoryDriver, PutOptions, RequestScope, Result,
    StorageDriver, StorageError, TenantNamespace,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Memory driver that records every call into a shared log and can be taken down
struct Recorded {
    name: &'static str,
    inner: MemoryDriver,
    down: AtomicBool,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Recorded {
    fn new(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Self {
        Self {
            name,
            inner: MemoryDriver::named(name),
            down: AtomicBool::new(false),
            log: Arc::clone(log),
        }
    }

    fn down(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Self {
        let driver = Self::new(name, log);
        driver.set_down(true);
        driver
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn enter(&self) -> Result<()> {
        self.log.lock().push(self.name);
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Connection(format!("{} unreachable", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for Recorded {
    fn name(&self) -> &str {
        self.name
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        self.enter()?;
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
        self.enter()?;
        self.inner.put(scope, container, artifact, body, options).await
    }

    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        self.enter()?;
        self.inner.delete(scope, container, artifact).await
    }

    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        self.enter()?;
        self.inner.list(scope, container, prefix).await
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        self.enter()?;
        self.inner.exists(scope, container, artifact).await
    }

    async fn health_check(&self, _scope: &RequestScope) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Connection(format!("{} unreachable", self.name)));
        }
        Ok(())
    }
}

fn tenant(id: &str) -> RequestScope {
    RequestScope::for_tenant(id.parse().unwrap())
}

async fn read(driver: &dyn StorageDriver, scope: &RequestScope, container: &str, artifact: &str) -> Result<Vec<u8>> {
    let body = driver.get(scope, container, artifact).await?;
    Ok(stream::collect(body).await?.to_vec())
}

/// Same (container, artifact) for two tenants yields two independent objects
#[tokio::test]
async fn test_tenant_isolation_across_adapters() {
    let dir = tempfile::tempdir().unwrap();
    let drivers: Vec<Arc<dyn StorageDriver>> = vec![
        Arc::new(MemoryDriver::new()),
        Arc::new(LocalDriver::new(LocalConfig::new(dir.path()))),
    ];

    for driver in drivers {
        let t1 = tenant("t1");
        let t2 = tenant("t2");
        driver
            .put(&t1, "photos", "a.jpg", stream::from_bytes(vec![1u8; 10]), &PutOptions::default())
            .await
            .unwrap();
        driver
            .put(&t2, "photos", "a.jpg", stream::from_bytes(vec![2u8; 10]), &PutOptions::default())
            .await
            .unwrap();

        assert_eq!(read(driver.as_ref(), &t1, "photos", "a.jpg").await.unwrap(), vec![1u8; 10]);
        assert_eq!(read(driver.as_ref(), &t2, "photos", "a.jpg").await.unwrap(), vec![2u8; 10]);

        driver.delete(&t1, "photos", "a.jpg").await.unwrap();
        assert!(!driver.exists(&t1, "photos", "a.jpg").await.unwrap(), "{}", driver.name());
        assert!(driver.exists(&t2, "photos", "a.jpg").await.unwrap(), "{}", driver.name());
    }
}

#[tokio::test]
async fn test_local_adapter_lays_out_tenant_directories() {
    let dir = tempfile::tempdir().unwrap();
    let driver = LocalDriver::new(LocalConfig::new(dir.path()));
    driver
        .put(&tenant("t1"), "photos", "2024/a.jpg", stream::from_bytes("0123456789"), &PutOptions::default())
        .await
        .unwrap();

    let path = dir.path().join("t-t1").join("photos").join("2024").join("a.jpg");
    assert_eq!(std::fs::read(path).unwrap(), b"0123456789");
}

/// Always-failing primary, always-succeeding secondary
#[tokio::test]
async fn test_fallback_chain_tries_primary_first_every_call() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let chain = FallbackDriver::new(Recorded::down("primary", &log), Recorded::new("secondary", &log));
    let scope = tenant("t1");

    for i in 0..5 {
        log.lock().clear();
        let artifact = format!("obj-{}", i);
        chain
            .put(&scope, "photos", &artifact, stream::from_bytes("0123456789"), &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec!["primary", "secondary"]);

        log.lock().clear();
        assert_eq!(read(&chain, &scope, "photos", &artifact).await.unwrap().len(), 10);
        assert_eq!(*log.lock(), vec!["primary", "secondary"]);
    }
}

#[tokio::test]
async fn test_fallback_chain_does_not_mask_not_found() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let chain = FallbackDriver::new(Recorded::new("primary", &log), Recorded::new("secondary", &log));

    let err = read(&chain, &tenant("t1"), "photos", "missing.jpg").await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error {:?}", err);
}

#[tokio::test]
async fn test_fallback_chain_with_both_links_down() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let chain = FallbackDriver::new(Recorded::down("primary", &log), Recorded::down("secondary", &log));

    let err = chain.exists(&tenant("t1"), "photos", "a.jpg").await.unwrap_err();
    assert!(matches!(err, StorageError::AllBackendsFailed { .. }), "unexpected error {:?}", err);
}

/// Primary marked unhealthy is skipped until a probe restores it
#[tokio::test]
async fn test_failover_routes_to_secondary_until_probe_restores_primary() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let failover = FailoverDriver::new(
        Recorded::new("us-east", &log),
        Recorded::new("eu-west", &log),
        FailoverConfig {
            replicate_writes: false,
            ..FailoverConfig::default()
        },
    );
    let scope = tenant("t1");

    failover.mark_unhealthy(Region::Primary);
    for i in 0..3 {
        failover
            .put(&scope, "photos", &format!("obj-{}", i), stream::from_bytes("x"), &PutOptions::default())
            .await
            .unwrap();
    }
    assert!(log.lock().iter().all(|region| *region == "eu-west"));

    let health = failover.probe_now().await;
    assert!(health.primary_healthy);

    log.lock().clear();
    failover.exists(&scope, "photos", "obj-0").await.unwrap();
    assert_eq!(log.lock().first(), Some(&"us-east"));
}

#[tokio::test(start_paused = true)]
async fn test_background_probe_restores_region() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let primary = Arc::new(Recorded::down("us-east", &log));
    let config = FailoverConfig {
        probe_interval_ms: 1_000,
        ..FailoverConfig::default()
    };
    let failover = FailoverDriver::new(Arc::clone(&primary), Recorded::new("eu-west", &log), config);
    failover.start_probing();

    failover.mark_unhealthy(Region::Primary);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    // Still down, still skipped
    assert!(!failover.health().primary_healthy);

    primary.set_down(false);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(failover.health().primary_healthy);

    failover.stop_probing();
    assert!(!failover.is_probing());
}

/// Every wrapper stacked over a fallback chain behaves like a single backend
#[tokio::test]
async fn test_full_stack_round_trip_and_egress_quota() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let namespace = TenantNamespace::default();
    let quota = Arc::new(BandwidthQuota::new(QuotaConfig {
        monthly_limit_bytes: 15,
        ..QuotaConfig::default()
    }));
    let tracker = Arc::new(EgressTracker::new(0.09));

    let builder = StackBuilder::new(FallbackDriver::new(
        Recorded::down("primary", &log),
        Recorded::new("secondary", &log),
    ))
    .circuit_breaker(CircuitBreakerConfig::default())
    .retry(RetryPolicy::none())
    .throttle(&ThrottleConfig::default())
    .unwrap()
    .compression(CompressionConfig::default())
    .cache(&CacheConfig::default(), namespace.clone())
    .stream_guard(StreamGuard::new(4))
    .egress(namespace, Arc::clone(&quota), Arc::clone(&tracker));
    assert_eq!(
        builder.describe(),
        "egress > stream_guard > cache > compression > throttle > retry > circuit_breaker > fallback(primary, secondary)"
    );
    let driver = builder.build();

    let scope = tenant("t1");
    driver
        .put(&scope, "photos", "a.jpg", stream::from_bytes("0123456789"), &PutOptions::default())
        .await
        .unwrap();
    assert_eq!(driver.list(&scope, "photos", "").await.unwrap(), vec!["a.jpg"]);

    assert_eq!(read(driver.as_ref(), &scope, "photos", "a.jpg").await.unwrap(), b"0123456789");
    assert_eq!(tracker.bytes(scope.tenant().unwrap()), 10);

    // 5 bytes left: the next read is refused, never partially admitted
    let err = read(driver.as_ref(), &scope, "photos", "a.jpg").await.unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded { .. }), "unexpected error {:?}", err);
    assert_eq!(quota.used(scope.tenant().unwrap()), 10);

    // Another tenant has its own allowance
    let other = tenant("t2");
    assert!(read(driver.as_ref(), &other, "photos", "a.jpg").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_cancelled_scope_stops_the_stack() {
    let driver = StackBuilder::new(MemoryDriver::new())
        .retry(RetryPolicy::default())
        .build();
    let (scope, handle) = tenant("t1").cancellable();
    handle.cancel();

    let err = driver.exists(&scope, "photos", "a.jpg").await.unwrap_err();
    assert!(err.is_cancellation(), "unexpected error {:?}", err);
}

/// Graph assembled from configuration, backed by the local filesystem
#[test_log::test(tokio::test)]
async fn test_gateway_from_config_with_local_failover() {
    let primary = tempfile::tempdir().unwrap();
    let secondary = tempfile::tempdir().unwrap();
    let config = GatewayConfig::from_toml(&format!(
        r#"
        [tenant]
        fallback = "acme"

        [[backends]]
        type = "local"
        name = "disk-a"
        root = {:?}

        [[backends]]
        type = "local"
        name = "disk-b"
        root = {:?}

        [topology]
        mode = "failover"
        primary = "disk-a"
        secondary = "disk-b"

        [topology.settings]
        replicate_writes = false

        [retry]
        max_attempts = 2
        "#,
        primary.path(),
        secondary.path()
    ))
    .unwrap();

    let gateway = Gateway::build(config).unwrap();
    assert_eq!(gateway.stack, "retry > failover(disk-a, disk-b)");

    // No tenant on the scope: the configured fallback applies
    let scope = gateway.scope(None).unwrap();
    gateway
        .driver
        .put(&scope, "photos", "a.jpg", stream::from_bytes("0123456789"), &PutOptions::default())
        .await
        .unwrap();
    assert!(primary.path().join("t-acme/photos/a.jpg").exists());

    gateway.failover.as_ref().unwrap().mark_unhealthy(Region::Primary);
    gateway
        .driver
        .put(&scope, "photos", "b.jpg", stream::from_bytes("x"), &PutOptions::default())
        .await
        .unwrap();
    assert!(secondary.path().join("t-acme/photos/b.jpg").exists());
    assert!(!primary.path().join("t-acme/photos/b.jpg").exists());

    gateway.shutdown();
}
