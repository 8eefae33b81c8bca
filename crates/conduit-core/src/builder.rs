//! Explicit composition of a driver graph
//!
//! Layers are added innermost first. The resulting graph is an ordinary
//! value; there is no registry of drivers by name.
//!
//! ```rust,ignore
//! let stack = StackBuilder::new(FallbackDriver::new(primary, secondary))
//!     .circuit_breaker(CircuitBreakerConfig::default())
//!     .retry(RetryPolicy::default())
//!     .throttle(&ThrottleConfig::default())?
//!     .cache(&CacheConfig::default(), namespace);
//! assert_eq!(stack.describe(), "cache > throttle > retry > circuit_breaker > fallback(a, b)");
//! let driver: Arc<dyn StorageDriver> = stack.build();
//! ```

use crate::cache::{CacheConfig, CachedDriver};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerDriver};
use crate::compression::{CompressionConfig, CompressionDriver};
use crate::concurrency::{GuardedDriver, StreamGuard};
use crate::egress::{BandwidthQuota, EgressDriver, EgressTracker};
use crate::retry::{RetryDriver, RetryPolicy};
use crate::throttle::{ThrottleConfig, ThrottledDriver};
use conduit_storage::{Result, StorageDriver, TenantNamespace};
use std::sync::Arc;
use tracing::debug;

/// Builds a driver graph one wrapper at a time
pub struct StackBuilder {
    driver: Arc<dyn StorageDriver>,
    layers: Vec<String>,
}

impl StackBuilder {
    /// Start from the innermost driver
    pub fn new<D: StorageDriver + 'static>(base: D) -> Self {
        let name = base.name().to_string();
        Self {
            driver: Arc::new(base),
            layers: vec![name],
        }
    }

    /// Wrap the current graph with an arbitrary layer
    pub fn layer<F, W>(mut self, name: &str, wrap: F) -> Self
    where
        F: FnOnce(Arc<dyn StorageDriver>) -> W,
        W: StorageDriver + 'static,
    {
        self.driver = Arc::new(wrap(self.driver));
        self.layers.push(name.to_string());
        self
    }

    pub fn circuit_breaker(self, config: CircuitBreakerConfig) -> Self {
        self.layer("circuit_breaker", |inner| CircuitBreakerDriver::new(inner, config))
    }

    pub fn retry(self, policy: RetryPolicy) -> Self {
        self.layer("retry", |inner| RetryDriver::new(inner, policy))
    }

    pub fn throttle(self, config: &ThrottleConfig) -> Result<Self> {
        let inner = Arc::clone(&self.driver);
        let throttled = ThrottledDriver::new(inner, config)?;
        Ok(self.layer("throttle", |_| throttled))
    }

    pub fn egress(self, namespace: TenantNamespace, quota: Arc<BandwidthQuota>, tracker: Arc<EgressTracker>) -> Self {
        self.layer("egress", |inner| EgressDriver::new(inner, namespace, quota, tracker))
    }

    pub fn compression(self, config: CompressionConfig) -> Self {
        self.layer("compression", |inner| CompressionDriver::new(inner, config))
    }

    pub fn stream_guard(self, guard: StreamGuard) -> Self {
        self.layer("stream_guard", |inner| GuardedDriver::new(inner, guard))
    }

    pub fn cache(self, config: &CacheConfig, namespace: TenantNamespace) -> Self {
        self.layer("cache", |inner| CachedDriver::new(inner, config, namespace))
    }

    /// Layer order, outermost first
    pub fn describe(&self) -> String {
        self.layers.iter().rev().cloned().collect::<Vec<_>>().join(" > ")
    }

    /// Layer names, innermost first
    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    pub fn build(self) -> Arc<dyn StorageDriver> {
        debug!(stack = %self.describe(), "driver graph assembled");
        self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FallbackDriver;
    use crate::testing::FlakyDriver;
    use conduit_storage::stream;
    use conduit_storage::{PutOptions, RequestScope};

    #[test]
    fn test_describe_lists_outermost_first() {
        let builder = StackBuilder::new(FallbackDriver::new(FlakyDriver::new("a"), FlakyDriver::new("b")))
            .circuit_breaker(CircuitBreakerConfig::default())
            .retry(RetryPolicy::none())
            .cache(&CacheConfig::default(), TenantNamespace::default());
        assert_eq!(
            builder.describe(),
            "cache > retry > circuit_breaker > fallback(a, b)"
        );
        assert_eq!(builder.layers().first().map(String::as_str), Some("fallback(a, b)"));
    }

    #[tokio::test]
    async fn test_composed_stack_honours_contract() {
        let primary = Arc::new(FlakyDriver::down("primary"));
        let secondary = Arc::new(FlakyDriver::new("secondary"));
        let driver = StackBuilder::new(FallbackDriver::new(Arc::clone(&primary), Arc::clone(&secondary)))
            .circuit_breaker(CircuitBreakerConfig::default())
            .retry(RetryPolicy::none())
            .throttle(&ThrottleConfig::default())
            .unwrap()
            .compression(CompressionConfig::default())
            .stream_guard(StreamGuard::new(4))
            .cache(&CacheConfig::default(), TenantNamespace::default())
            .build();

        let scope = RequestScope::for_tenant("t1".parse().unwrap());
        driver
            .put(&scope, "photos", "a.jpg", stream::from_bytes("0123456789"), &PutOptions::default())
            .await
            .unwrap();
        assert!(driver.exists(&scope, "photos", "a.jpg").await.unwrap());
        assert_eq!(driver.list(&scope, "photos", "").await.unwrap(), vec!["a.jpg"]);
        let data = stream::collect(driver.get(&scope, "photos", "a.jpg").await.unwrap())
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"0123456789");
        assert_eq!(driver.name(), "fallback(primary, secondary)");

        driver.delete(&scope, "photos", "a.jpg").await.unwrap();
        assert!(!driver.exists(&scope, "photos", "a.jpg").await.unwrap());
        assert!(primary.calls() > 0);
    }
}
