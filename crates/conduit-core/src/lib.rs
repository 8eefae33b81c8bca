//! # Conduit Core
//!
//! Composable wrappers around the Conduit storage contract.
//!
//! This crate provides:
//! - **Resilience**: circuit breaker, retry with backoff, fallback chain, regional failover
//! - **Rate & cost control**: byte-rate throttle, monthly egress quota, egress tracker and predictor
//! - **Caching**: tenant-aware, size-bounded LRU with read-through/write-through wrapper
//! - **Compression**: transparent gzip framing of stored payloads
//! - **Concurrency**: stream guard, request queue, parallel batch executor
//! - **Composition**: explicit, ordered [`StackBuilder`]
//!
//! Every wrapper implements [`StorageDriver`] itself, so wrappers nest in any
//! order without changing what callers can observe.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Cache / Compression / Guard       │
//! ├─────────────────────────────────────────┤
//! │        Throttle / Egress metering       │
//! ├─────────────────────────────────────────┤
//! │        Retry / Circuit breaker          │
//! ├─────────────────────────────────────────┤
//! │       Fallback chain / Failover         │
//! ├─────────────┬─────────────┬─────────────┤
//! │    Local    │     S3      │   Dropbox   │
//! └─────────────┴─────────────┴─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use conduit_core::{StackBuilder, FallbackDriver, RetryPolicy, CircuitBreakerConfig};
//!
//! let driver = StackBuilder::new(FallbackDriver::new(primary, secondary))
//!     .circuit_breaker(CircuitBreakerConfig::default())
//!     .retry(RetryPolicy::default())
//!     .build();
//! driver.put(&scope, "photos", "a.jpg", body, &PutOptions::default()).await?;
//! ```

pub mod builder;
pub mod cache;
pub mod circuit_breaker;
pub mod compression;
pub mod concurrency;
pub mod egress;
pub mod failover;
pub mod fallback;
pub mod retry;
pub mod throttle;

#[cfg(test)]
mod testing;

pub use builder::StackBuilder;
pub use cache::{CacheConfig, CacheEntry, CacheStats, CachedDriver, TenantCache};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerDriver, CircuitMetrics, CircuitState,
};
pub use compression::{CompressionConfig, CompressionDriver};
pub use concurrency::{
    BatchExecutor, BatchPut, GuardedDriver, QueueConfig, RequestQueue, StreamGuard,
    StreamGuardConfig,
};
pub use egress::{
    AlertLevel, BandwidthQuota, Clock, EgressDriver, EgressPredictor, EgressTracker, ManualClock,
    Prediction, QuotaConfig, SystemClock,
};
pub use failover::{FailoverConfig, FailoverDriver, Region, RegionHealth};
pub use fallback::FallbackDriver;
pub use retry::{RetryDriver, RetryPolicy};
pub use throttle::{Throttle, ThrottleConfig, ThrottledDriver};

pub use conduit_storage::StorageDriver;
