//! Circuit breaker
//!
//! Stops calling a dependency that keeps failing. After
//! `failure_threshold` consecutive transient failures the circuit opens and
//! every call fails fast with `CircuitOpen` without touching the
//! dependency. Once `reset_timeout` has elapsed a single trial call is let
//! through (half-open); `success_threshold` consecutive trial successes
//! close the circuit again, any trial failure re-opens it.

use async_trait::async_trait;
use conduit_storage::{
    ByteStream, Capabilities, PutOptions, RequestScope, Result, StorageDriver, StorageError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it
    pub success_threshold: u32,
    /// Time the circuit stays open before a trial call (milliseconds)
    pub reset_timeout_ms: u64,
    /// Upper bound on one wrapped call (milliseconds)
    pub call_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected
    Open,
    /// One trial call at a time is allowed
    HalfOpen,
}

/// Snapshot of breaker counters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Calls rejected without being attempted
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Three-state circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    rejected: AtomicU64,
}

/// Outcome bookkeeping for one admitted call
///
/// If the call future is dropped before it settles, a pending trial slot is
/// handed back so the breaker cannot wedge in half-open.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            rejected: AtomicU64::new(0),
        }
    }

    /// Name used in `CircuitOpen` errors
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let inner = self.inner.lock();
        CircuitMetrics {
            state: inner.state,
            consecutive_failures: inner.failures,
            consecutive_successes: inner.successes,
            rejected_calls: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Run `f` through the breaker
    ///
    /// `f` is not invoked when the circuit is open. Its future is bounded by
    /// the call timeout (a timeout counts as a failure) and raced against
    /// the scope; cancellation counts as neither success nor failure.
    pub async fn execute<T, F, Fut>(&self, scope: &RequestScope, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut admission = self.admit()?;
        let call_timeout = self.config.call_timeout();

        let outcome = scope
            .run(async {
                match tokio::time::timeout(call_timeout, f()).await {
                    Ok(result) => result,
                    Err(_) => Err(StorageError::Timeout(format!(
                        "{} call exceeded {:?}",
                        self.name, call_timeout
                    ))),
                }
            })
            .await;

        match &outcome {
            Err(e) if e.is_cancellation() => {}
            Err(e) if e.is_transient() => {
                admission.settled = true;
                self.on_failure(admission.trial, e);
            }
            _ => {
                admission.settled = true;
                self.on_success(admission.trial);
            }
        }
        outcome
    }

    fn admit(&self) -> Result<Admission<'_>> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout())
                    .unwrap_or(true);
                if !elapsed {
                    return Err(self.reject());
                }
                inner.state = CircuitState::HalfOpen;
                inner.failures = 0;
                inner.successes = 0;
                inner.trial_in_flight = true;
                info!(breaker = %self.name, "circuit half-open, admitting trial call");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.reject());
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(Admission {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn reject(&self) -> StorageError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(breaker = %self.name, "circuit open, rejecting call");
        StorageError::CircuitOpen {
            backend: self.name.clone(),
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                    info!(breaker = %self.name, "circuit closed");
                }
            }
            // Late result of a call admitted before the circuit opened
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool, error: &StorageError) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        error = %error,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.successes = 0;
                inner.trial_in_flight = false;
                warn!(breaker = %self.name, error = %error, "trial call failed, circuit re-opened");
            }
            _ => {}
        }
    }
}

/// Driver wrapper routing every call through a [`CircuitBreaker`]
pub struct CircuitBreakerDriver<D> {
    inner: D,
    breaker: CircuitBreaker,
}

impl<D: StorageDriver> CircuitBreakerDriver<D> {
    pub fn new(inner: D, config: CircuitBreakerConfig) -> Self {
        let breaker = CircuitBreaker::new(inner.name().to_string(), config);
        Self { inner, breaker }
    }

    /// The breaker guarding `inner`
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl<D: StorageDriver> StorageDriver for CircuitBreakerDriver<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        self.breaker
            .execute(scope, || self.inner.get(scope, container, artifact))
            .await
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        self.breaker
            .execute(scope, || self.inner.put(scope, container, artifact, body, options))
            .await
    }

    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        self.breaker
            .execute(scope, || self.inner.delete(scope, container, artifact))
            .await
    }

    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        self.breaker
            .execute(scope, || self.inner.list(scope, container, prefix))
            .await
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        self.breaker
            .execute(scope, || self.inner.exists(scope, container, artifact))
            .await
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        self.breaker.execute(scope, || self.inner.health_check(scope)).await
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}
