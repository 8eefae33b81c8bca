//! Request scope
//!
//! The one place that defines how tenant identity, deadlines and
//! cancellation travel with a call. Every adapter and wrapper reads the
//! tenant through [`RequestScope::tenant`]; nothing else in the workspace
//! declares a competing carrier.

use crate::tenant::TenantId;
use crate::{Result, StorageError};
use futures::future::select_all;
use std::future::{pending, Future};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Call-scoped context passed to every storage operation
#[derive(Clone, Debug)]
pub struct RequestScope {
    tenant: Option<TenantId>,
    request_id: Uuid,
    deadline: Option<Instant>,
    /// One receiver per `cancellable` call; any of them cancels the scope
    cancel: Vec<watch::Receiver<bool>>,
}

/// Trips the cancellation signal of every clone of a scope
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel the scope
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for RequestScope {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestScope {
    /// A scope with no tenant, deadline or cancellation
    pub fn new() -> Self {
        Self {
            tenant: None,
            request_id: Uuid::new_v4(),
            deadline: None,
            cancel: Vec::new(),
        }
    }

    /// A scope carrying `tenant`
    pub fn for_tenant(tenant: TenantId) -> Self {
        Self::new().with_tenant(tenant)
    }

    /// Attach a tenant
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    /// Attach an absolute deadline (keeps the earlier one if already set)
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Attach a deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Make the scope cancellable, returning the handle that cancels it
    ///
    /// Calling this on a scope that is already cancellable adds a signal:
    /// the new handle and every earlier one can each cancel the result.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel.push(rx);
        (self, CancelHandle { tx })
    }

    /// Same tenant and request id, without deadline or cancellation
    ///
    /// Used for background work that must outlive the request that started it.
    pub fn detached(&self) -> Self {
        Self {
            tenant: self.tenant.clone(),
            request_id: self.request_id,
            deadline: None,
            cancel: Vec::new(),
        }
    }

    /// Tenant carried by this scope
    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    /// Request id for tracing
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Absolute deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the scope has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.iter().any(|rx| *rx.borrow())
    }

    /// Fail fast if cancelled or past the deadline
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StorageError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Resolves once the scope is cancelled or its deadline passes
    ///
    /// Never resolves for a scope with neither. Cancellation wins if both
    /// are ready.
    pub async fn cancelled(&self) -> StorageError {
        let cancel = async {
            if self.cancel.is_empty() {
                pending::<()>().await;
            }
            let signals = self.cancel.iter().cloned().map(|rx| Box::pin(tripped(rx)));
            select_all(signals).await;
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel => StorageError::Cancelled,
            _ = deadline => StorageError::DeadlineExceeded,
        }
    }

    /// Run `fut`, abandoning it as soon as the scope is cancelled or expires
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.cancelled() => Err(err),
            result = fut => result,
        }
    }
}

/// Resolves once `rx` reads `true`; never if its handle is dropped first
async fn tripped(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            pending::<()>().await;
        }
    }
}
