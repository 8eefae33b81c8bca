//! Reusable-handle pool
//!
//! Caps how many read handles are open at once and recycles their read
//! buffers. Under high fan-out read load callers wait briefly for a slot
//! instead of exhausting file descriptors.

use crate::scope::RequestScope;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool of read handles
#[derive(Clone)]
pub struct HandlePool {
    permits: Arc<Semaphore>,
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
    max_open: usize,
    buffer_size: usize,
}

impl HandlePool {
    /// Allow at most `max_open` leases, each with a `buffer_size` read buffer
    pub fn new(max_open: usize, buffer_size: usize) -> Self {
        let max_open = max_open.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_open)),
            buffers: Arc::new(Mutex::new(Vec::with_capacity(max_open))),
            max_open,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Wait (cancellably) for a free slot
    pub async fn acquire(&self, scope: &RequestScope) -> Result<HandleLease> {
        let permits = Arc::clone(&self.permits);
        let permit = scope
            .run(async move { permits.acquire_owned().await.map_err(|_| StorageError::Shutdown) })
            .await?;

        let buffer = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);

        Ok(HandleLease {
            _permit: permit,
            buffer: Some(buffer),
            pool: Arc::clone(&self.buffers),
            max_pooled: self.max_open,
        })
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Maximum simultaneous leases
    pub fn max_open(&self) -> usize {
        self.max_open
    }

    /// Buffers waiting for reuse
    pub fn pooled_buffers(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// One checked-out slot and its read buffer; returned to the pool on drop
#[derive(Debug)]
pub struct HandleLease {
    _permit: OwnedSemaphorePermit,
    buffer: Option<Vec<u8>>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
    max_pooled: usize,
}

impl HandleLease {
    /// The read buffer
    pub fn buffer(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let mut pool = self.pool.lock();
            if pool.len() < self.max_pooled {
                pool.push(buffer);
            }
        }
    }
}
