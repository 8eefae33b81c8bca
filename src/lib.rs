//! # Conduit
//!
//! Vendor-neutral object storage gateway.
//!
//! - [`storage`]: the storage contract, request scope, tenant namespacing and backend adapters
//! - [`wrappers`]: resilience, rate, cost, caching and concurrency wrappers
//! - [`sigv4`]: AWS Signature Version 4 signing and presigned URLs

pub use conduit_core as wrappers;
pub use conduit_sigv4 as sigv4;
pub use conduit_storage as storage;

pub use conduit_core::StackBuilder;
pub use conduit_storage::{RequestScope, StorageDriver, StorageError, TenantId, TenantNamespace};
