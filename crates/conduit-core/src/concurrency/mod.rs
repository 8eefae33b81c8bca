//! Bounded-concurrency primitives
//!
//! Every blocking wait in this module takes a [`RequestScope`] and gives up
//! with the scope's error as soon as it is cancelled.
//!
//! [`RequestScope`]: conduit_storage::RequestScope

mod batch;
mod queue;
mod stream_guard;

pub use batch::{BatchExecutor, BatchPut};
pub use queue::{QueueConfig, RequestQueue};
pub use stream_guard::{GuardedDriver, StreamGuard, StreamGuardConfig, StreamPermit};

pub use conduit_storage::handles::{HandleLease, HandlePool};
