//! Egress cost control
//!
//! - [`BandwidthQuota`]: hard monthly per-tenant ceiling, all-or-nothing admission
//! - [`EgressTracker`]: bytes and derived cost per tenant with daily history
//! - [`EgressPredictor`]: month-end projection with a four-level alert
//! - [`EgressDriver`]: wrapper metering every read through quota and tracker
//!
//! Billing periods are calendar months in UTC. The clock is injectable so
//! period rollover can be tested deterministically.

mod clock;
mod driver;
mod predictor;
mod quota;
mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use driver::EgressDriver;
pub use predictor::{days_in_month, AlertLevel, EgressPredictor, Prediction};
pub use quota::{BandwidthQuota, QuotaConfig, QuotaUsage};
pub use tracker::{EgressTracker, TenantEgress};
