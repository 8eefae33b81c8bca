//! Month-end egress projection and alerting

use super::clock::{Clock, SystemClock};
use super::tracker::EgressTracker;
use chrono::{Datelike, NaiveDate};
use conduit_storage::TenantId;
use serde::Serialize;
use std::sync::Arc;

/// Alert raised against the quota
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AlertLevel {
    None,
    /// Projected at or above 50% of quota
    Info,
    /// Projected at or above 75% of quota
    Warning,
    /// Projected at or above 90% of quota
    Critical,
}

impl AlertLevel {
    fn for_ratio(ratio: f64) -> Self {
        if ratio >= 0.90 {
            AlertLevel::Critical
        } else if ratio >= 0.75 {
            AlertLevel::Warning
        } else if ratio >= 0.50 {
            AlertLevel::Info
        } else {
            AlertLevel::None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Prediction {
    pub used_bytes: u64,
    pub projected_bytes: u64,
    pub quota_bytes: u64,
    /// Projected usage as a fraction of the quota
    pub projected_ratio: f64,
    pub alert: AlertLevel,
}

/// Number of days in the month of `date`
pub fn days_in_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|next| next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}

/// Linear extrapolation of month-end usage
///
/// `projected = used * days_in_month / elapsed_days`, where the current day
/// counts as elapsed.
pub struct EgressPredictor {
    quota_bytes: u64,
    clock: Arc<dyn Clock>,
}

impl EgressPredictor {
    pub fn new(quota_bytes: u64) -> Self {
        Self::with_clock(quota_bytes, Arc::new(SystemClock))
    }

    pub fn with_clock(quota_bytes: u64, clock: Arc<dyn Clock>) -> Self {
        Self { quota_bytes, clock }
    }

    pub fn predict(&self, used_bytes: u64) -> Prediction {
        let today = self.clock.now().date_naive();
        let elapsed = today.day().max(1) as f64;
        let projected = used_bytes as f64 * days_in_month(today) as f64 / elapsed;

        let projected_ratio = if self.quota_bytes == 0 {
            if projected > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            projected / self.quota_bytes as f64
        };

        Prediction {
            used_bytes,
            projected_bytes: projected.round() as u64,
            quota_bytes: self.quota_bytes,
            projected_ratio,
            alert: AlertLevel::for_ratio(projected_ratio),
        }
    }

    /// Project a tenant's tracked usage
    pub fn predict_tenant(&self, tracker: &EgressTracker, tenant: &TenantId) -> Prediction {
        self.predict(tracker.bytes(tenant))
    }
}
