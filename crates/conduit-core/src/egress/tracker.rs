//! Per-tenant egress accounting

use super::clock::{period_of, Clock, SystemClock};
use chrono::NaiveDate;
use conduit_storage::TenantId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Egress of one tenant in the current month
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TenantEgress {
    pub bytes: u64,
    pub cost: f64,
    /// Bytes served per calendar day
    pub daily: BTreeMap<NaiveDate, u64>,
}

/// Accumulates egress bytes and derived cost per tenant
///
/// Independent of [`BandwidthQuota`](super::BandwidthQuota); nothing here is
/// ever rejected.
pub struct EgressTracker {
    cost_per_gib: f64,
    clock: Arc<dyn Clock>,
    period: Mutex<(i32, u32)>,
    tenants: DashMap<TenantId, TenantEgress>,
}

impl EgressTracker {
    pub fn new(cost_per_gib: f64) -> Self {
        Self::with_clock(cost_per_gib, Arc::new(SystemClock))
    }

    pub fn with_clock(cost_per_gib: f64, clock: Arc<dyn Clock>) -> Self {
        let period = period_of(clock.now());
        Self {
            cost_per_gib,
            clock,
            period: Mutex::new(period),
            tenants: DashMap::new(),
        }
    }

    /// Cost of `bytes` of egress
    pub fn cost_of(&self, bytes: u64) -> f64 {
        bytes as f64 / BYTES_PER_GIB * self.cost_per_gib
    }

    pub fn record(&self, tenant: &TenantId, bytes: u64) {
        let now = self.clock.now();
        self.roll_period(period_of(now));
        let cost = self.cost_of(bytes);
        let mut entry = self.tenants.entry(tenant.clone()).or_default();
        entry.bytes += bytes;
        entry.cost += cost;
        *entry.daily.entry(now.date_naive()).or_insert(0) += bytes;
    }

    pub fn usage(&self, tenant: &TenantId) -> TenantEgress {
        self.roll_period(period_of(self.clock.now()));
        self.tenants.get(tenant).map(|e| e.clone()).unwrap_or_default()
    }

    pub fn bytes(&self, tenant: &TenantId) -> u64 {
        self.usage(tenant).bytes
    }

    /// Tenants with recorded egress this month
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.tenants.iter().map(|e| e.key().clone()).collect();
        tenants.sort();
        tenants
    }

    pub fn total_bytes(&self) -> u64 {
        self.tenants.iter().map(|e| e.bytes).sum()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn roll_period(&self, current: (i32, u32)) {
        let mut period = self.period.lock();
        if *period != current {
            self.tenants.clear();
            *period = current;
        }
    }
}
