//! Hard monthly egress ceiling per tenant

use super::clock::{period_of, Clock, SystemClock};
use conduit_storage::{Result, StorageError, TenantId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Egress quota and pricing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Monthly ceiling applied to every tenant
    pub monthly_limit_bytes: u64,
    /// Per-tenant ceilings overriding the default
    pub tenant_limits: HashMap<String, u64>,
    /// Price of one GiB of egress
    pub cost_per_gib: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            monthly_limit_bytes: 100 * 1024 * 1024 * 1024,
            tenant_limits: HashMap::new(),
            cost_per_gib: 0.09,
        }
    }
}

/// Quota snapshot for one tenant
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub tenant: TenantId,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
}

/// Per-tenant monthly egress ceiling
///
/// `allow_egress` admits the whole request or nothing. Counters of every
/// tenant reset together when the calendar month changes.
pub struct BandwidthQuota {
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
    period: Mutex<(i32, u32)>,
    used: DashMap<TenantId, u64>,
}

impl BandwidthQuota {
    pub fn new(config: QuotaConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(mut config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        let period = period_of(clock.now());
        // Tenant ids are lowercase
        config.tenant_limits = config
            .tenant_limits
            .into_iter()
            .map(|(tenant, limit)| (tenant.to_ascii_lowercase(), limit))
            .collect();
        Self {
            config,
            clock,
            period: Mutex::new(period),
            used: DashMap::new(),
        }
    }

    /// Ceiling for `tenant`
    pub fn limit(&self, tenant: &TenantId) -> u64 {
        self.config
            .tenant_limits
            .get(tenant.as_str())
            .copied()
            .unwrap_or(self.config.monthly_limit_bytes)
    }

    /// Check and record `bytes` of egress in one step
    pub fn allow_egress(&self, tenant: &TenantId, bytes: u64) -> Result<()> {
        self.roll_period();
        let limit = self.limit(tenant);
        let mut used = self.used.entry(tenant.clone()).or_insert(0);
        let remaining = limit.saturating_sub(*used);
        if bytes > remaining {
            debug!(%tenant, requested = bytes, remaining, "egress rejected");
            return Err(StorageError::QuotaExceeded {
                tenant: tenant.to_string(),
                requested: bytes,
                remaining,
            });
        }
        *used += bytes;
        Ok(())
    }

    pub fn used(&self, tenant: &TenantId) -> u64 {
        self.roll_period();
        self.used.get(tenant).map(|u| *u).unwrap_or(0)
    }

    pub fn remaining(&self, tenant: &TenantId) -> u64 {
        self.limit(tenant).saturating_sub(self.used(tenant))
    }

    pub fn usage(&self, tenant: &TenantId) -> QuotaUsage {
        let used = self.used(tenant);
        let limit = self.limit(tenant);
        QuotaUsage {
            tenant: tenant.clone(),
            used,
            limit,
            remaining: limit.saturating_sub(used),
        }
    }

    /// Zero every tenant's counter
    pub fn reset(&self) {
        self.used.clear();
    }

    fn roll_period(&self) {
        let current = period_of(self.clock.now());
        let mut period = self.period.lock();
        if *period != current {
            self.used.clear();
            info!(year = current.0, month = current.1, "egress quota period reset");
            *period = current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::ManualClock;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn tenant(id: &str) -> TenantId {
        id.parse().unwrap()
    }

    fn quota(limit: u64) -> BandwidthQuota {
        BandwidthQuota::new(QuotaConfig {
            monthly_limit_bytes: limit,
            ..QuotaConfig::default()
        })
    }

    #[test]
    fn test_admits_up_to_limit_and_never_partially() {
        let q = quota(100);
        let t1 = tenant("t1");
        q.allow_egress(&t1, 60).unwrap();
        let err = q.allow_egress(&t1, 50).unwrap_err();
        assert!(matches!(
            err,
            StorageError::QuotaExceeded { requested: 50, remaining: 40, .. }
        ));
        // The rejected call consumed nothing
        assert_eq!(q.used(&t1), 60);
        q.allow_egress(&t1, 40).unwrap();
        assert_eq!(q.remaining(&t1), 0);
    }

    #[test]
    fn test_tenants_are_independent() {
        let q = quota(10);
        q.allow_egress(&tenant("t1"), 10).unwrap();
        q.allow_egress(&tenant("t2"), 10).unwrap();
        assert!(q.allow_egress(&tenant("t1"), 1).is_err());
    }

    #[test]
    fn test_tenant_override() {
        let mut config = QuotaConfig {
            monthly_limit_bytes: 10,
            ..QuotaConfig::default()
        };
        config.tenant_limits.insert("big".into(), 1_000);
        config.tenant_limits.insert("Mixed".into(), 500);
        let q = BandwidthQuota::new(config);
        assert_eq!(q.limit(&tenant("big")), 1_000);
        assert_eq!(q.limit(&tenant("MIXED")), 500);
        assert_eq!(q.limit(&tenant("small")), 10);
    }

    #[test]
    fn test_resets_on_month_boundary() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 0).unwrap()));
        let q = BandwidthQuota::with_clock(
            QuotaConfig {
                monthly_limit_bytes: 100,
                ..QuotaConfig::default()
            },
            clock.clone(),
        );
        let t1 = tenant("t1");
        q.allow_egress(&t1, 100).unwrap();
        assert!(q.allow_egress(&t1, 1).is_err());

        clock.advance(Duration::minutes(2));
        assert_eq!(q.used(&t1), 0);
        q.allow_egress(&t1, 100).unwrap();
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let q = Arc::new(quota(1_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    (0..500).filter(|_| q.allow_egress(&tenant("t1"), 3).is_ok()).count() as u64
                })
            })
            .collect();
        let admitted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted * 3, q.used(&tenant("t1")));
        assert!(q.used(&tenant("t1")) <= 1_000);
    }

    proptest! {
        #[test]
        fn prop_used_plus_remaining_is_limit(limit in 0u64..10_000, requests in prop::collection::vec(0u64..2_000, 0..50)) {
            let q = quota(limit);
            let t = tenant("t1");
            for bytes in requests {
                let before = q.used(&t);
                match q.allow_egress(&t, bytes) {
                    Ok(()) => prop_assert_eq!(q.used(&t), before + bytes),
                    Err(_) => prop_assert_eq!(q.used(&t), before),
                }
                prop_assert!(q.used(&t) <= limit);
                prop_assert_eq!(q.used(&t) + q.remaining(&t), limit);
            }
        }
    }
}
