//! Admission controller: the concurrent store of per-key counters.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use super::counter::{CounterState, Decision};
use super::key::{CounterKey, DimensionKey};
use crate::endpoint::{Endpoint, EndpointId};

/// Default number of counter shards.
pub const DEFAULT_SHARDS: usize = 64;

/// A key's counter, tagged with the rule revision it was created under.
#[derive(Debug, Clone, Copy)]
struct CounterSlot {
    rule_revision: u64,
    state: CounterState,
}

impl CounterSlot {
    fn new(rule_revision: u64, now: DateTime<Utc>) -> Self {
        Self {
            rule_revision,
            state: CounterState::new(now),
        }
    }
}

/// Running admission totals for one endpoint.
#[derive(Debug, Default)]
struct EndpointStats {
    allowed: AtomicU64,
    denied: AtomicU64,
}

/// Point-in-time copy of an endpoint's admission totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EndpointMetrics {
    pub allowed: u64,
    pub denied: u64,
}

/// Decides whether each request is admitted.
///
/// Counters are held in a sharded map. Updating a key holds its shard's
/// write lock for the whole read, decide, and write, so requests for the same
/// key are serialized while unrelated keys proceed in parallel.
pub struct AdmissionController {
    counters: DashMap<CounterKey, CounterSlot>,
    stats: DashMap<EndpointId, EndpointStats>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// `shards` must be a power of two greater than one.
    pub fn with_shards(shards: usize) -> Self {
        Self {
            counters: DashMap::with_shard_amount(shards),
            stats: DashMap::with_shard_amount(shards),
        }
    }

    /// Record a request against `endpoint` for the given dimension and decide
    /// it.
    ///
    /// Endpoints without an active rule are always admitted and never
    /// tracked. A counter left over from an older rule revision is discarded;
    /// a caller still holding an older revision than the counter's is
    /// admitted without touching it.
    pub fn admit(&self, endpoint: &Endpoint, dimension: &DimensionKey, now: DateTime<Utc>) -> Decision {
        if !endpoint.rule.is_active() {
            return Decision::Allow;
        }

        let key = CounterKey::new(endpoint.id, dimension.clone());
        let revision = endpoint.rule_revision;
        let decision = {
            let mut slot = self
                .counters
                .entry(key.clone())
                .or_insert_with(|| CounterSlot::new(revision, now));
            if slot.rule_revision < revision {
                *slot = CounterSlot::new(revision, now);
            }
            if slot.rule_revision > revision {
                trace!(key = %key, revision = revision, "Stale rule revision, admitting");
                Decision::Allow
            } else {
                slot.state.admit(&endpoint.rule, now)
            }
        };

        let stats = self.stats.entry(endpoint.id).or_default();
        match decision {
            Decision::Allow => {
                stats.allowed.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "Request admitted");
            }
            Decision::Deny(retry_after) => {
                stats.denied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %key,
                    endpoint = %endpoint.key(),
                    retry_after = ?retry_after,
                    "Request denied"
                );
            }
        }
        decision
    }

    /// Current state for a key, if it is tracked.
    pub fn counter_state(&self, endpoint: EndpointId, dimension: &DimensionKey) -> Option<CounterState> {
        self.counters
            .get(&CounterKey::new(endpoint, dimension.clone()))
            .map(|slot| slot.state)
    }

    /// Allowed and denied totals for an endpoint since it was last forgotten.
    pub fn endpoint_metrics(&self, endpoint: EndpointId) -> EndpointMetrics {
        self.stats
            .get(&endpoint)
            .map(|stats| EndpointMetrics {
                allowed: stats.allowed.load(Ordering::Relaxed),
                denied: stats.denied.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    /// Drop all counters, bans, and totals for one endpoint.
    pub fn forget_endpoint(&self, endpoint: EndpointId) {
        self.counters.retain(|key, _| key.endpoint != endpoint);
        self.stats.remove(&endpoint);
        debug!(endpoint = %endpoint, "Cleared counters");
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }

    pub fn clear(&self) {
        self.counters.clear();
        self.stats.clear();
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{DiscoveredEndpoint, HttpMethod, RuleUpdate};
    use crate::ratelimit::RetryAfter;
    use chrono::TimeDelta;
    use std::collections::HashMap;
    use std::sync::Barrier;

    fn endpoint(id: u64, update: Option<RuleUpdate>) -> Endpoint {
        let discovered = DiscoveredEndpoint::new("/orders", HttpMethod::Post, "Orders.create(Order)");
        let endpoint = Endpoint::from_discovered(EndpointId(id), &discovered);
        match update {
            Some(update) => endpoint.with_rule(&update).unwrap(),
            None => endpoint,
        }
    }

    fn dimension(ep: &Endpoint, ip: &str) -> DimensionKey {
        DimensionKey::for_request(ep, ip, &HashMap::new(), &HashMap::new())
    }

    #[test]
    fn test_controller_creation() {
        let controller = AdmissionController::new();
        assert_eq!(controller.tracked_keys(), 0);
    }

    #[test]
    fn test_unconfigured_endpoint_is_not_tracked() {
        let controller = AdmissionController::new();
        let ep = endpoint(1, None);
        let key = dimension(&ep, "10.0.0.1");

        for _ in 0..100 {
            assert_eq!(controller.admit(&ep, &key, Utc::now()), Decision::Allow);
        }
        assert_eq!(controller.tracked_keys(), 0);
    }

    #[test]
    fn test_inactive_endpoint_is_not_tracked() {
        let controller = AdmissionController::new();
        let update = RuleUpdate::ip_based(1, 60, 60).with_status(crate::endpoint::RuleStatus::Inactive);
        let ep = endpoint(1, Some(update));
        let key = dimension(&ep, "10.0.0.1");

        for _ in 0..5 {
            assert!(controller.admit(&ep, &key, Utc::now()).is_allowed());
        }
        assert_eq!(controller.tracked_keys(), 0);
    }

    #[test]
    fn test_limit_then_ban() {
        let controller = AdmissionController::new();
        let ep = endpoint(1, Some(RuleUpdate::ip_based(5, 60, 120)));
        let key = dimension(&ep, "10.0.0.1");
        let now = Utc::now();

        for _ in 0..5 {
            assert!(controller.admit(&ep, &key, now).is_allowed());
        }
        assert_eq!(controller.admit(&ep, &key, now), Decision::Deny(RetryAfter::Seconds(120)));
        assert!(controller.counter_state(ep.id, &key).unwrap().is_banned());

        let after = now + TimeDelta::seconds(121);
        assert!(controller.admit(&ep, &key, after).is_allowed());
    }

    #[test]
    fn test_keys_are_independent() {
        let controller = AdmissionController::new();
        let ep = endpoint(1, Some(RuleUpdate::ip_based(1, 60, 60)));
        let a = dimension(&ep, "10.0.0.1");
        let b = dimension(&ep, "10.0.0.2");
        let now = Utc::now();

        assert!(controller.admit(&ep, &a, now).is_allowed());
        assert!(!controller.admit(&ep, &a, now).is_allowed());
        assert!(controller.admit(&ep, &b, now).is_allowed());
    }

    #[test]
    fn test_endpoints_have_separate_counters() {
        let controller = AdmissionController::new();
        let first = endpoint(1, Some(RuleUpdate::ip_based(1, 60, 60)));
        let second = endpoint(2, Some(RuleUpdate::ip_based(1, 60, 60)));
        let key = dimension(&first, "10.0.0.1");
        let now = Utc::now();

        assert!(controller.admit(&first, &key, now).is_allowed());
        assert!(controller.admit(&second, &key, now).is_allowed());
        assert_eq!(controller.tracked_keys(), 2);
    }

    #[test]
    fn test_forget_endpoint_lifts_bans() {
        let controller = AdmissionController::new();
        let first = endpoint(1, Some(RuleUpdate::ip_based(1, 60, 60).permanent()));
        let second = endpoint(2, Some(RuleUpdate::ip_based(1, 60, 60)));
        let key = dimension(&first, "10.0.0.1");
        let now = Utc::now();

        controller.admit(&first, &key, now);
        controller.admit(&first, &key, now);
        controller.admit(&second, &key, now);
        assert_eq!(controller.admit(&first, &key, now), Decision::Deny(RetryAfter::Permanent));

        controller.forget_endpoint(first.id);
        assert_eq!(controller.tracked_keys(), 1);
        assert!(controller.admit(&first, &key, now).is_allowed());
    }

    #[test]
    fn test_concurrent_requests_admit_exactly_limit() {
        const LIMIT: u32 = 10;
        const THREADS: usize = 32;
        const PER_THREAD: usize = 8;

        let controller = AdmissionController::with_shards(4);
        let ep = endpoint(1, Some(RuleUpdate::ip_based(LIMIT, 60, 60)));
        let key = dimension(&ep, "10.0.0.1");
        let now = Utc::now();
        let barrier = Barrier::new(THREADS);

        let allowed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        (0..PER_THREAD)
                            .filter(|_| controller.admit(&ep, &key, now).is_allowed())
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(allowed, LIMIT as usize);
    }

    #[test]
    fn test_endpoint_metrics_count_decisions() {
        let controller = AdmissionController::new();
        let ep = endpoint(1, Some(RuleUpdate::ip_based(2, 60, 60)));
        let other = endpoint(2, Some(RuleUpdate::ip_based(2, 60, 60)));
        let a = dimension(&ep, "10.0.0.1");
        let b = dimension(&ep, "10.0.0.2");
        let now = Utc::now();

        for _ in 0..4 {
            controller.admit(&ep, &a, now);
        }
        controller.admit(&ep, &b, now);
        controller.admit(&other, &a, now);

        assert_eq!(controller.endpoint_metrics(ep.id), EndpointMetrics { allowed: 3, denied: 2 });
        assert_eq!(controller.endpoint_metrics(other.id), EndpointMetrics { allowed: 1, denied: 0 });

        controller.forget_endpoint(ep.id);
        assert_eq!(controller.endpoint_metrics(ep.id), EndpointMetrics::default());
        assert_eq!(controller.endpoint_metrics(other.id).allowed, 1);
    }

    #[test]
    fn test_unconfigured_endpoint_has_no_metrics() {
        let controller = AdmissionController::new();
        let ep = endpoint(1, None);
        controller.admit(&ep, &dimension(&ep, "10.0.0.1"), Utc::now());

        assert_eq!(controller.endpoint_metrics(ep.id), EndpointMetrics::default());
    }

    #[test]
    fn test_ban_from_older_rule_revision_is_discarded() {
        let controller = AdmissionController::new();
        let old = endpoint(1, Some(RuleUpdate::ip_based(1, 60, 60).permanent()));
        let new = old.with_rule(&RuleUpdate::ip_based(5, 60, 60)).unwrap();
        let key = dimension(&old, "10.0.0.1");
        let now = Utc::now();

        // A check that read the old rule lands after the update cleared state.
        controller.forget_endpoint(old.id);
        controller.admit(&old, &key, now);
        assert_eq!(controller.admit(&old, &key, now), Decision::Deny(RetryAfter::Permanent));

        assert!(controller.admit(&new, &key, now).is_allowed());
        assert!(!controller.counter_state(new.id, &key).unwrap().is_banned());
    }

    #[test]
    fn test_older_revision_does_not_touch_newer_counter() {
        let controller = AdmissionController::new();
        let old = endpoint(1, Some(RuleUpdate::ip_based(1, 60, 60).permanent()));
        let new = old.with_rule(&RuleUpdate::ip_based(2, 60, 60)).unwrap();
        let key = dimension(&old, "10.0.0.1");
        let now = Utc::now();

        assert!(controller.admit(&new, &key, now).is_allowed());
        for _ in 0..3 {
            assert!(controller.admit(&old, &key, now).is_allowed());
        }
        assert!(controller.admit(&new, &key, now).is_allowed());
        assert!(!controller.admit(&new, &key, now).is_allowed());
    }

    #[test]
    fn test_clear_counters() {
        let controller = AdmissionController::new();
        let ep = endpoint(1, Some(RuleUpdate::ip_based(5, 60, 60)));
        let key = dimension(&ep, "10.0.0.1");

        controller.admit(&ep, &key, Utc::now());
        assert_eq!(controller.tracked_keys(), 1);

        controller.clear();
        assert_eq!(controller.tracked_keys(), 0);
    }
}
