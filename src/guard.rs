//! The guard: the one object a host application talks to.
//!
//! It ties the rule store, the admission controller, and the clock together.
//! Requests are checked against the current rule snapshot; configuration
//! changes go through the store and clear any counters they invalidate.

use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::GuardConfig;
use crate::endpoint::{ChangelogEntry, DiscoveredEndpoint, Endpoint, EndpointId, EndpointKey, RuleUpdate};
use crate::error::Result;
use crate::ratelimit::{
    resolve_client_ip, AdmissionController, Clock, Decision, DimensionKey, EndpointMetrics,
};
use crate::reconcile::{Reconciliation, RouteManifest};
use crate::store::{Repository, RuleSet, RuleStore};

/// An inbound request, as seen by the guard.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub endpoint_id: EndpointId,
    /// Peer address of the connection.
    pub client_ip: String,
    pub parameters: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    /// Arrival time; the guard's clock is used when unset.
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundRequest {
    pub fn new(endpoint_id: EndpointId, client_ip: impl Into<String>) -> Self {
        Self {
            endpoint_id,
            client_ip: client_ip.into(),
            parameters: HashMap::new(),
            headers: HashMap::new(),
            timestamp: None,
        }
    }

    pub fn with_parameter(mut self, name: &str, value: &str) -> Self {
        self.parameters.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

pub struct Guard<R: Repository> {
    rules: RuleStore<R>,
    admission: AdmissionController,
    clock: Arc<dyn Clock>,
    trust_forwarded_headers: bool,
}

impl<R: Repository> Guard<R> {
    pub fn new(rules: RuleStore<R>, clock: Arc<dyn Clock>, config: &GuardConfig) -> Self {
        Self {
            rules,
            admission: AdmissionController::with_shards(config.counter_shards),
            clock,
            trust_forwarded_headers: config.trust_forwarded_headers,
        }
    }

    /// Decide whether a request may proceed.
    ///
    /// Never fails: a request for an endpoint with no resolvable rule is
    /// admitted.
    pub fn check(&self, request: &InboundRequest) -> Decision {
        let rules = self.rules.snapshot();
        let Some(endpoint) = rules.get(request.endpoint_id) else {
            warn!(
                endpoint_id = %request.endpoint_id,
                "No rule for endpoint, admitting request"
            );
            return Decision::Allow;
        };
        if !endpoint.rule.is_active() {
            return Decision::Allow;
        }

        let client_ip = if self.trust_forwarded_headers {
            Cow::Owned(resolve_client_ip(&request.headers, &request.client_ip))
        } else {
            Cow::Borrowed(request.client_ip.as_str())
        };
        let dimension = DimensionKey::for_request(endpoint, &client_ip, &request.parameters, &request.headers);
        let now = request.timestamp.unwrap_or_else(|| self.clock.now());

        self.admission.admit(endpoint, &dimension, now)
    }

    /// Map a matched route to its endpoint id.
    pub fn find_endpoint(&self, key: &EndpointKey) -> Option<EndpointId> {
        self.rules.snapshot().find(key).map(|e| e.id)
    }

    /// Apply a rule update. Counters and bans for the endpoint are dropped.
    pub fn update_rule(&self, id: EndpointId, update: &RuleUpdate) -> Result<Arc<Endpoint>> {
        let before = self.rules.snapshot();
        let endpoint = self.rules.update_rule(id, update)?;
        self.forget_changed(&before);
        Ok(endpoint)
    }

    /// Reconcile discovered routes at the current time.
    ///
    /// Counters of endpoints whose rule or attributes changed are dropped.
    pub fn reconcile(&self, discovered: &[DiscoveredEndpoint]) -> Result<Reconciliation> {
        let before = self.rules.snapshot();
        let result = self.rules.reconcile(discovered, self.clock.now())?;
        self.forget_changed(&before);
        Ok(result)
    }

    /// Pick up rule changes committed by another process.
    pub fn reload(&self) -> Result<bool> {
        let before = self.rules.snapshot();
        let reloaded = self.rules.reload()?;
        self.forget_changed(&before);
        Ok(reloaded)
    }

    /// Allowed and denied request totals for an endpoint.
    pub fn endpoint_metrics(&self, id: EndpointId) -> EndpointMetrics {
        self.admission.endpoint_metrics(id)
    }

    fn forget_changed(&self, before: &Arc<RuleSet>) {
        let after = self.rules.snapshot();
        if Arc::ptr_eq(before, &after) {
            return;
        }
        for id in changed_endpoints(before, &after) {
            self.admission.forget_endpoint(id);
        }
    }

    pub fn resolve_changelog(&self, id: u64) -> Result<()> {
        self.rules.resolve_changelog(id)
    }

    pub fn changelog(&self, unresolved_only: bool) -> Vec<ChangelogEntry> {
        self.rules.changelog(unresolved_only)
    }

    pub fn rules(&self) -> &RuleStore<R> {
        &self.rules
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }
}

impl<R: Repository + 'static> Guard<R> {
    /// Re-read the route manifest every `interval` and reconcile it, until a
    /// shutdown message arrives.
    ///
    /// A manifest that cannot be read or reconciled is logged and skipped;
    /// the current rules stay in force.
    pub async fn rescan(
        self: Arc<Self>,
        routes_path: PathBuf,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(path = %routes_path.display(), interval = ?interval, "Starting route re-scan task");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; startup already reconciled.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = RouteManifest::from_file(&routes_path)
                        .and_then(|manifest| self.reconcile(&manifest.endpoints));
                    match outcome {
                        Ok(result) => debug!(outcome = %result.outcome, "Re-scan complete"),
                        Err(e) => {
                            error!(error = %e, "Route re-scan failed");
                            // Rule changes made by other processes still apply.
                            if let Err(e) = self.reload() {
                                error!(error = %e, "Rule reload failed");
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Route re-scan task shutting down");
                    break;
                }
            }
        }
    }
}

/// Endpoints whose rule, attributes, or liveness differ between two rule sets.
fn changed_endpoints(before: &RuleSet, after: &RuleSet) -> Vec<EndpointId> {
    after
        .iter()
        .filter(|current| match before.get(current.id) {
            Some(was) => {
                was.rule != current.rule
                    || was.rule_revision != current.rule_revision
                    || was.removed != current.removed
                    || was.parameters != current.parameters
                    || was.headers != current.headers
            }
            None => false,
        })
        .map(|e| e.id)
        .collect()
}
