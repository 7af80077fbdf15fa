//! Diff of freshly discovered routes against the persisted endpoint set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::debug;

use super::fingerprint::fingerprint;
use crate::endpoint::{
    ChangeType, ChangelogEntry, DiscoveredEndpoint, Endpoint, EndpointHeader, EndpointKey,
    EndpointParameter, RuleStatus, VersionSnapshot,
};
use crate::error::{Result, RouteguardError};
use crate::store::PersistedState;

/// How the discovered route set relates to the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileOutcome {
    /// Nothing was stored before; every route became a new endpoint.
    FirstRun,
    /// The fingerprint matched the latest snapshot.
    Same,
    /// Routes changed; a changelog was produced and rules were merged forward.
    Different,
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileOutcome::FirstRun => "FIRST_RUN",
            ReconcileOutcome::Same => "SAME",
            ReconcileOutcome::Different => "DIFFERENT",
        };
        f.write_str(s)
    }
}

/// Result of planning one reconciliation run.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub outcome: ReconcileOutcome,
    pub changelog: Vec<ChangelogEntry>,
    /// State to commit, or `None` when nothing changed.
    pub next_state: Option<PersistedState>,
}

/// A detected drift, before it is given a changelog id.
struct Drift {
    change_type: ChangeType,
    target: EndpointKey,
    detail: Option<String>,
}

impl Drift {
    fn new(change_type: ChangeType, target: EndpointKey) -> Self {
        Self {
            change_type,
            target,
            detail: None,
        }
    }
}

/// Plan a reconciliation of `discovered` against `stored`.
///
/// This never mutates `stored`; the caller commits `next_state` as one
/// transaction.
pub fn reconcile(
    discovered: &[DiscoveredEndpoint],
    stored: &PersistedState,
    now: DateTime<Utc>,
) -> Result<Reconciliation> {
    let discovered_by_key = index_discovered(discovered)?;
    let full_hash = fingerprint(discovered);

    if stored.endpoints.is_empty() {
        return Ok(first_run(discovered_by_key, stored, full_hash, now));
    }

    let baseline = stored.latest_snapshot().ok_or_else(|| {
        RouteguardError::MalformedState(format!(
            "{} stored endpoints but no version snapshot",
            stored.endpoints.len()
        ))
    })?;
    check_stored_keys(stored)?;

    if baseline.full_hash == full_hash {
        return Ok(Reconciliation {
            outcome: ReconcileOutcome::Same,
            changelog: Vec::new(),
            next_state: None,
        });
    }

    let mut next = stored.clone();
    let mut drifts = Vec::new();
    let mut seen: HashSet<EndpointKey> = HashSet::with_capacity(next.endpoints.len());

    for endpoint in &mut next.endpoints {
        let key = endpoint.key();
        match discovered_by_key.get(&key) {
            None => {
                if let Some(drift) = mark_removed(endpoint) {
                    drifts.push(drift);
                }
            }
            Some(found) => {
                if endpoint.removed {
                    endpoint.removed = false;
                    drifts.push(Drift::new(ChangeType::ApiAdded, key.clone()));
                }
                drifts.extend(merge_attributes(endpoint, found));
            }
        }
        seen.insert(key);
    }

    for (key, found) in &discovered_by_key {
        if seen.contains(key) {
            continue;
        }
        let id = next.allocate_endpoint_id();
        next.endpoints.push(Endpoint::from_discovered(id, found));
        drifts.push(Drift::new(ChangeType::ApiAdded, key.clone()));
    }

    let changelog: Vec<ChangelogEntry> = drifts
        .into_iter()
        .map(|drift| {
            let id = next.allocate_changelog_id();
            debug!(
                id = id,
                change_type = %drift.change_type,
                target = %drift.target,
                "Route drift detected"
            );
            match drift.detail {
                Some(detail) => ChangelogEntry::with_detail(id, drift.change_type, &drift.target, detail),
                None => ChangelogEntry::new(id, drift.change_type, &drift.target),
            }
        })
        .collect();

    next.snapshots.push(VersionSnapshot {
        full_hash,
        date_of_version: now,
        changelog: changelog.clone(),
    });

    Ok(Reconciliation {
        outcome: ReconcileOutcome::Different,
        changelog,
        next_state: Some(next),
    })
}

fn first_run(
    discovered_by_key: BTreeMap<EndpointKey, &DiscoveredEndpoint>,
    stored: &PersistedState,
    full_hash: String,
    now: DateTime<Utc>,
) -> Reconciliation {
    let mut next = stored.clone();
    for found in discovered_by_key.values() {
        let id = next.allocate_endpoint_id();
        next.endpoints.push(Endpoint::from_discovered(id, found));
    }
    next.snapshots.push(VersionSnapshot {
        full_hash,
        date_of_version: now,
        changelog: Vec::new(),
    });

    Reconciliation {
        outcome: ReconcileOutcome::FirstRun,
        changelog: Vec::new(),
        next_state: Some(next),
    }
}

/// Index discovered routes by identity, rejecting ambiguous duplicates.
fn index_discovered(
    discovered: &[DiscoveredEndpoint],
) -> Result<BTreeMap<EndpointKey, &DiscoveredEndpoint>> {
    let mut by_key = BTreeMap::new();
    for endpoint in discovered {
        if by_key.insert(endpoint.key(), endpoint).is_some() {
            return Err(RouteguardError::DuplicateRoute(endpoint.key().to_string()));
        }
    }
    Ok(by_key)
}

fn check_stored_keys(stored: &PersistedState) -> Result<()> {
    let mut keys = HashSet::with_capacity(stored.endpoints.len());
    for endpoint in &stored.endpoints {
        if !keys.insert(endpoint.key()) {
            return Err(RouteguardError::MalformedState(format!(
                "endpoint {} is stored more than once",
                endpoint.key()
            )));
        }
    }
    Ok(())
}

/// Logically remove an endpoint whose route is gone. Returns the drift to
/// record, or `None` if it was already removed by an earlier run.
fn mark_removed(endpoint: &mut Endpoint) -> Option<Drift> {
    if endpoint.removed {
        return None;
    }
    endpoint.removed = true;

    let change_type = if endpoint.rule.is_active() {
        endpoint.rule.status = RuleStatus::Inactive;
        endpoint.rule_revision += 1;
        ChangeType::EnabledEndpointWasDeleted
    } else {
        ChangeType::ApiDeleted
    };
    Some(Drift::new(change_type, endpoint.key()))
}

/// Replace the endpoint's parameters and headers with the discovered ones,
/// carrying `enabled` flags forward by name.
///
/// An enabled parameter or header that vanished deactivates the rule and
/// yields one drift per vanished name.
fn merge_attributes(endpoint: &mut Endpoint, found: &DiscoveredEndpoint) -> Vec<Drift> {
    let key = endpoint.key();
    let mut drifts = Vec::new();

    let enabled_params: HashMap<&str, &EndpointParameter> = endpoint
        .enabled_parameters()
        .map(|p| (p.name.as_str(), p))
        .collect();
    let declared_params: HashSet<&str> = found.parameters.iter().map(|p| p.name.as_str()).collect();
    for (name, parameter) in &enabled_params {
        if !declared_params.contains(name) {
            let param_type = parameter
                .param_type
                .map(|t| format!(" ({})", t))
                .unwrap_or_default();
            drifts.push(Drift {
                change_type: ChangeType::EnabledParameterWasDeleted,
                target: key.clone(),
                detail: Some(format!(
                    "{} Rate limiting stopped because enabled parameter '{}'{} was not found.",
                    ChangeType::EnabledParameterWasDeleted.description(),
                    name,
                    param_type
                )),
            });
        }
    }

    // Header names are case-insensitive.
    let enabled_headers: HashMap<String, &str> = endpoint
        .enabled_headers()
        .map(|h| (h.name.to_ascii_lowercase(), h.name.as_str()))
        .collect();
    let declared_headers: HashSet<String> = found.headers.iter().map(|h| h.to_ascii_lowercase()).collect();
    for (folded, name) in &enabled_headers {
        if !declared_headers.contains(folded) {
            drifts.push(Drift {
                change_type: ChangeType::EnabledParameterWasDeleted,
                target: key.clone(),
                detail: Some(format!(
                    "{} Rate limiting stopped because enabled header '{}' was not found.",
                    ChangeType::EnabledParameterWasDeleted.description(),
                    name
                )),
            });
        }
    }

    // HashMap iteration order is arbitrary; keep the changelog stable.
    drifts.sort_by(|a, b| a.detail.cmp(&b.detail));

    let parameters = found
        .parameters
        .iter()
        .map(|p| EndpointParameter {
            name: p.name.clone(),
            param_type: p.param_type,
            enabled: enabled_params.contains_key(p.name.as_str()),
        })
        .collect();
    let headers = found
        .headers
        .iter()
        .map(|name| EndpointHeader {
            name: name.clone(),
            enabled: enabled_headers.contains_key(&name.to_ascii_lowercase()),
        })
        .collect();

    endpoint.parameters = parameters;
    endpoint.headers = headers;
    endpoint.descriptor.is_pattern_path = found.descriptor.is_pattern_path;

    if !drifts.is_empty() && endpoint.rule.is_active() {
        endpoint.rule.status = RuleStatus::Inactive;
        endpoint.rule_revision += 1;
    }

    drifts
}
