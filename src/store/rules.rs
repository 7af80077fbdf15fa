//! The rule store: the live, read-mostly view of every endpoint's rule.
//!
//! Readers take an `Arc<RuleSet>` snapshot and never observe a partially
//! applied change. Writers (reconciliation, rule updates, changelog
//! acknowledgment) are serialized, re-read the repository so that changes
//! committed by another process are built upon rather than overwritten,
//! commit the full next state through the [`Repository`], and only then swap
//! the snapshot.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::repository::{PersistedState, Repository};
use crate::endpoint::{
    ChangelogEntry, DiscoveredEndpoint, Endpoint, EndpointId, EndpointKey, RuleUpdate,
    VersionSnapshot,
};
use crate::error::{Result, RouteguardError};
use crate::reconcile::{reconcile, Reconciliation};

/// An immutable view of all endpoints and their rules.
#[derive(Debug, Default)]
pub struct RuleSet {
    endpoints: HashMap<EndpointId, Arc<Endpoint>>,
    /// Live (not removed) endpoints by identity.
    by_key: HashMap<EndpointKey, EndpointId>,
}

impl RuleSet {
    fn from_state(state: &PersistedState) -> Self {
        let mut endpoints = HashMap::with_capacity(state.endpoints.len());
        let mut by_key = HashMap::with_capacity(state.endpoints.len());
        for endpoint in &state.endpoints {
            if !endpoint.removed {
                by_key.insert(endpoint.key(), endpoint.id);
            }
            endpoints.insert(endpoint.id, Arc::new(endpoint.clone()));
        }
        Self { endpoints, by_key }
    }

    pub fn get(&self, id: EndpointId) -> Option<&Arc<Endpoint>> {
        self.endpoints.get(&id)
    }

    /// Look up a live endpoint by identity.
    pub fn find(&self, key: &EndpointKey) -> Option<&Arc<Endpoint>> {
        self.by_key.get(key).and_then(|id| self.endpoints.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.endpoints.values()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

pub struct RuleStore<R: Repository> {
    repository: R,
    /// Last committed state; its lock serializes writers.
    state: Mutex<PersistedState>,
    rules: RwLock<Arc<RuleSet>>,
}

impl<R: Repository> RuleStore<R> {
    /// Load the committed state and build the initial rule set.
    pub fn open(repository: R) -> Result<Self> {
        let state = repository.load()?;
        let rules = Arc::new(RuleSet::from_state(&state));
        info!(
            endpoints = state.endpoints.len(),
            snapshots = state.snapshots.len(),
            "Rule store opened"
        );
        Ok(Self {
            repository,
            state: Mutex::new(state),
            rules: RwLock::new(rules),
        })
    }

    /// The current rule set. Cheap; safe to call per request.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    /// Reconcile discovered routes against the stored endpoints and commit
    /// the result as one transaction.
    ///
    /// On any error nothing is committed. The returned value's `next_state`
    /// has already been installed and is `None`.
    pub fn reconcile(&self, discovered: &[DiscoveredEndpoint], now: DateTime<Utc>) -> Result<Reconciliation> {
        let mut state = self.state.lock();
        self.refresh(&mut state)?;
        let mut result = reconcile(discovered, &state, now)?;

        if let Some(next) = result.next_state.take() {
            self.install(&mut state, next)?;
        }

        info!(
            outcome = %result.outcome,
            discovered = discovered.len(),
            changes = result.changelog.len(),
            "Routes reconciled"
        );
        for entry in result.changelog.iter().filter(|e| e.change_type.requires_attention()) {
            warn!(
                id = entry.id,
                change_type = %entry.change_type,
                path = %entry.target_path,
                method = %entry.target_method,
                "Rate limited endpoint changed, rule deactivated until reviewed"
            );
        }

        Ok(result)
    }

    /// Apply a rule update to one endpoint.
    ///
    /// Validation failures are returned before anything is written.
    pub fn update_rule(&self, id: EndpointId, update: &RuleUpdate) -> Result<Arc<Endpoint>> {
        let mut state = self.state.lock();
        self.refresh(&mut state)?;
        let current = state
            .endpoint(id)
            .filter(|e| !e.removed)
            .ok_or(RouteguardError::EndpointNotFound(id))?;
        let updated = current.with_rule(update)?;

        let mut next = state.clone();
        if let Some(slot) = next.endpoint_mut(id) {
            *slot = updated;
        }
        self.install(&mut state, next)?;

        info!(
            endpoint_id = %id,
            status = %update.status,
            ip_based = update.ip_based,
            limit = update.limit_count,
            window_secs = update.window_seconds,
            "Rule updated"
        );

        self.snapshot()
            .get(id)
            .cloned()
            .ok_or(RouteguardError::EndpointNotFound(id))
    }

    /// Mark a changelog entry as acknowledged by an operator.
    pub fn resolve_changelog(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock();
        self.refresh(&mut state)?;
        let mut next = state.clone();
        let entry = next
            .changelog_entry_mut(id)
            .ok_or(RouteguardError::ChangelogNotFound(id))?;
        if entry.is_resolved {
            return Ok(());
        }
        entry.is_resolved = true;
        self.install(&mut state, next)?;

        info!(id = id, "Changelog entry resolved");
        Ok(())
    }

    /// Changelog entries, oldest first.
    pub fn changelog(&self, unresolved_only: bool) -> Vec<ChangelogEntry> {
        self.state
            .lock()
            .changelog()
            .filter(|e| !unresolved_only || !e.is_resolved)
            .cloned()
            .collect()
    }

    /// All stored endpoints, including logically removed ones.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().endpoints.clone()
    }

    pub fn latest_snapshot(&self) -> Option<VersionSnapshot> {
        self.state.lock().latest_snapshot().cloned()
    }

    /// Pick up changes another process committed to the repository.
    ///
    /// Returns whether the rule set was replaced.
    pub fn reload(&self) -> Result<bool> {
        let mut state = self.state.lock();
        self.refresh(&mut state)
    }

    fn refresh(&self, state: &mut PersistedState) -> Result<bool> {
        let stored = self.repository.load()?;
        if stored == *state {
            return Ok(false);
        }
        debug!(
            endpoints = stored.endpoints.len(),
            snapshots = stored.snapshots.len(),
            "Stored state changed, reloading rules"
        );
        *self.rules.write() = Arc::new(RuleSet::from_state(&stored));
        *state = stored;
        Ok(true)
    }

    /// Commit `next`, then publish it. Nothing changes if the commit fails.
    fn install(&self, state: &mut PersistedState, next: PersistedState) -> Result<()> {
        self.repository.commit(&next)?;
        let rules = Arc::new(RuleSet::from_state(&next));
        *state = next;
        *self.rules.write() = rules;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ChangeType, HttpMethod, ParameterType, RuleStatus, RuleViolation};
    use crate::reconcile::ReconcileOutcome;
    use crate::store::{JsonFileRepository, MemoryRepository};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Repository whose commits can be made to fail.
    #[derive(Default)]
    struct FlakyRepository {
        inner: MemoryRepository,
        fail: AtomicBool,
    }

    impl Repository for FlakyRepository {
        fn load(&self) -> Result<PersistedState> {
            self.inner.load()
        }

        fn commit(&self, state: &PersistedState) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RouteguardError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.commit(state)
        }
    }

    fn routes() -> Vec<DiscoveredEndpoint> {
        vec![
            DiscoveredEndpoint::new("/login", HttpMethod::Post, "Auth.login(Login)")
                .with_parameter("username", Some(ParameterType::Body)),
            DiscoveredEndpoint::new("/ping", HttpMethod::Get, "Ping.ping()"),
        ]
    }

    fn id_of(store: &RuleStore<impl Repository>, path: &str) -> EndpointId {
        store
            .endpoints()
            .into_iter()
            .find(|e| e.descriptor.path == path)
            .unwrap()
            .id
    }

    #[test]
    fn test_reconcile_publishes_rule_set() {
        let store = RuleStore::open(MemoryRepository::new()).unwrap();
        assert!(store.snapshot().is_empty());

        let result = store.reconcile(&routes(), Utc::now()).unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::FirstRun);
        assert!(result.next_state.is_none());

        let rules = store.snapshot();
        assert_eq!(rules.len(), 2);
        let key = EndpointKey::new("/ping", HttpMethod::Get, "Ping.ping()");
        assert_eq!(rules.find(&key).unwrap().rule.status, RuleStatus::NotConfigured);
    }

    #[test]
    fn test_rule_set_by_another_process_survives_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let server = RuleStore::open(JsonFileRepository::new(&path)).unwrap();
        server.reconcile(&routes(), Utc::now()).unwrap();

        let operator = RuleStore::open(JsonFileRepository::new(&path)).unwrap();
        let login = id_of(&operator, "/login");
        operator.update_rule(login, &RuleUpdate::ip_based(5, 60, 60)).unwrap();

        let mut discovered = routes();
        discovered.push(DiscoveredEndpoint::new("/new", HttpMethod::Get, "New.get()"));
        let result = server.reconcile(&discovered, Utc::now()).unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Different);

        assert_eq!(server.snapshot().get(login).unwrap().rule.status, RuleStatus::Active);
        let persisted = JsonFileRepository::new(&path).load().unwrap();
        assert_eq!(persisted.endpoint(login).unwrap().rule.status, RuleStatus::Active);
        assert_eq!(persisted.endpoints.len(), 3);
    }

    #[test]
    fn test_reload_picks_up_external_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let server = RuleStore::open(JsonFileRepository::new(&path)).unwrap();
        server.reconcile(&routes(), Utc::now()).unwrap();
        assert!(!server.reload().unwrap());

        let operator = RuleStore::open(JsonFileRepository::new(&path)).unwrap();
        let ping = id_of(&operator, "/ping");
        operator.update_rule(ping, &RuleUpdate::ip_based(1, 1, 1)).unwrap();

        assert!(server.reload().unwrap());
        assert!(server.snapshot().get(ping).unwrap().rule.is_active());
        assert!(!server.reload().unwrap());
    }

    #[test]
    fn test_reconcile_twice_is_same() {
        let store = RuleStore::open(MemoryRepository::new()).unwrap();
        store.reconcile(&routes(), Utc::now()).unwrap();

        let second = store.reconcile(&routes(), Utc::now()).unwrap();
        assert_eq!(second.outcome, ReconcileOutcome::Same);
        assert!(second.changelog.is_empty());
        assert_eq!(store.changelog(false).len(), 0);
    }

    #[test]
    fn test_old_snapshot_survives_swap() {
        let store = RuleStore::open(MemoryRepository::new()).unwrap();
        store.reconcile(&routes(), Utc::now()).unwrap();
        let before = store.snapshot();

        let id = id_of(&store, "/ping");
        store.update_rule(id, &RuleUpdate::ip_based(1, 1, 1)).unwrap();

        assert!(!before.get(id).unwrap().rule.is_active());
        assert!(store.snapshot().get(id).unwrap().rule.is_active());
    }

    #[test]
    fn test_invalid_update_persists_nothing() {
        let store = RuleStore::open(MemoryRepository::new()).unwrap();
        store.reconcile(&routes(), Utc::now()).unwrap();
        let id = id_of(&store, "/login");

        let result = store.update_rule(id, &RuleUpdate::by_attributes(5, 60, 60));
        assert!(matches!(
            result,
            Err(RouteguardError::Validation(RuleViolation::NoEnabledDimension))
        ));
        assert_eq!(store.snapshot().get(id).unwrap().rule.status, RuleStatus::NotConfigured);
        assert_eq!(store.repository.load().unwrap().endpoint(id).unwrap().rule.status, RuleStatus::NotConfigured);
    }

    #[test]
    fn test_update_unknown_endpoint() {
        let store = RuleStore::open(MemoryRepository::new()).unwrap();
        let result = store.update_rule(EndpointId(42), &RuleUpdate::ip_based(1, 1, 1));
        assert!(matches!(result, Err(RouteguardError::EndpointNotFound(EndpointId(42)))));
    }

    #[test]
    fn test_failed_commit_keeps_last_known_good() {
        let store = RuleStore::open(FlakyRepository::default()).unwrap();
        store.reconcile(&routes(), Utc::now()).unwrap();
        let id = id_of(&store, "/ping");
        store.update_rule(id, &RuleUpdate::ip_based(3, 10, 10)).unwrap();

        store.repository.fail.store(true, Ordering::SeqCst);
        let without_ping: Vec<DiscoveredEndpoint> = routes().into_iter().take(1).collect();
        assert!(store.reconcile(&without_ping, Utc::now()).is_err());

        let ping = store.snapshot().get(id).cloned().unwrap();
        assert!(ping.rule.is_active());
        assert!(!ping.removed);
        assert_eq!(store.latest_snapshot().unwrap().changelog.len(), 0);

        store.repository.fail.store(false, Ordering::SeqCst);
        let retried = store.reconcile(&without_ping, Utc::now()).unwrap();
        assert_eq!(retried.changelog[0].change_type, ChangeType::EnabledEndpointWasDeleted);
    }

    #[test]
    fn test_resolve_changelog() {
        let store = RuleStore::open(MemoryRepository::new()).unwrap();
        store.reconcile(&routes(), Utc::now()).unwrap();
        let without_ping: Vec<DiscoveredEndpoint> = routes().into_iter().take(1).collect();
        let result = store.reconcile(&without_ping, Utc::now()).unwrap();
        let entry_id = result.changelog[0].id;

        assert_eq!(store.changelog(true).len(), 1);
        store.resolve_changelog(entry_id).unwrap();
        assert!(store.changelog(true).is_empty());
        assert_eq!(store.changelog(false).len(), 1);

        assert!(matches!(
            store.resolve_changelog(999),
            Err(RouteguardError::ChangelogNotFound(999))
        ));
    }

    #[test]
    fn test_removed_endpoint_not_found_by_key() {
        let store = RuleStore::open(MemoryRepository::new()).unwrap();
        store.reconcile(&routes(), Utc::now()).unwrap();
        let id = id_of(&store, "/ping");
        let without_ping: Vec<DiscoveredEndpoint> = routes().into_iter().take(1).collect();
        store.reconcile(&without_ping, Utc::now()).unwrap();

        let rules = store.snapshot();
        let key = EndpointKey::new("/ping", HttpMethod::Get, "Ping.ping()");
        assert!(rules.find(&key).is_none());
        assert!(rules.get(id).unwrap().removed);
        assert!(matches!(
            store.update_rule(id, &RuleUpdate::ip_based(1, 1, 1)),
            Err(RouteguardError::EndpointNotFound(_))
        ));
    }
}
