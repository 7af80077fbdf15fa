//! Persistence seam for endpoints, rules and version snapshots.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::endpoint::{ChangelogEntry, Endpoint, EndpointId, VersionSnapshot};
use crate::error::Result;

/// Everything Routeguard persists, saved and loaded as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Oldest first.
    #[serde(default)]
    pub snapshots: Vec<VersionSnapshot>,
    /// Last issued endpoint id.
    #[serde(default)]
    pub last_endpoint_id: u64,
    /// Last issued changelog entry id.
    #[serde(default)]
    pub last_changelog_id: u64,
}

impl PersistedState {
    /// The baseline for the next reconciliation: the last one appended,
    /// whatever its timestamp.
    pub fn latest_snapshot(&self) -> Option<&VersionSnapshot> {
        self.snapshots.last()
    }

    pub fn allocate_endpoint_id(&mut self) -> EndpointId {
        self.last_endpoint_id += 1;
        EndpointId(self.last_endpoint_id)
    }

    pub fn allocate_changelog_id(&mut self) -> u64 {
        self.last_changelog_id += 1;
        self.last_changelog_id
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    pub fn endpoint_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|e| e.id == id)
    }

    /// All changelog entries, oldest snapshot first.
    pub fn changelog(&self) -> impl Iterator<Item = &ChangelogEntry> {
        self.snapshots.iter().flat_map(|s| s.changelog.iter())
    }

    pub fn changelog_entry_mut(&mut self, id: u64) -> Option<&mut ChangelogEntry> {
        self.snapshots
            .iter_mut()
            .flat_map(|s| s.changelog.iter_mut())
            .find(|e| e.id == id)
    }
}

/// Loads and saves [`PersistedState`].
///
/// `commit` must be all-or-nothing: after a failed commit, `load` still
/// returns the previously committed state.
pub trait Repository: Send + Sync {
    fn load(&self) -> Result<PersistedState>;

    fn commit(&self, state: &PersistedState) -> Result<()>;
}

/// In-process repository, used by tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<PersistedState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl Repository for MemoryRepository {
    fn load(&self) -> Result<PersistedState> {
        Ok(self.state.lock().clone())
    }

    fn commit(&self, state: &PersistedState) -> Result<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}
