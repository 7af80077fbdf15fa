//! Version snapshots and the changelog produced by route reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::descriptor::{EndpointKey, HttpMethod};

/// Kind of drift recorded in a changelog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    ApiAdded,
    ApiDeleted,
    Activated,
    Deactivated,
    RuleChanged,
    EnabledEndpointWasDeleted,
    EnabledParameterWasDeleted,
}

impl ChangeType {
    /// Operator-facing description of the change.
    pub fn description(&self) -> &'static str {
        match self {
            ChangeType::ApiAdded => "New endpoint added.",
            ChangeType::ApiDeleted => "An endpoint that existed before can no longer be found.",
            ChangeType::Activated => "Endpoint activated.",
            ChangeType::Deactivated => "Endpoint deactivated.",
            ChangeType::RuleChanged => "Endpoint rule changed.",
            ChangeType::EnabledEndpointWasDeleted => {
                "An endpoint with rate limiting enabled is no longer found in the code."
            }
            ChangeType::EnabledParameterWasDeleted => {
                "One of the parameters used by an enabled rate limit was deleted or changed in the code."
            }
        }
    }

    /// Whether the change needs an operator to look at it before the
    /// endpoint is protected again.
    pub fn requires_attention(&self) -> bool {
        matches!(
            self,
            ChangeType::EnabledEndpointWasDeleted | ChangeType::EnabledParameterWasDeleted
        )
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeType::ApiAdded => "API_ADDED",
            ChangeType::ApiDeleted => "API_DELETED",
            ChangeType::Activated => "ACTIVATED",
            ChangeType::Deactivated => "DEACTIVATED",
            ChangeType::RuleChanged => "RULE_CHANGED",
            ChangeType::EnabledEndpointWasDeleted => "ENABLED_ENDPOINT_WAS_DELETED",
            ChangeType::EnabledParameterWasDeleted => "ENABLED_PARAMETER_WAS_DELETED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub id: u64,
    pub change_type: ChangeType,
    pub detail: String,
    #[serde(default)]
    pub is_resolved: bool,
    pub target_method: HttpMethod,
    pub target_signature: String,
    pub target_path: String,
}

impl ChangelogEntry {
    /// Entry with the change type's standard description.
    pub fn new(id: u64, change_type: ChangeType, target: &EndpointKey) -> Self {
        Self::with_detail(id, change_type, target, change_type.description().to_string())
    }

    pub fn with_detail(id: u64, change_type: ChangeType, target: &EndpointKey, detail: String) -> Self {
        Self {
            id,
            change_type,
            detail,
            is_resolved: false,
            target_method: target.http_method,
            target_signature: target.signature.clone(),
            target_path: target.path.clone(),
        }
    }

    pub fn target(&self) -> EndpointKey {
        EndpointKey::new(
            self.target_path.clone(),
            self.target_method,
            self.target_signature.clone(),
        )
    }
}

/// The record of one reconciliation run. Immutable once written apart from
/// the `is_resolved` flag on its entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub full_hash: String,
    pub date_of_version: DateTime<Utc>,
    #[serde(default)]
    pub changelog: Vec<ChangelogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_copies_target() {
        let key = EndpointKey::new("/a", HttpMethod::Put, "A.put()");
        let entry = ChangelogEntry::new(1, ChangeType::ApiAdded, &key);

        assert_eq!(entry.detail, ChangeType::ApiAdded.description());
        assert!(!entry.is_resolved);
        assert_eq!(entry.target(), key);
    }

    #[test]
    fn test_change_type_wire_names() {
        let json = serde_json::to_string(&ChangeType::EnabledParameterWasDeleted).unwrap();
        assert_eq!(json, "\"ENABLED_PARAMETER_WAS_DELETED\"");
        assert_eq!(ChangeType::EnabledParameterWasDeleted.to_string(), "ENABLED_PARAMETER_WAS_DELETED");
    }

    #[test]
    fn test_unknown_change_type_fails_to_load() {
        let result = serde_json::from_str::<ChangeType>("\"API_RENAMED\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_attention_required_only_for_enabled_drift() {
        assert!(ChangeType::EnabledEndpointWasDeleted.requires_attention());
        assert!(ChangeType::EnabledParameterWasDeleted.requires_attention());
        assert!(!ChangeType::ApiAdded.requires_attention());
        assert!(!ChangeType::ApiDeleted.requires_attention());
    }
}
