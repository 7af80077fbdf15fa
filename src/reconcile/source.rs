//! Route manifests: the discovered routes of the host application, written
//! by its route introspection step.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::endpoint::DiscoveredEndpoint;
use crate::error::{Result, RouteguardError};

/// A route manifest document.
///
/// ```yaml
/// endpoints:
///   - path: /users/{id}
///     http_method: GET
///     signature: "UserController.get(long)"
///     is_pattern_path: true
///     parameters:
///       - name: id
///         type: PATH
///     headers: [X-Api-Key]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteManifest {
    #[serde(default)]
    pub endpoints: Vec<DiscoveredEndpoint>,
}

impl RouteManifest {
    /// Load a manifest from a YAML or JSON file (chosen by extension).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading route manifest");

        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RouteguardError::Config(format!("Failed to parse route manifest: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RouteguardError::Config(format!("Failed to parse route manifest: {}", e)))
    }
}
