//! Error types for Routeguard.

use thiserror::Error;

use crate::endpoint::{EndpointId, RuleViolation};

/// Main error type for Routeguard operations.
#[derive(Error, Debug)]
pub enum RouteguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered settings could not be read
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// A rule update broke one of the rule invariants
    #[error("Invalid rule: {0}")]
    Validation(#[from] RuleViolation),

    #[error("Endpoint {0} not found")]
    EndpointNotFound(EndpointId),

    #[error("Changelog entry {0} not found")]
    ChangelogNotFound(u64),

    /// Two discovered routes share the same identity
    #[error("Duplicate route: {0}")]
    DuplicateRoute(String),

    /// Stored state that cannot be reconciled against
    #[error("Malformed stored state: {0}")]
    MalformedState(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for Routeguard operations.
pub type Result<T> = std::result::Result<T, RouteguardError>;
