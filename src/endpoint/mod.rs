//! Endpoint data model: route identity, rules, and the changelog.

mod changelog;
mod descriptor;
mod model;
mod rule;

pub use changelog::{ChangeType, ChangelogEntry, VersionSnapshot};
pub use descriptor::{
    DeclaredParameter, DiscoveredEndpoint, EndpointDescriptor, EndpointKey, HttpMethod,
    ParameterType,
};
pub use model::{Endpoint, EndpointHeader, EndpointId, EndpointParameter};
pub use rule::{RuleConfig, RuleStatus, RuleUpdate, RuleViolation};
