//! The endpoint aggregate: a descriptor, its rule, and the parameters and
//! headers that may participate in the rate limit key.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::descriptor::{DiscoveredEndpoint, EndpointDescriptor, EndpointKey, ParameterType};
use super::rule::{RuleConfig, RuleUpdate, RuleViolation};

/// Surrogate id of a stored endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointParameter {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub param_type: Option<ParameterType>,
    /// Whether the value participates in the rate limit key.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHeader {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    #[serde(flatten)]
    pub descriptor: EndpointDescriptor,
    #[serde(default)]
    pub rule: RuleConfig,
    #[serde(default)]
    pub parameters: Vec<EndpointParameter>,
    #[serde(default)]
    pub headers: Vec<EndpointHeader>,
    /// Set once the route disappears from the descriptor source. The row is
    /// kept so changelog and ban history still resolve.
    #[serde(default)]
    pub removed: bool,
    /// Bumped every time `rule` changes. Counters remember the revision
    /// they were created under.
    #[serde(default)]
    pub rule_revision: u64,
}

impl Endpoint {
    /// Build a fresh, unconfigured endpoint from a discovered route.
    pub fn from_discovered(id: EndpointId, discovered: &DiscoveredEndpoint) -> Self {
        Self {
            id,
            descriptor: discovered.descriptor.clone(),
            rule: RuleConfig::default(),
            parameters: discovered
                .parameters
                .iter()
                .map(|p| EndpointParameter {
                    name: p.name.clone(),
                    param_type: p.param_type,
                    enabled: false,
                })
                .collect(),
            headers: discovered
                .headers
                .iter()
                .map(|h| EndpointHeader {
                    name: h.clone(),
                    enabled: false,
                })
                .collect(),
            removed: false,
            rule_revision: 0,
        }
    }

    pub fn key(&self) -> EndpointKey {
        self.descriptor.key()
    }

    /// Parameters that participate in the rate limit key.
    pub fn enabled_parameters(&self) -> impl Iterator<Item = &EndpointParameter> {
        self.parameters.iter().filter(|p| p.enabled)
    }

    /// Headers that participate in the rate limit key.
    pub fn enabled_headers(&self) -> impl Iterator<Item = &EndpointHeader> {
        self.headers.iter().filter(|h| h.enabled)
    }

    /// Apply a validated rule update, returning the updated endpoint.
    ///
    /// `self` is left untouched when validation fails.
    pub fn with_rule(&self, update: &RuleUpdate) -> Result<Self, RuleViolation> {
        update.validate(
            self.parameters.iter().map(|p| p.name.as_str()),
            self.headers.iter().map(|h| h.name.as_str()),
        )?;

        let mut updated = self.clone();
        updated.rule = update.to_config();
        updated.rule_revision = self.rule_revision + 1;
        for parameter in &mut updated.parameters {
            parameter.enabled = update.enabled_parameters.contains(&parameter.name);
        }
        for header in &mut updated.headers {
            header.enabled = update
                .enabled_headers
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&header.name));
        }
        Ok(updated)
    }
}
