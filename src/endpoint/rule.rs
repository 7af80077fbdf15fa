//! Rate limit rule configuration attached to each endpoint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle status of an endpoint's rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    #[default]
    NotConfigured,
    Active,
    Inactive,
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleStatus::NotConfigured => "NOT_CONFIGURED",
            RuleStatus::Active => "ACTIVE",
            RuleStatus::Inactive => "INACTIVE",
        };
        f.write_str(s)
    }
}

impl FromStr for RuleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "NOT_CONFIGURED" => Ok(RuleStatus::NotConfigured),
            "ACTIVE" => Ok(RuleStatus::Active),
            "INACTIVE" => Ok(RuleStatus::Inactive),
            other => Err(format!("unknown rule status: {}", other)),
        }
    }
}

/// Admission-control settings for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    pub status: RuleStatus,
    /// Count per client IP instead of per enabled parameter/header values.
    pub ip_based: bool,
    pub permanent_ban: bool,
    /// Requests admitted per window before a ban.
    pub limit_count: u32,
    pub window_seconds: u64,
    pub ban_seconds: u64,
}

impl RuleConfig {
    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }
}

/// Reasons a rule update is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleViolation {
    #[error("rule status cannot be changed back to NOT_CONFIGURED")]
    CannotUnconfigure,

    #[error("request limit count must be greater than 0")]
    ZeroLimit,

    #[error("time window must be greater than 0 seconds")]
    ZeroWindow,

    #[error("ban time must be greater than 0 seconds unless the ban is permanent")]
    ZeroBan,

    #[error("a rule that is not IP based needs at least one enabled parameter or header")]
    NoEnabledDimension,

    #[error("endpoint has no parameter named '{0}'")]
    UnknownParameter(String),

    #[error("endpoint has no header named '{0}'")]
    UnknownHeader(String),
}

/// A requested change to an endpoint's rule, as accepted by the rule
/// configuration API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleUpdate {
    pub status: RuleStatus,
    pub ip_based: bool,
    pub permanent_ban: bool,
    pub limit_count: u32,
    pub window_seconds: u64,
    pub ban_seconds: u64,
    pub enabled_parameters: BTreeSet<String>,
    pub enabled_headers: BTreeSet<String>,
}

impl RuleUpdate {
    /// An ACTIVE IP-based rule.
    pub fn ip_based(limit_count: u32, window_seconds: u64, ban_seconds: u64) -> Self {
        Self {
            status: RuleStatus::Active,
            ip_based: true,
            permanent_ban: false,
            limit_count,
            window_seconds,
            ban_seconds,
            enabled_parameters: BTreeSet::new(),
            enabled_headers: BTreeSet::new(),
        }
    }

    /// An ACTIVE rule keyed on parameter/header values.
    pub fn by_attributes(limit_count: u32, window_seconds: u64, ban_seconds: u64) -> Self {
        Self {
            ip_based: false,
            ..Self::ip_based(limit_count, window_seconds, ban_seconds)
        }
    }

    pub fn with_status(mut self, status: RuleStatus) -> Self {
        self.status = status;
        self
    }

    pub fn permanent(mut self) -> Self {
        self.permanent_ban = true;
        self
    }

    pub fn enable_parameter(mut self, name: &str) -> Self {
        self.enabled_parameters.insert(name.to_string());
        self
    }

    pub fn enable_header(mut self, name: &str) -> Self {
        self.enabled_headers.insert(name.to_string());
        self
    }

    /// Check the update against the invariants of an active rule.
    ///
    /// `parameters` and `headers` are the names the endpoint actually declares.
    /// Header names match case-insensitively.
    pub fn validate<'a, P, H>(&self, parameters: P, headers: H) -> Result<(), RuleViolation>
    where
        P: IntoIterator<Item = &'a str>,
        H: IntoIterator<Item = &'a str>,
    {
        if self.status == RuleStatus::NotConfigured {
            return Err(RuleViolation::CannotUnconfigure);
        }

        let parameters: BTreeSet<&str> = parameters.into_iter().collect();
        let headers: Vec<&str> = headers.into_iter().collect();

        if let Some(unknown) = self
            .enabled_parameters
            .iter()
            .find(|name| !parameters.contains(name.as_str()))
        {
            return Err(RuleViolation::UnknownParameter(unknown.clone()));
        }
        if let Some(unknown) = self
            .enabled_headers
            .iter()
            .find(|name| !headers.iter().any(|h| h.eq_ignore_ascii_case(name)))
        {
            return Err(RuleViolation::UnknownHeader(unknown.clone()));
        }

        if self.status != RuleStatus::Active {
            return Ok(());
        }

        if self.limit_count == 0 {
            return Err(RuleViolation::ZeroLimit);
        }
        if self.window_seconds == 0 {
            return Err(RuleViolation::ZeroWindow);
        }
        if self.ban_seconds == 0 && !self.permanent_ban {
            return Err(RuleViolation::ZeroBan);
        }
        if !self.ip_based && self.enabled_parameters.is_empty() && self.enabled_headers.is_empty() {
            return Err(RuleViolation::NoEnabledDimension);
        }

        Ok(())
    }

    /// The rule configuration this update produces.
    pub fn to_config(&self) -> RuleConfig {
        RuleConfig {
            status: self.status,
            ip_based: self.ip_based,
            permanent_ban: self.permanent_ban,
            limit_count: self.limit_count,
            window_seconds: self.window_seconds,
            ban_seconds: self.ban_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: [&str; 0] = [];

    #[test]
    fn test_default_rule_is_not_configured() {
        let rule = RuleConfig::default();
        assert_eq!(rule.status, RuleStatus::NotConfigured);
        assert!(!rule.is_active());
    }

    #[test]
    fn test_valid_ip_based_rule() {
        let update = RuleUpdate::ip_based(10, 60, 300);
        assert_eq!(update.validate(NONE, NONE), Ok(()));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert_eq!(
            RuleUpdate::ip_based(0, 60, 300).validate(NONE, NONE),
            Err(RuleViolation::ZeroLimit)
        );
        assert_eq!(
            RuleUpdate::ip_based(10, 0, 300).validate(NONE, NONE),
            Err(RuleViolation::ZeroWindow)
        );
        assert_eq!(
            RuleUpdate::ip_based(10, 60, 0).validate(NONE, NONE),
            Err(RuleViolation::ZeroBan)
        );
    }

    #[test]
    fn test_permanent_ban_allows_zero_ban_seconds() {
        let update = RuleUpdate::ip_based(10, 60, 0).permanent();
        assert_eq!(update.validate(NONE, NONE), Ok(()));
    }

    #[test]
    fn test_attribute_rule_needs_enabled_dimension() {
        let update = RuleUpdate::by_attributes(10, 60, 300);
        assert_eq!(
            update.validate(["page"], NONE),
            Err(RuleViolation::NoEnabledDimension)
        );

        let update = update.enable_header("X-Api-Key");
        assert_eq!(update.validate(["page"], ["X-Api-Key"]), Ok(()));
    }

    #[test]
    fn test_unknown_names_rejected() {
        let update = RuleUpdate::by_attributes(10, 60, 300).enable_parameter("missing");
        assert_eq!(
            update.validate(["page"], NONE),
            Err(RuleViolation::UnknownParameter("missing".to_string()))
        );

        let update = RuleUpdate::by_attributes(10, 60, 300).enable_header("X-Missing");
        assert_eq!(
            update.validate(NONE, ["X-Api-Key"]),
            Err(RuleViolation::UnknownHeader("X-Missing".to_string()))
        );
    }

    #[test]
    fn test_header_names_match_case_insensitively() {
        let update = RuleUpdate::by_attributes(10, 60, 300).enable_header("x-api-key");
        assert_eq!(update.validate(NONE, ["X-Api-Key"]), Ok(()));
    }

    #[test]
    fn test_inactive_rule_skips_limits() {
        let update = RuleUpdate::by_attributes(0, 0, 0).with_status(RuleStatus::Inactive);
        assert_eq!(update.validate(NONE, NONE), Ok(()));
    }

    #[test]
    fn test_cannot_unconfigure() {
        let update = RuleUpdate::ip_based(1, 1, 1).with_status(RuleStatus::NotConfigured);
        assert_eq!(update.validate(NONE, NONE), Err(RuleViolation::CannotUnconfigure));
    }

    #[test]
    fn test_rule_status_parse() {
        assert_eq!("active".parse::<RuleStatus>().unwrap(), RuleStatus::Active);
        assert_eq!("not-configured".parse::<RuleStatus>().unwrap(), RuleStatus::NotConfigured);
        assert!("paused".parse::<RuleStatus>().is_err());
    }
}
