//! Ban registry entries.
//!
//! Bans live inside each key's counter state and are cleared lazily: an
//! expired ban is only noticed, and dropped, on the next request for the same
//! key. There is no background sweep. Permanent bans stay until the
//! endpoint's rule is updated.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::clock::seconds;
use crate::endpoint::RuleConfig;

/// How long a denied caller should wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAfter {
    Seconds(u64),
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ban {
    Until(DateTime<Utc>),
    Permanent,
}

impl Ban {
    /// The ban a rule imposes when its limit is exceeded at `now`.
    pub fn for_rule(rule: &RuleConfig, now: DateTime<Utc>) -> Self {
        if rule.permanent_ban {
            return Ban::Permanent;
        }
        now.checked_add_signed(seconds(rule.ban_seconds))
            .map(Ban::Until)
            .unwrap_or(Ban::Permanent)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            Ban::Until(until) => now >= *until,
            Ban::Permanent => false,
        }
    }

    /// Remaining ban time, rounded up to whole seconds.
    pub fn retry_after(&self, now: DateTime<Utc>) -> RetryAfter {
        match self {
            Ban::Permanent => RetryAfter::Permanent,
            Ban::Until(until) => {
                let remaining_ms = (*until - now).num_milliseconds().max(0) as u64;
                RetryAfter::Seconds(remaining_ms.div_ceil(1000).max(1))
            }
        }
    }
}
