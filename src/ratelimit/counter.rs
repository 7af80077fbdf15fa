//! Per-key fixed-window counter with ban escalation.

use chrono::{DateTime, Utc};

use super::ban::{Ban, RetryAfter};
use super::clock::seconds;
use crate::endpoint::RuleConfig;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(RetryAfter),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// State tracked for one (endpoint, dimension) pair.
///
/// A key is either counting requests in a window that opened at
/// `started_at`, or banned. Both states are reset lazily when a request
/// arrives after they have lapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    Window { started_at: DateTime<Utc>, count: u32 },
    Banned(Ban),
}

impl CounterState {
    pub fn new(now: DateTime<Utc>) -> Self {
        CounterState::Window {
            started_at: now,
            count: 0,
        }
    }

    /// Record one request at `now` and decide it.
    ///
    /// The caller must hold exclusive access to this state for the whole
    /// call; the read, decision, and write are one step.
    pub fn admit(&mut self, rule: &RuleConfig, now: DateTime<Utc>) -> Decision {
        let (started_at, count) = match *self {
            CounterState::Banned(ban) if !ban.is_expired(now) => {
                return Decision::Deny(ban.retry_after(now));
            }
            CounterState::Banned(_) => (now, 0),
            CounterState::Window { started_at, count } => (started_at, count),
        };

        let (started_at, count) = if count == 0 || now - started_at >= seconds(rule.window_seconds) {
            (now, 1)
        } else {
            (started_at, count.saturating_add(1))
        };

        if count > rule.limit_count {
            let ban = Ban::for_rule(rule, now);
            *self = CounterState::Banned(ban);
            return Decision::Deny(ban.retry_after(now));
        }
        *self = CounterState::Window { started_at, count };
        Decision::Allow
    }

    pub fn is_banned(&self) -> bool {
        matches!(self, CounterState::Banned(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RuleStatus;
    use chrono::TimeDelta;

    fn rule(limit_count: u32, window_seconds: u64, ban_seconds: u64) -> RuleConfig {
        RuleConfig {
            status: RuleStatus::Active,
            ip_based: true,
            permanent_ban: false,
            limit_count,
            window_seconds,
            ban_seconds,
        }
    }

    #[test]
    fn test_allows_up_to_limit_then_bans() {
        let rule = rule(3, 10, 60);
        let now = Utc::now();
        let mut state = CounterState::new(now);

        for _ in 0..3 {
            assert_eq!(state.admit(&rule, now), Decision::Allow);
        }
        assert_eq!(state.admit(&rule, now), Decision::Deny(RetryAfter::Seconds(60)));
        assert!(state.is_banned());
    }

    #[test]
    fn test_window_resets_after_elapsing() {
        let rule = rule(2, 10, 60);
        let now = Utc::now();
        let mut state = CounterState::new(now);

        assert!(state.admit(&rule, now).is_allowed());
        assert!(state.admit(&rule, now + TimeDelta::seconds(9)).is_allowed());
        // A new window opens exactly at W.
        assert!(state.admit(&rule, now + TimeDelta::seconds(10)).is_allowed());
        assert!(state.admit(&rule, now + TimeDelta::seconds(11)).is_allowed());
        assert!(!state.admit(&rule, now + TimeDelta::seconds(12)).is_allowed());
    }

    #[test]
    fn test_denials_during_ban_do_not_extend_it() {
        let rule = rule(1, 10, 30);
        let now = Utc::now();
        let mut state = CounterState::new(now);

        state.admit(&rule, now);
        state.admit(&rule, now);
        assert_eq!(
            state.admit(&rule, now + TimeDelta::seconds(20)),
            Decision::Deny(RetryAfter::Seconds(10))
        );
        assert!(state.admit(&rule, now + TimeDelta::seconds(30)).is_allowed());
    }

    #[test]
    fn test_expired_ban_starts_fresh_window() {
        let rule = rule(2, 100, 5);
        let now = Utc::now();
        let mut state = CounterState::new(now);

        for _ in 0..3 {
            state.admit(&rule, now);
        }
        let later = now + TimeDelta::seconds(6);
        assert_eq!(state.admit(&rule, later), Decision::Allow);
        assert_eq!(state, CounterState::Window { started_at: later, count: 1 });
    }

    #[test]
    fn test_permanent_ban() {
        let mut rule = rule(1, 10, 30);
        rule.permanent_ban = true;
        let now = Utc::now();
        let mut state = CounterState::new(now);

        state.admit(&rule, now);
        assert_eq!(state.admit(&rule, now), Decision::Deny(RetryAfter::Permanent));
        assert_eq!(
            state.admit(&rule, now + TimeDelta::days(365)),
            Decision::Deny(RetryAfter::Permanent)
        );
    }

    #[test]
    fn test_clock_moving_backwards_stays_in_window() {
        let rule = rule(1, 10, 30);
        let now = Utc::now();
        let mut state = CounterState::new(now);

        assert!(state.admit(&rule, now).is_allowed());
        assert!(!state.admit(&rule, now - TimeDelta::seconds(5)).is_allowed());
    }
}
