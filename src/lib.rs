//! Routeguard - Endpoint Rate Limiting with Route Reconciliation
//!
//! This crate keeps a persisted set of per-endpoint rate limit rules in step
//! with the routes an application actually serves, and decides for every
//! inbound request whether it may proceed. Rules are keyed by client IP or by
//! selected request parameters and headers; callers that exceed a limit are
//! banned for a configured duration or permanently.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod guard;
pub mod ratelimit;
pub mod reconcile;
pub mod store;
pub mod watch;
