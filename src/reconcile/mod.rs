//! Route reconciliation: keeping stored rules in step with the routes the
//! application actually serves.

mod fingerprint;
mod reconciler;
mod source;

pub use fingerprint::fingerprint;
pub use reconciler::{reconcile, ReconcileOutcome, Reconciliation};
pub use source::RouteManifest;
