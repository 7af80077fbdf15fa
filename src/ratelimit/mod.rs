//! Rate limiting: per-key counters, bans, and admission decisions.

mod ban;
mod clock;
mod counter;
mod key;
mod limiter;

pub use ban::{Ban, RetryAfter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterState, Decision};
pub use key::{resolve_client_ip, CounterKey, DimensionKey, FORWARDED_HEADERS};
pub use limiter::{AdmissionController, EndpointMetrics, DEFAULT_SHARDS};
