//! Rate limiting logic and state management.

mod clock;
mod key;
mod ledger;
mod limiter;
mod registry;
mod rules;
mod sweeper;

pub use clock::{Clock, ManualClock, MonotonicClock, Timestamp};
pub use key::LimiterKey;
pub use ledger::{WindowConfig, WindowLedger};
pub use limiter::{Decision, LimiterStats, RateLimiter};
pub use registry::{KeyRegistry, SharedLedger};
pub use rules::{KeyRule, KeyRules};
pub use sweeper::IdleSweeper;
