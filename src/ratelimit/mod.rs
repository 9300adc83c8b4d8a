//! Rate limiting logic and state management.

mod gate;
mod limiter;
mod source;
mod table;

pub use gate::QueryGate;
pub use limiter::{LimitSettings, LimiterStats, RateLimiter};
pub use source::SourceKey;
