//! Shared handle host tasks use to reach the limiter.

use chrono::Utc;
use parking_lot::Mutex;

use super::limiter::{LimitSettings, LimiterStats, RateLimiter};
use super::source::SourceKey;

/// Serialized access to a [`RateLimiter`].
///
/// The limiter mutates shared tables on every check, so the whole thing
/// sits behind one mutex held for the duration of each call. A check is
/// O(log n) and never blocks on anything but the lock itself, which keeps
/// the critical section short enough for a hot packet path.
pub struct QueryGate {
    limiter: Mutex<RateLimiter>,
}

impl QueryGate {
    pub fn new(settings: LimitSettings) -> Self {
        Self {
            limiter: Mutex::new(RateLimiter::new(settings)),
        }
    }

    /// Check a query source against the current wall clock.
    pub fn check(&self, source: SourceKey) -> bool {
        self.check_at(source, Utc::now().timestamp())
    }

    /// Check a query source at an explicit unix-second timestamp.
    pub fn check_at(&self, source: SourceKey, now: i64) -> bool {
        self.limiter.lock().check_source(source, now)
    }

    /// Drop all accounting state.
    pub fn reset(&self) {
        self.limiter.lock().reset();
    }

    /// Replace the tunables; the next check uses them.
    pub fn set_limits(&self, settings: LimitSettings) {
        self.limiter.lock().set_settings(settings);
    }

    /// Current tunables.
    pub fn limits(&self) -> LimitSettings {
        self.limiter.lock().settings()
    }

    /// Decision counters since start or the last reset.
    pub fn stats(&self) -> LimiterStats {
        self.limiter.lock().stats()
    }

    /// Number of sources currently tracked.
    pub fn tracked_sources(&self) -> usize {
        self.limiter.lock().tracked_sources()
    }
}

impl Default for QueryGate {
    fn default() -> Self {
        Self::new(LimitSettings::default())
    }
}
