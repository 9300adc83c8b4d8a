//! Core query-flood rate limiter.

use tracing::{info, trace, warn};

use super::source::SourceKey;
use super::table::SourceTable;

/// Minimum seconds between warn-level alerts of one kind.
const ALERT_THROTTLE_SECS: i64 = 30;

/// Tunables controlling the limiter.
///
/// All fields can be replaced at runtime through
/// [`RateLimiter::set_settings`]; the next check uses the new values
/// against the accounting state accumulated under the old ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitSettings {
    /// Per-source ceiling in queries per second, averaged over the window.
    pub max_queries_per_sec: f64,
    /// Length of the averaging window in seconds.
    pub averaging_window_secs: f64,
    /// Most sources tracked individually before the limiter assumes a
    /// distributed flood and falls back to global enforcement.
    pub max_tracked_sources: usize,
    /// Stale sources evicted per check while under the tracking ceiling.
    pub prune_batch_size: usize,
    /// Aggregate ceiling in queries per second across all sources.
    pub global_max_queries_per_sec: f64,
    /// Log every blocked query instead of only throttled alerts.
    pub log_blocks: bool,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_queries_per_sec: 10.0,
            averaging_window_secs: 30.0,
            max_tracked_sources: 50_000,
            prune_batch_size: 10,
            global_max_queries_per_sec: 500.0,
            log_blocks: false,
        }
    }
}

/// Counters the limiter keeps about its own decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    /// Queries checked since construction or the last reset.
    pub checked: u64,
    /// Queries denied by the per-source ceiling.
    pub blocked_by_source: u64,
    /// Queries denied by the global ceiling.
    pub blocked_by_global: u64,
    /// Times the tracking ceiling forced a full per-source reset.
    pub flood_resets: u64,
}

/// Decides, query by query, whether a source should be answered.
///
/// One instance owns all accounting state: the tracked-source table, the
/// global window and the alert throttles. It is not internally
/// synchronized; hosts that check from more than one task wrap it in a
/// single lock ([`QueryGate`](super::QueryGate) does exactly that).
///
/// Timestamps are wall-clock unix seconds supplied by the caller, which
/// keeps the limiter deterministic under test. A clock that jumps
/// backwards cannot panic the limiter or evict live sources; affected
/// windows simply take longer to roll over.
#[derive(Debug)]
pub struct RateLimiter {
    settings: LimitSettings,
    sources: SourceTable,
    global_count: u64,
    global_window_start: i64,
    last_flood_alert: i64,
    last_source_alert: i64,
    stats: LimiterStats,
}

impl RateLimiter {
    pub fn new(settings: LimitSettings) -> Self {
        Self {
            settings,
            sources: SourceTable::new(),
            global_count: 0,
            global_window_start: 0,
            last_flood_alert: 0,
            last_source_alert: 0,
            stats: LimiterStats::default(),
        }
    }

    /// Current tunables.
    pub fn settings(&self) -> LimitSettings {
        self.settings
    }

    /// Replace the tunables. Accounting state carries over.
    pub fn set_settings(&mut self, settings: LimitSettings) {
        self.settings = settings;
    }

    /// Decision counters since construction or the last reset.
    pub fn stats(&self) -> LimiterStats {
        self.stats
    }

    /// Number of sources currently tracked.
    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }

    /// Decide whether a query from `source` arriving at wall-clock second
    /// `now` should be answered.
    ///
    /// Returns `true` to answer and `false` to drop. Every call also does
    /// a slice of table maintenance, so cost stays O(log n) per query with
    /// no separate sweep needed.
    pub fn check_source(&mut self, source: SourceKey, now: i64) -> bool {
        self.stats.checked = self.stats.checked.saturating_add(1);
        let window = self.settings.averaging_window_secs;

        self.prune_stale(source, now);

        if self.sources.len() > self.settings.max_tracked_sources {
            self.flood_reset(now);
        }

        // Per-source accounting. A denied query stops here and never
        // reaches the global counter.
        match self.sources.get(source) {
            Some(record) if elapsed(now, record.window_start) >= window => {
                trace!(
                    source = %source,
                    rate = record.count as f64 / window,
                    "source window rolled over"
                );
                self.sources.roll_window(source, now);
            }
            Some(_) => {
                let count = self.sources.increment(source).unwrap_or(1);
                let rate = count as f64 / window;
                if rate > self.settings.max_queries_per_sec {
                    self.stats.blocked_by_source =
                        self.stats.blocked_by_source.saturating_add(1);
                    self.note_source_block(source, rate, now);
                    return false;
                }
            }
            None => {
                self.sources.insert(source, now);
            }
        }

        // Global accounting.
        self.global_count = self.global_count.saturating_add(1);
        if elapsed(now, self.global_window_start) >= window {
            trace!(
                rate = self.global_count as f64 / window,
                "global window rolled over"
            );
            self.global_window_start = now;
            self.global_count = 1;
            return true;
        }
        let rate = self.global_count as f64 / window;
        if rate > self.settings.global_max_queries_per_sec {
            self.stats.blocked_by_global = self.stats.blocked_by_global.saturating_add(1);
            self.note_global_block(source, rate, now);
            return false;
        }
        true
    }

    /// Forget everything: tracked sources, global accounting, alert
    /// throttles and statistics. Afterwards the limiter behaves exactly
    /// like a freshly constructed one with the same settings.
    pub fn reset(&mut self) {
        self.sources.clear();
        self.global_count = 0;
        self.global_window_start = 0;
        self.last_flood_alert = 0;
        self.last_source_alert = 0;
        self.stats = LimiterStats::default();
    }

    /// Evict sources whose window closed more than one full averaging
    /// window ago. Walks oldest-first and stops at the first live entry;
    /// evictions per call are capped at `prune_batch_size` unless the
    /// table is still over the tracking ceiling. The caller's own record
    /// is never evicted here, it is about to be updated anyway.
    fn prune_stale(&mut self, current: SourceKey, now: i64) {
        let window = self.settings.averaging_window_secs;
        let mut cursor = None;
        let mut evicted = 0usize;

        while let Some((window_start, key)) = self.sources.oldest_after(cursor) {
            if elapsed(now, window_start) < window {
                // The index is window-ordered, nothing past this is stale.
                break;
            }
            if key == current {
                cursor = Some((window_start, key));
                continue;
            }
            if evicted >= self.settings.prune_batch_size
                && self.sources.len() <= self.settings.max_tracked_sources
            {
                break;
            }
            self.sources.remove(key);
            evicted += 1;
        }

        if evicted > 0 {
            trace!(evicted, remaining = self.sources.len(), "pruned stale sources");
        }
    }

    /// Too many distinct sources to track individually: treat it as a
    /// distributed flood, drop all per-source state and lean on the global
    /// ceiling alone until the traffic subsides.
    fn flood_reset(&mut self, now: i64) {
        let tracked = self.sources.len();
        self.sources.clear();

        // Prime the global window as if it had just absorbed a full
        // window's worth of traffic at the ceiling, so the flood cannot
        // burst through in the instant after the reset.
        let carry = (self.settings.global_max_queries_per_sec + 1.0)
            * (self.settings.averaging_window_secs + 1.0);
        self.global_count = carry.max(1.0) as u64;
        self.global_window_start = now;

        self.stats.flood_resets = self.stats.flood_resets.saturating_add(1);

        if now.saturating_sub(self.last_flood_alert) >= ALERT_THROTTLE_SECS {
            self.last_flood_alert = now;
            warn!(
                tracked,
                ceiling = self.settings.max_tracked_sources,
                "tracked-source ceiling exceeded, assuming distributed flood \
                 and switching to global enforcement"
            );
        }
    }

    fn note_source_block(&mut self, source: SourceKey, rate: f64, now: i64) {
        if self.settings.log_blocks {
            info!(source = %source, rate, "query blocked, per-source rate exceeded");
        }
        if now.saturating_sub(self.last_source_alert) >= ALERT_THROTTLE_SECS {
            self.last_source_alert = now;
            warn!(
                source = %source,
                rate,
                limit = self.settings.max_queries_per_sec,
                "dropping queries from source over its rate ceiling"
            );
        }
    }

    fn note_global_block(&mut self, source: SourceKey, rate: f64, now: i64) {
        if self.settings.log_blocks {
            info!(source = %source, rate, "query blocked, global rate exceeded");
        }
        if now.saturating_sub(self.last_flood_alert) >= ALERT_THROTTLE_SECS {
            self.last_flood_alert = now;
            warn!(
                rate,
                limit = self.settings.global_max_queries_per_sec,
                "dropping queries, aggregate rate ceiling exceeded"
            );
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimitSettings::default())
    }
}

fn elapsed(now: i64, start: i64) -> f64 {
    now.saturating_sub(start) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(n: u64) -> SourceKey {
        SourceKey::from_raw(n)
    }

    fn small_settings() -> LimitSettings {
        LimitSettings {
            max_queries_per_sec: 2.0,
            averaging_window_secs: 10.0,
            max_tracked_sources: 8,
            prune_batch_size: 2,
            global_max_queries_per_sec: 100.0,
            log_blocks: false,
        }
    }

    #[test]
    fn test_per_source_ceiling_denies_overflow() {
        let mut limiter = RateLimiter::new(small_settings());

        // 2 q/s over a 10s window allows 20 queries, the 21st must fail.
        for i in 0..20 {
            assert!(
                limiter.check_source(src(1), (i / 2) as i64),
                "query {i} should pass"
            );
        }
        assert!(!limiter.check_source(src(1), 9));
        assert_eq!(limiter.stats().blocked_by_source, 1);
    }

    #[test]
    fn test_window_rollover_restores_service() {
        let mut limiter = RateLimiter::new(small_settings());

        for _ in 0..20 {
            assert!(limiter.check_source(src(1), 0));
        }
        assert!(!limiter.check_source(src(1), 1));
        assert!(!limiter.check_source(src(1), 5));

        // One full window after the source's window opened it rolls over
        // and the first query of the new window is answered.
        assert!(limiter.check_source(src(1), 10));
    }

    #[test]
    fn test_global_ceiling_spans_distinct_sources() {
        let settings = LimitSettings {
            max_queries_per_sec: 100.0,
            global_max_queries_per_sec: 0.3,
            ..small_settings()
        };
        let mut limiter = RateLimiter::new(settings);

        // 0.3 q/s over 10s means the aggregate tolerates 3 queries.
        assert!(limiter.check_source(src(1), 0));
        assert!(limiter.check_source(src(2), 0));
        assert!(limiter.check_source(src(3), 0));
        assert!(!limiter.check_source(src(4), 0));
        assert_eq!(limiter.stats().blocked_by_global, 1);

        // The aggregate window rolls over like any other.
        assert!(limiter.check_source(src(5), 10));
    }

    #[test]
    fn test_denied_source_does_not_consume_global_budget() {
        let settings = LimitSettings {
            max_queries_per_sec: 0.2,
            global_max_queries_per_sec: 0.4,
            ..small_settings()
        };
        let mut limiter = RateLimiter::new(settings);

        assert!(limiter.check_source(src(1), 0));
        assert!(limiter.check_source(src(1), 0));
        // Source 1 is over its own ceiling; these denials must not count
        // against the aggregate.
        assert!(!limiter.check_source(src(1), 0));
        assert!(!limiter.check_source(src(1), 0));
        assert!(!limiter.check_source(src(1), 0));

        // The aggregate sits at 2, so two more distinct sources fit under
        // 0.4 q/s over 10s before the aggregate ceiling bites.
        assert!(limiter.check_source(src(2), 0));
        assert!(limiter.check_source(src(3), 0));
        assert!(!limiter.check_source(src(4), 0));

        let stats = limiter.stats();
        assert_eq!(stats.blocked_by_source, 3);
        assert_eq!(stats.blocked_by_global, 1);

        // The globally denied source is still tracked afterwards.
        assert_eq!(limiter.tracked_sources(), 4);
    }

    #[test]
    fn test_tracking_overflow_triggers_flood_reset() {
        let mut limiter = RateLimiter::new(small_settings());

        for n in 1..=9 {
            assert!(limiter.check_source(src(n), 0));
        }
        assert_eq!(limiter.tracked_sources(), 9);

        // The next check sees 9 > 8 tracked sources, wipes the table and
        // primes the aggregate window, so the query itself is denied.
        assert!(!limiter.check_source(src(100), 0));
        assert_eq!(limiter.stats().flood_resets, 1);
        assert_eq!(limiter.stats().blocked_by_global, 1);
        assert_eq!(limiter.tracked_sources(), 1);

        // During the cool-down the primed aggregate blocks everyone.
        assert!(!limiter.check_source(src(101), 3));

        // A window later the aggregate rolls over and service resumes.
        assert!(limiter.check_source(src(100), 10));
    }

    #[test]
    fn test_prune_evicts_only_stale_sources() {
        let mut limiter = RateLimiter::new(small_settings());

        limiter.check_source(src(1), 0);
        limiter.check_source(src(2), 0);
        limiter.check_source(src(3), 0);
        limiter.check_source(src(4), 5);

        // All four are stale at t=20 but the batch cap is 2, so one check
        // evicts exactly two before inserting the newcomer.
        assert!(limiter.check_source(src(5), 20));
        assert_eq!(limiter.tracked_sources(), 3);

        assert!(limiter.check_source(src(6), 20));
        assert_eq!(limiter.tracked_sources(), 2);
    }

    #[test]
    fn test_prune_stops_at_first_live_source() {
        let mut limiter = RateLimiter::new(LimitSettings {
            prune_batch_size: 10,
            ..small_settings()
        });

        limiter.check_source(src(1), 0);
        limiter.check_source(src(2), 12);
        limiter.check_source(src(3), 14);

        // At t=15 only source 1 is stale; 2 and 3 sit behind it in window
        // order and must survive even with batch budget to spare.
        assert!(limiter.check_source(src(4), 15));
        assert_eq!(limiter.tracked_sources(), 3);
    }

    #[test]
    fn test_prune_never_evicts_the_caller() {
        let mut limiter = RateLimiter::new(LimitSettings {
            prune_batch_size: 1,
            ..small_settings()
        });

        limiter.check_source(src(1), 0);
        limiter.check_source(src(2), 0);

        // Both records are stale at t=15. The caller's own entry is
        // skipped without spending batch budget, so the one eviction falls
        // on source 2 and the caller's window simply rolls over.
        assert!(limiter.check_source(src(1), 15));
        assert_eq!(limiter.tracked_sources(), 1);
    }

    #[test]
    fn test_prune_ignores_batch_cap_while_over_ceiling() {
        let mut limiter = RateLimiter::new(LimitSettings {
            prune_batch_size: 1,
            ..small_settings()
        });

        for n in 1..=6 {
            limiter.check_source(src(n), 0);
        }
        assert_eq!(limiter.tracked_sources(), 6);

        // Tightening the ceiling at runtime leaves the table oversized.
        // With everything stale, one check prunes past its batch size of 1
        // until the table fits again instead of escalating to a flood
        // reset.
        let mut tightened = limiter.settings();
        tightened.max_tracked_sources = 3;
        limiter.set_settings(tightened);

        assert!(limiter.check_source(src(7), 20));
        assert_eq!(limiter.stats().flood_resets, 0);
        assert_eq!(limiter.tracked_sources(), 4);
    }

    #[test]
    fn test_reset_restores_fresh_behavior() {
        let mut limiter = RateLimiter::new(small_settings());
        let mut fresh = RateLimiter::new(small_settings());

        for _ in 0..25 {
            limiter.check_source(src(1), 0);
        }
        limiter.check_source(src(2), 3);
        limiter.reset();
        limiter.reset();

        assert_eq!(limiter.tracked_sources(), 0);
        assert_eq!(limiter.stats(), LimiterStats::default());

        // After the reset the limiter answers exactly like a new instance.
        for n in 0..30u64 {
            let key = src(n % 3);
            let now = (n / 3) as i64;
            assert_eq!(
                limiter.check_source(key, now),
                fresh.check_source(key, now)
            );
        }
        assert_eq!(limiter.stats(), fresh.stats());
    }

    #[test]
    fn test_clock_regression_is_harmless() {
        let mut limiter = RateLimiter::new(small_settings());

        assert!(limiter.check_source(src(1), 1_000));
        assert!(limiter.check_source(src(1), 1_000));

        // Clock jumps backwards: elapsed time goes negative, the window
        // neither rolls over nor counts as stale.
        for _ in 0..18 {
            assert!(limiter.check_source(src(1), 995));
        }
        assert!(!limiter.check_source(src(1), 995));
        assert_eq!(limiter.tracked_sources(), 1);

        // Forward progress from the window's opening second still recovers.
        assert!(limiter.check_source(src(1), 1_010));
    }

    #[test]
    fn test_first_query_of_fresh_source_passes_source_check() {
        let settings = LimitSettings {
            max_queries_per_sec: 0.0,
            ..small_settings()
        };
        let mut limiter = RateLimiter::new(settings);

        // A zero per-source ceiling cannot deny the very first query from
        // a source; that one only faces the aggregate check.
        assert!(limiter.check_source(src(1), 0));
        assert!(!limiter.check_source(src(1), 0));
    }

    #[test]
    fn test_fresh_global_window_rolls_on_first_check() {
        let settings = LimitSettings {
            max_queries_per_sec: 0.0,
            global_max_queries_per_sec: 0.0,
            ..small_settings()
        };
        let mut limiter = RateLimiter::new(settings);

        // The aggregate window opens at time zero, so a first check at
        // wall-clock scale sees it as long expired and rolls it. Even a
        // total lockdown admits that one query.
        assert!(limiter.check_source(src(1), 1_700_000_000));

        // With the window now current the lockdown holds: the same source
        // is over its ceiling and a new source is over the aggregate one.
        assert!(!limiter.check_source(src(1), 1_700_000_000));
        assert!(!limiter.check_source(src(2), 1_700_000_000));
    }

    #[test]
    fn test_settings_change_applies_to_live_state() {
        let mut limiter = RateLimiter::new(small_settings());

        for _ in 0..20 {
            limiter.check_source(src(1), 0);
        }
        assert!(!limiter.check_source(src(1), 0));

        let mut relaxed = small_settings();
        relaxed.max_queries_per_sec = 100.0;
        limiter.set_settings(relaxed);

        // Same window, same counts, new ceiling.
        assert!(limiter.check_source(src(1), 0));
    }

    #[test]
    fn test_stats_account_for_every_decision() {
        let mut limiter = RateLimiter::new(small_settings());

        let mut allowed = 0u64;
        for i in 0..30i64 {
            if limiter.check_source(src(1), i / 10) {
                allowed += 1;
            }
        }
        let stats = limiter.stats();
        assert_eq!(stats.checked, 30);
        assert_eq!(
            allowed + stats.blocked_by_source + stats.blocked_by_global,
            stats.checked
        );
        assert!(stats.blocked_by_source > 0);
    }

    #[test]
    fn test_random_flood_stays_within_memory_bounds() {
        use rand::Rng;

        let settings = LimitSettings {
            max_tracked_sources: 100,
            ..small_settings()
        };
        let mut limiter = RateLimiter::new(settings);
        let mut rng = rand::thread_rng();

        for i in 0..10_000 {
            let key = src(rng.gen::<u64>());
            let now = (i / 500) as i64;
            limiter.check_source(key, now);
            assert!(
                limiter.tracked_sources() <= 101,
                "table exceeded ceiling at query {i}"
            );
        }
        assert!(limiter.stats().flood_resets > 0);
    }
}
