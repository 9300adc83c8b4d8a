//! Tracked-source bookkeeping.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Unbounded};

use super::source::SourceKey;

/// Accounting record for one tracked source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SourceRecord {
    /// Wall-clock second at which the current averaging window opened.
    pub window_start: i64,
    /// Queries seen from this source since `window_start`.
    pub count: u64,
}

/// The set of currently tracked sources.
///
/// A hash map holds the records and a B-tree set of `(window_start, key)`
/// pairs keeps them in window-age order for the prune walk. Every record
/// has exactly one index entry; all mutation goes through methods that
/// update both sides together.
#[derive(Debug, Default)]
pub(crate) struct SourceTable {
    records: HashMap<SourceKey, SourceRecord>,
    by_window: BTreeSet<(i64, SourceKey)>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked sources.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Current record for a source, if tracked.
    pub fn get(&self, key: SourceKey) -> Option<SourceRecord> {
        self.records.get(&key).copied()
    }

    /// Start tracking a source with a fresh window opened at `now`.
    ///
    /// Replaces any existing record for the same source.
    pub fn insert(&mut self, key: SourceKey, now: i64) {
        let fresh = SourceRecord {
            window_start: now,
            count: 1,
        };
        if let Some(old) = self.records.insert(key, fresh) {
            self.by_window.remove(&(old.window_start, key));
        }
        self.by_window.insert((now, key));
    }

    /// Count one more query inside the source's current window and return
    /// the new count. Saturates rather than wrapping; a wrapped count would
    /// quietly reopen the gate for a flooder.
    pub fn increment(&mut self, key: SourceKey) -> Option<u64> {
        let record = self.records.get_mut(&key)?;
        record.count = record.count.saturating_add(1);
        Some(record.count)
    }

    /// Open a new window for the source at `now` with its count back at 1.
    pub fn roll_window(&mut self, key: SourceKey, now: i64) {
        if let Some(record) = self.records.get_mut(&key) {
            self.by_window.remove(&(record.window_start, key));
            record.window_start = now;
            record.count = 1;
            self.by_window.insert((now, key));
        }
    }

    /// Stop tracking a source.
    pub fn remove(&mut self, key: SourceKey) {
        if let Some(record) = self.records.remove(&key) {
            self.by_window.remove(&(record.window_start, key));
        }
    }

    /// The index entry with the oldest window strictly after `cursor`, or
    /// the oldest overall when `cursor` is `None`.
    pub fn oldest_after(&self, cursor: Option<(i64, SourceKey)>) -> Option<(i64, SourceKey)> {
        match cursor {
            None => self.by_window.iter().next().copied(),
            Some(prev) => self.by_window.range((Excluded(prev), Unbounded)).next().copied(),
        }
    }

    /// Drop every tracked source.
    pub fn clear(&mut self) {
        self.records.clear();
        self.by_window.clear();
    }
}
