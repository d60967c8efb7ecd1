use std::sync::Arc;

use dashmap::DashMap;

use crate::counter::{Counter, CounterSnapshot, Key, Unit, UnitError};

/// In-memory `Key -> Counter` map with insert-if-absent creation.
///
/// When `max_size` is non-zero the store is bounded: inserting a new key
/// into a full store first evicts the least recently updated share
/// (`eviction_ratio`) of counters.
pub struct CounterStore {
    counters: DashMap<Key, Arc<Counter>>,
    max_size: usize,
    eviction_ratio: f64,
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore {
    /// Creates an unbounded store.
    pub fn new() -> Self {
        Self::bounded(0, 0.25)
    }

    pub fn bounded(max_size: usize, eviction_ratio: f64) -> Self {
        Self {
            counters: DashMap::new(),
            max_size,
            eviction_ratio: eviction_ratio.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    /// Returns the counter for `key`, creating it on first access.
    ///
    /// Concurrent callers racing on the same key all receive the single
    /// instance that won the insert.
    pub fn get_or_create_counter(&self, key: &Key) -> Arc<Counter> {
        if let Some(existing) = self.counters.get(key) {
            return Arc::clone(existing.value());
        }

        if self.max_size > 0 && self.counters.len() >= self.max_size {
            self.evict();
        }

        let entry = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Counter::new(key.clone())));
        Arc::clone(entry.value())
    }

    pub fn get_counter(&self, key: &Key) -> Option<Arc<Counter>> {
        self.counters.get(key).map(|c| Arc::clone(c.value()))
    }

    /// Adds a value already expressed in the counter's role unit.
    pub fn add_to_counter(&self, counter: &Counter, delta: f64) {
        counter.add_internal(delta);
    }

    /// Records one timed operation of `elapsed_nanos` against `key`.
    pub fn record_timing(&self, key: &Key, elapsed_nanos: u64) -> Result<(), UnitError> {
        self.get_or_create_counter(key)
            .add(elapsed_nanos as f64, &Unit::NANOSECOND)
    }

    pub fn counters(&self) -> Vec<Arc<Counter>> {
        self.counters.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn snapshot(&self) -> Vec<CounterSnapshot> {
        self.counters.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Snapshots every counter. With `clear` each counter is drained in
    /// place instead, so the next collection only sees new activity, and
    /// counters without hits since the last drain are left out.
    ///
    /// Counters stay registered, so a `Stopwatch` or an `Arc<Counter>` held
    /// across the collection keeps writing into the next one.
    pub fn collect(&self, clear: bool) -> Vec<CounterSnapshot> {
        if !clear {
            return self.snapshot();
        }

        self.counters()
            .iter()
            .filter_map(|counter| counter.drain())
            .collect()
    }

    pub fn remove(&self, key: &Key) -> Option<Arc<Counter>> {
        self.counters.remove(key).map(|(_, c)| c)
    }

    pub fn clear_counters(&self) {
        self.counters.clear();
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn evict(&self) {
        let mut by_age: Vec<(Key, u64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().last_update_ms()))
            .collect();
        by_age.sort_by_key(|(_, last_update)| *last_update);

        let target = ((by_age.len() as f64) * self.eviction_ratio).ceil() as usize;
        let target = target.max(1);

        for (key, _) in by_age.into_iter().take(target) {
            self.counters.remove(&key);
        }

        tracing::debug!(evicted = target, max_size = self.max_size, "evicted counters");
    }
}
