use std::sync::Arc;

use dashmap::DashMap;

use crate::counter::{Counter, Key, StatAccumulator};

/// Combined counter for one key plus the per-marker counters it is built from.
struct AggregatedCounter {
    combined: Counter,
    leaves: DashMap<Arc<str>, Arc<Counter>>,
}

impl AggregatedCounter {
    fn new(key: Key) -> Self {
        Self {
            combined: Counter::new(key),
            leaves: DashMap::new(),
        }
    }

    /// Rebuilds the combined statistics as the merge of every current
    /// per-marker accumulator. Concurrency is the sum across markers.
    fn recompute(&self) {
        self.combined.recompute(|| {
            let mut merged = StatAccumulator::new();
            let mut concurrency = 0i32;
            for leaf in self.leaves.iter() {
                merged.merge_from(&leaf.value().statistics());
                concurrency = concurrency.saturating_add(leaf.value().current_concurrency());
            }
            (merged, concurrency)
        });
    }
}

/// Merges statistics reported by independent sources ("markers").
///
/// Each `(key, marker)` keeps the latest report from that marker. A report
/// replaces the marker's previous contribution, then the combined counter
/// for the key is recomputed over all markers seen so far.
#[derive(Default)]
pub struct DistributedAggregator {
    aggregates: DashMap<Key, Arc<AggregatedCounter>>,
    by_marker: DashMap<Arc<str>, DashMap<Key, Arc<Counter>>>,
}

impl DistributedAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one report from `marker` for `key`.
    pub fn update(&self, key: &Key, marker: &str, stats: StatAccumulator, concurrency: i32) {
        let marker: Arc<str> = Arc::from(marker);
        let leaf = self.leaf(key, &marker);
        leaf.replace(stats, concurrency);

        let aggregate = Arc::clone(
            self.aggregates
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AggregatedCounter::new(key.clone())))
                .value(),
        );
        aggregate
            .leaves
            .entry(marker)
            .or_insert_with(|| Arc::clone(&leaf));
        aggregate.recompute();
    }

    fn leaf(&self, key: &Key, marker: &Arc<str>) -> Arc<Counter> {
        if let Some(counters) = self.by_marker.get(marker) {
            if let Some(existing) = counters.get(key) {
                return Arc::clone(existing.value());
            }
        }

        let counters = self.by_marker.entry(Arc::clone(marker)).or_default();
        let leaf = counters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Counter::new(key.clone())));
        Arc::clone(leaf.value())
    }

    /// The counter combining every marker's report for `key`.
    pub fn aggregate(&self, key: &Key) -> Option<AggregateView> {
        self.aggregates
            .get(key)
            .map(|a| AggregateView(Arc::clone(a.value())))
    }

    /// All combined counters.
    pub fn aggregates(&self) -> Vec<AggregateView> {
        self.aggregates
            .iter()
            .map(|a| AggregateView(Arc::clone(a.value())))
            .collect()
    }

    /// The counter holding only `marker`'s latest report for `key`.
    pub fn counter_for_marker(&self, key: &Key, marker: &str) -> Option<Arc<Counter>> {
        self.by_marker
            .get(marker)
            .and_then(|counters| counters.get(key).map(|c| Arc::clone(c.value())))
    }

    pub fn counters_for_marker(&self, marker: &str) -> Vec<Arc<Counter>> {
        self.by_marker
            .get(marker)
            .map(|counters| counters.iter().map(|c| Arc::clone(c.value())).collect())
            .unwrap_or_default()
    }

    pub fn markers(&self) -> Vec<String> {
        let mut markers: Vec<String> = self.by_marker.iter().map(|e| e.key().to_string()).collect();
        markers.sort();
        markers
    }

    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    pub fn clear(&self) {
        self.aggregates.clear();
        self.by_marker.clear();
    }
}

/// Read handle on a combined counter.
pub struct AggregateView(Arc<AggregatedCounter>);

impl AggregateView {
    pub fn counter(&self) -> &Counter {
        &self.0.combined
    }

    /// Markers contributing to this key.
    pub fn markers(&self) -> Vec<String> {
        let mut markers: Vec<String> = self.0.leaves.iter().map(|e| e.key().to_string()).collect();
        markers.sort();
        markers
    }
}

impl std::ops::Deref for AggregateView {
    type Target = Counter;

    fn deref(&self) -> &Counter {
        &self.0.combined
    }
}
