use std::collections::HashMap;
use std::ops::RangeInclusive;

use anyhow::Result;
use dashmap::DashMap;

use crate::tracking::entry::{PathCallInformation, PathTrackingEntry};

/// Destination for completed call-path entries.
///
/// Called synchronously from application threads when a root frame closes
/// and from pipeline consumers on the collector.
pub trait PathTrackingStore: Send + Sync {
    fn store_path_entries(&self, entries: HashMap<String, Vec<PathTrackingEntry>>) -> Result<()>;

    /// Groups `entries` by tracking id and stores them.
    fn store(&self, entries: Vec<PathTrackingEntry>) -> Result<()> {
        self.store_path_entries(group_by_tracking_id(entries))
    }
}

pub fn group_by_tracking_id(
    entries: Vec<PathTrackingEntry>,
) -> HashMap<String, Vec<PathTrackingEntry>> {
    let mut grouped: HashMap<String, Vec<PathTrackingEntry>> = HashMap::new();
    for entry in entries {
        grouped
            .entry(entry.tracking_id.clone())
            .or_default()
            .push(entry);
    }
    grouped
}

/// Keeps every entry in memory, grouped by tracking id in arrival order.
#[derive(Default)]
pub struct InMemoryPathTrackingStore {
    entries: DashMap<String, Vec<PathTrackingEntry>>,
}

impl InMemoryPathTrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries of one transaction.
    pub fn retrieve(&self, tracking_id: &str) -> Vec<PathTrackingEntry> {
        self.entries
            .get(tracking_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Transactions whose earliest entry started within `range`
    /// (milliseconds since the epoch), oldest first.
    pub fn retrieve_tracking_ids(&self, range: RangeInclusive<u64>) -> Vec<PathCallInformation> {
        let mut calls: Vec<PathCallInformation> = self
            .entries
            .iter()
            .filter_map(|e| {
                let first_ns = e.value().iter().map(|entry| entry.start_time).min()?;
                let start_ms = first_ns / 1_000_000;
                range.contains(&start_ms).then(|| PathCallInformation {
                    tracking_id: e.key().clone(),
                    start_time: start_ms,
                })
            })
            .collect();
        calls.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.tracking_id.cmp(&b.tracking_id))
        });
        calls
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl PathTrackingStore for InMemoryPathTrackingStore {
    fn store_path_entries(&self, entries: HashMap<String, Vec<PathTrackingEntry>>) -> Result<()> {
        for (tracking_id, mut batch) in entries {
            self.entries
                .entry(tracking_id)
                .or_default()
                .append(&mut batch);
        }
        Ok(())
    }
}
