use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::counter::now_ms;

/// Health of a single validation, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Degraded,
    Ko,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub message: String,
}

/// Last validation report of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    /// Reception time, milliseconds since the epoch.
    pub date: u64,
    pub results: Vec<ValidationResult>,
}

impl NodeStatus {
    pub fn new(results: Vec<ValidationResult>) -> Self {
        Self {
            date: now_ms(),
            results,
        }
    }

    /// Worst status among the results, `Ok` when there are none.
    pub fn status(&self) -> Status {
        self.results
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(Status::Ok)
    }
}

/// Keeps the most recent [`NodeStatus`] per marker.
#[derive(Default)]
pub struct NodeStatusStore {
    statuses: DashMap<String, NodeStatus>,
}

impl NodeStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, marker: &str, status: NodeStatus) {
        self.statuses.insert(marker.to_string(), status);
    }

    pub fn status(&self, marker: &str) -> Option<NodeStatus> {
        self.statuses.get(marker).map(|s| s.value().clone())
    }

    pub fn statuses(&self) -> BTreeMap<String, NodeStatus> {
        self.statuses
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn reset(&self) {
        self.statuses.clear();
    }
}
