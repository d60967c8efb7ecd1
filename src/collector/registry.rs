use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Consecutive failed pulls after which a node leaves the polling set.
pub const DEAD_COUNT: u32 = 5;

/// A remote agent polled by the collector.
#[derive(Debug)]
pub struct AgentNode {
    url: String,
    misses: AtomicU32,
}

impl AgentNode {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            misses: AtomicU32::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// A successful pull resets the miss counter.
    pub fn ok(&self) {
        self.misses.store(0, Ordering::Relaxed);
    }

    /// A failed pull counts one more miss.
    pub fn ko(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn misses(&self) -> u32 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn is_dead(&self) -> bool {
        self.misses() > DEAD_COUNT
    }
}

/// Registered pull targets keyed by URL.
///
/// Dead nodes are not notified; they are dropped by the next
/// [`NodeRegistry::live_nodes`] sweep and can come back by registering again.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, Arc<AgentNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `url` unless it is already registered. Returns true when added.
    pub fn register(&self, url: &str) -> bool {
        if self.nodes.contains_key(url) {
            return false;
        }

        let mut added = false;
        self.nodes.entry(url.to_string()).or_insert_with(|| {
            added = true;
            Arc::new(AgentNode::new(url))
        });

        if added {
            tracing::info!(node = url, "registered agent node");
        }
        added
    }

    pub fn node(&self, url: &str) -> Option<Arc<AgentNode>> {
        self.nodes.get(url).map(|n| Arc::clone(n.value()))
    }

    /// Removes dead nodes and returns the remaining ones.
    pub fn live_nodes(&self) -> Vec<Arc<AgentNode>> {
        self.nodes.retain(|url, node| {
            if node.is_dead() {
                tracing::warn!(node = %url, misses = node.misses(), "dropping dead agent node");
                false
            } else {
                true
            }
        });

        self.nodes.iter().map(|n| Arc::clone(n.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_insert_if_absent() {
        let registry = NodeRegistry::new();
        assert!(registry.register("http://a:8080/"));
        let first = registry.node("http://a:8080/").expect("node");
        first.ko();

        assert!(!registry.register("http://a:8080/"));
        assert_eq!(registry.len(), 1);
        // The first node and its miss count are kept.
        assert_eq!(registry.node("http://a:8080/").map(|n| n.misses()), Some(1));
    }

    #[test]
    fn test_node_dropped_after_six_failures() {
        let registry = NodeRegistry::new();
        registry.register("http://dead/");
        registry.register("http://alive/");

        let dead = registry.node("http://dead/").expect("node");
        for _ in 0..DEAD_COUNT {
            dead.ko();
        }
        assert_eq!(registry.live_nodes().len(), 2, "five misses is still alive");

        dead.ko();
        let live: Vec<String> = registry.live_nodes().iter().map(|n| n.url().to_string()).collect();
        assert_eq!(live, vec!["http://alive/"]);
        assert!(registry.node("http://dead/").is_none());
    }

    #[test]
    fn test_ok_resets_misses() {
        let registry = NodeRegistry::new();
        registry.register("http://flaky/");
        let node = registry.node("http://flaky/").expect("node");
        for _ in 0..DEAD_COUNT {
            node.ko();
        }
        node.ok();
        node.ko();
        assert_eq!(node.misses(), 1);
        assert_eq!(registry.live_nodes().len(), 1);
    }
}
