pub mod entry;

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::store::path::PathTrackingStore;
use entry::PathTrackingEntry;

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Per-thread state of the transaction being tracked.
struct Context {
    /// Distinguishes this transaction from earlier ones on the same thread.
    generation: u64,
    tracking_id: String,
    level: u32,
    current: Option<usize>,
    frames: Vec<FrameRecord>,
    entries: Vec<PathTrackingEntry>,
}

impl Context {
    fn new() -> Self {
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            tracking_id: uuid::Uuid::new_v4().to_string(),
            level: 0,
            current: None,
            frames: Vec::with_capacity(16),
            entries: Vec::with_capacity(16),
        }
    }
}

struct FrameRecord {
    class_name: String,
    method_name: String,
    parent: Option<usize>,
    level: u32,
    /// Whether opening this frame raised the thread's level.
    nested: bool,
    started: Instant,
    start_epoch_ns: u64,
}

/// Handle to an open frame. Bound to the thread that opened it and to the
/// transaction it was opened in.
#[must_use = "a frame must be passed back to PathTracker::stop"]
pub struct Frame {
    index: usize,
    generation: u64,
    _thread_bound: PhantomData<*const ()>,
}

/// Reconstructs call trees per thread from start/stop notifications.
///
/// Frames form a parent-linked arena in thread-local storage. Re-entering
/// the site of the current frame (same class and method) keeps the level
/// unchanged. When the root frame closes, every entry of the transaction is
/// handed to the store in one call and the thread starts fresh.
///
/// A thread that never closes its root frame keeps its context alive;
/// [`PathTracker::abandon_thread_context`] discards it explicitly.
pub struct PathTracker {
    node_id: Arc<str>,
    store: Arc<dyn PathTrackingStore>,
}

impl PathTracker {
    pub fn new(node_id: impl Into<Arc<str>>, store: Arc<dyn PathTrackingStore>) -> Self {
        Self {
            node_id: node_id.into(),
            store,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Opens a frame for `class_name::method_name` on the calling thread.
    pub fn start(&self, class_name: &str, method_name: &str) -> Frame {
        let start_epoch_ns = epoch_ns();

        CONTEXT.with(|cell| {
            let mut slot = cell.borrow_mut();
            let ctx = slot.get_or_insert_with(Context::new);

            let (level, nested) = match ctx.current.and_then(|i| ctx.frames.get(i)) {
                None => {
                    ctx.level = 1;
                    (1, true)
                }
                Some(current)
                    if current.class_name == class_name && current.method_name == method_name =>
                {
                    (ctx.level, false)
                }
                Some(_) => {
                    ctx.level += 1;
                    (ctx.level, true)
                }
            };

            let index = ctx.frames.len();
            ctx.frames.push(FrameRecord {
                class_name: class_name.to_string(),
                method_name: method_name.to_string(),
                parent: ctx.current,
                level,
                nested,
                started: Instant::now(),
                start_epoch_ns,
            });
            ctx.current = Some(index);

            Frame {
                index,
                generation: ctx.generation,
                _thread_bound: PhantomData,
            }
        })
    }

    /// Closes `frame`, recording its entry. Closing the root frame flushes
    /// the whole transaction to the store.
    pub fn stop(&self, frame: Frame) {
        let flushed = CONTEXT.with(|cell| {
            let mut slot = cell.borrow_mut();
            let ctx = slot.as_mut()?;

            if ctx.generation != frame.generation {
                tracing::warn!(frame = frame.index, "ignoring frame from a finished transaction");
                return None;
            }

            let Some(record) = ctx.frames.get(frame.index) else {
                tracing::warn!(frame = frame.index, "stopping unknown path frame");
                return None;
            };

            let execution_time = record.started.elapsed().as_nanos() as u64;
            let parent = record.parent;
            let level = record.level;

            if record.nested && parent.is_some() {
                ctx.level = ctx.level.saturating_sub(1);
            }
            ctx.current = parent;

            let entry = PathTrackingEntry {
                tracking_id: ctx.tracking_id.clone(),
                node_id: self.node_id.to_string(),
                class_name: record.class_name.clone(),
                method_name: record.method_name.clone(),
                start_time: record.start_epoch_ns,
                execution_time,
                level,
            };
            ctx.entries.push(entry);

            if level == 1 && parent.is_none() {
                return slot.take().map(|ctx| ctx.entries);
            }
            None
        });

        // The thread-local borrow is released before calling into the store.
        if let Some(entries) = flushed {
            if let Err(e) = self.store.store(entries) {
                tracing::error!(error = %e, "storing path tracking entries failed");
            }
        }
    }

    /// Runs `f` inside a frame.
    pub fn track<R>(&self, class_name: &str, method_name: &str, f: impl FnOnce() -> R) -> R {
        let frame = self.start(class_name, method_name);
        let result = f();
        self.stop(frame);
        result
    }

    /// Tracking id of the calling thread's open transaction, if any.
    pub fn current_tracking_id() -> Option<String> {
        CONTEXT.with(|cell| cell.borrow().as_ref().map(|ctx| ctx.tracking_id.clone()))
    }

    /// Call depth of the calling thread's open transaction, 0 when idle.
    pub fn current_level() -> u32 {
        CONTEXT.with(|cell| cell.borrow().as_ref().map_or(0, |ctx| ctx.level))
    }

    /// Drops the calling thread's open transaction without storing it and
    /// returns how many completed entries were discarded.
    pub fn abandon_thread_context() -> usize {
        let discarded = CONTEXT.with(|cell| cell.borrow_mut().take());
        match discarded {
            Some(ctx) => {
                tracing::warn!(
                    tracking_id = %ctx.tracking_id,
                    entries = ctx.entries.len(),
                    open_frames = ctx.frames.len() - ctx.entries.len(),
                    "abandoning unfinished path tracking context",
                );
                ctx.entries.len()
            }
            None => 0,
        }
    }
}

fn epoch_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::thread;

    use anyhow::Result;

    use super::*;

    #[derive(Default)]
    struct RecordingStore {
        flushes: parking_lot::Mutex<Vec<HashMap<String, Vec<PathTrackingEntry>>>>,
    }

    impl PathTrackingStore for RecordingStore {
        fn store_path_entries(
            &self,
            entries: HashMap<String, Vec<PathTrackingEntry>>,
        ) -> Result<()> {
            self.flushes.lock().push(entries);
            Ok(())
        }
    }

    fn tracker() -> (PathTracker, Arc<RecordingStore>) {
        let store = Arc::new(RecordingStore::default());
        let tracker = PathTracker::new("node", Arc::clone(&store) as Arc<dyn PathTrackingStore>);
        (tracker, store)
    }

    fn only_flush(store: &RecordingStore) -> Vec<PathTrackingEntry> {
        let flushes = store.flushes.lock();
        assert_eq!(flushes.len(), 1, "expected exactly one flush");
        let mut groups: Vec<_> = flushes[0].values().cloned().collect();
        assert_eq!(groups.len(), 1, "expected a single tracking id");
        groups.remove(0)
    }

    #[test]
    fn test_nested_calls_get_increasing_levels() {
        let (tracker, store) = tracker();

        let root = tracker.start("Shop", "root");
        let child = tracker.start("Shop", "child");
        let grandchild = tracker.start("Shop", "grandchild");
        assert_eq!(PathTracker::current_level(), 3);
        tracker.stop(grandchild);
        tracker.stop(child);
        assert!(store.flushes.lock().is_empty());
        tracker.stop(root);

        let entries = only_flush(&store);
        assert_eq!(entries.len(), 3);
        let levels: HashMap<&str, u32> = entries
            .iter()
            .map(|e| (e.method_name.as_str(), e.level))
            .collect();
        assert_eq!(levels["root"], 1);
        assert_eq!(levels["child"], 2);
        assert_eq!(levels["grandchild"], 3);

        let tracking_id = &entries[0].tracking_id;
        assert!(entries.iter().all(|e| &e.tracking_id == tracking_id));
        assert!(entries.iter().all(|e| e.node_id == "node"));
        assert_eq!(PathTracker::current_level(), 0);
        assert!(PathTracker::current_tracking_id().is_none());
    }

    #[test]
    fn test_recursion_keeps_level() {
        let (tracker, store) = tracker();

        tracker.track("Tree", "walk", || {
            tracker.track("Tree", "visit", || {
                tracker.track("Tree", "visit", || {
                    tracker.track("Tree", "visit", || {});
                });
            });
        });

        let entries = only_flush(&store);
        assert_eq!(entries.len(), 4);
        let visit_levels: Vec<u32> = entries
            .iter()
            .filter(|e| e.method_name == "visit")
            .map(|e| e.level)
            .collect();
        assert_eq!(visit_levels, vec![2, 2, 2]);
    }

    #[test]
    fn test_siblings_share_level() {
        let (tracker, store) = tracker();

        tracker.track("Api", "handle", || {
            tracker.track("Db", "query", || {});
            tracker.track("Cache", "get", || {});
        });

        let entries = only_flush(&store);
        let query = entries.iter().find(|e| e.method_name == "query");
        let get = entries.iter().find(|e| e.method_name == "get");
        assert_eq!(query.map(|e| e.level), Some(2));
        assert_eq!(get.map(|e| e.level), Some(2));
    }

    #[test]
    fn test_second_root_starts_fresh_transaction() {
        let (tracker, store) = tracker();

        tracker.track("Job", "first", || tracker.track("Job", "step", || {}));
        tracker.track("Job", "second", || {});

        let flushes = store.flushes.lock();
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0].values().map(Vec::len).sum::<usize>(), 2);
        assert_eq!(flushes[1].values().map(Vec::len).sum::<usize>(), 1);

        let first_id = flushes[0].keys().next().cloned();
        let second_id = flushes[1].keys().next().cloned();
        assert_ne!(first_id, second_id);
    }

    #[test]
    fn test_threads_track_independently() {
        let store = Arc::new(RecordingStore::default());
        let tracker = Arc::new(PathTracker::new(
            "node",
            Arc::clone(&store) as Arc<dyn PathTrackingStore>,
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    tracker.track("Worker", "run", || {
                        tracker.track("Worker", "step", || {});
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        let flushes = store.flushes.lock();
        assert_eq!(flushes.len(), 4);
        assert!(flushes
            .iter()
            .all(|f| f.len() == 1 && f.values().all(|entries| entries.len() == 2)));
    }

    #[test]
    fn test_abandon_discards_open_context() {
        let (tracker, store) = tracker();

        let root = tracker.start("Leaky", "root");
        tracker.track("Leaky", "child", || {});
        assert_eq!(PathTracker::abandon_thread_context(), 1);
        assert!(PathTracker::current_tracking_id().is_none());

        // With no open context the stale root handle is ignored.
        tracker.stop(root);
        assert!(store.flushes.lock().is_empty());
    }

    #[test]
    fn test_abandoned_frames_do_not_touch_next_transaction() {
        let (tracker, store) = tracker();

        let old_root = tracker.start("Old", "root");
        let old_child = tracker.start("Old", "child");
        PathTracker::abandon_thread_context();

        let root = tracker.start("New", "root");
        let child = tracker.start("New", "child");

        // Same indexes as the open frames, but from the abandoned transaction.
        tracker.stop(old_child);
        tracker.stop(old_root);
        assert!(store.flushes.lock().is_empty());
        assert_eq!(PathTracker::current_level(), 2);

        tracker.stop(child);
        tracker.stop(root);

        let entries = only_flush(&store);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.class_name == "New"));
    }

    #[test]
    fn test_frame_outliving_its_root_is_ignored() {
        let (tracker, store) = tracker();

        let root = tracker.start("Job", "root");
        let child = tracker.start("Job", "child");
        tracker.stop(root);

        let next = tracker.start("Job", "next");
        tracker.stop(child);
        assert_eq!(PathTracker::current_level(), 1);
        tracker.stop(next);

        let flushes = store.flushes.lock();
        assert_eq!(flushes.len(), 2);
        let second: Vec<&str> = flushes[1]
            .values()
            .flatten()
            .map(|e| e.method_name.as_str())
            .collect();
        assert_eq!(second, vec!["next"]);
    }
}
