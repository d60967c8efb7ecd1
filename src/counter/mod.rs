pub mod role;
pub mod stats;
pub mod unit;

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;

pub use role::Role;
pub use stats::{StatAccumulator, StatSummary};
pub use unit::{Unit, UnitError};

/// Identity of one measured thing: a role plus a name within that role.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key {
    role: Role,
    name: Arc<str>,
}

impl Key {
    pub fn new(role: Role, name: impl Into<Arc<str>>) -> Self {
        Self {
            role,
            name: name.into(),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}/{})", self.role.name(), self.name)
    }
}

/// Statistics, in-flight concurrency and its high-water mark for one [`Key`].
///
/// Statistic reads share a read lock; `add` is the single write path.
/// Concurrency tracking is atomic and never touches the statistics lock.
pub struct Counter {
    key: Key,
    stats: RwLock<StatAccumulator>,
    concurrency: AtomicI32,
    max_concurrency: AtomicI32,
    last_update_ms: AtomicU64,
}

impl Counter {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            stats: RwLock::new(StatAccumulator::new()),
            concurrency: AtomicI32::new(0),
            max_concurrency: AtomicI32::new(0),
            last_update_ms: AtomicU64::new(now_ms()),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Adds `delta`, expressed in `unit`, after converting it into the
    /// role's unit.
    pub fn add(&self, delta: f64, unit: &Unit) -> Result<(), UnitError> {
        let value = self.key.role().unit().convert(delta, unit)?;
        self.add_internal(value);
        Ok(())
    }

    /// Adds a value already expressed in the role's unit.
    pub fn add_internal(&self, value: f64) {
        self.stats.write().add_value(value);
        self.touch();
    }

    /// Overwrites the statistics and concurrency with values computed
    /// elsewhere. Used for counters mirroring a remote source.
    pub fn replace(&self, stats: StatAccumulator, concurrency: i32) {
        *self.stats.write() = stats;
        self.concurrency.store(concurrency, Ordering::Relaxed);
        self.update_concurrency(concurrency);
        self.touch();
    }

    /// Recomputes the statistics from `f` while holding the write lock, so
    /// concurrent recomputations cannot interleave.
    pub(crate) fn recompute(&self, f: impl FnOnce() -> (StatAccumulator, i32)) {
        let mut guard = self.stats.write();
        let (stats, concurrency) = f();
        *guard = stats;
        self.concurrency.store(concurrency, Ordering::Relaxed);
        self.update_concurrency(concurrency);
        drop(guard);
        self.touch();
    }

    /// Clears the statistics and the concurrency watermark. The counter stays
    /// registered in its store.
    pub fn reset(&self) {
        self.stats.write().clear();
        self.max_concurrency.store(0, Ordering::Relaxed);
    }

    /// Snapshots the statistics recorded since the last drain and resets
    /// them in place, under one write lock. Returns `None` without hits.
    ///
    /// The watermark restarts from the operations still in flight.
    pub fn drain(&self) -> Option<CounterSnapshot> {
        let mut guard = self.stats.write();
        if guard.hits() == 0 {
            return None;
        }

        let stats = *guard;
        guard.clear();
        let concurrency = self.current_concurrency();
        let max_concurrency = self.max_concurrency.swap(concurrency, Ordering::AcqRel);
        drop(guard);

        Some(CounterSnapshot {
            role: self.key.role().name().to_string(),
            unit: self.key.role().unit().name(),
            name: self.key.name().to_string(),
            stats: stats.summary(),
            concurrency,
            max_concurrency,
        })
    }

    /// Marks one more operation in flight and returns the new level.
    pub fn increment_concurrency(&self) -> i32 {
        let current = self.concurrency.fetch_add(1, Ordering::AcqRel) + 1;
        self.update_concurrency(current);
        current
    }

    /// Marks one operation as finished and returns the new level.
    pub fn decrement_concurrency(&self) -> i32 {
        self.concurrency.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Raises the high-water mark to `n` if it is lower.
    pub fn update_concurrency(&self, n: i32) {
        self.max_concurrency.fetch_max(n, Ordering::AcqRel);
    }

    pub fn current_concurrency(&self) -> i32 {
        self.concurrency.load(Ordering::Acquire)
    }

    pub fn max_concurrency(&self) -> i32 {
        self.max_concurrency.load(Ordering::Acquire)
    }

    /// Starts timing one operation. Only meaningful for time roles.
    #[must_use = "the stopwatch records nothing until stopped"]
    pub fn start_watch(&self) -> Stopwatch<'_> {
        self.increment_concurrency();
        Stopwatch {
            counter: self,
            started: Instant::now(),
        }
    }

    /// Point-in-time copy of the statistics.
    pub fn statistics(&self) -> StatAccumulator {
        *self.stats.read()
    }

    pub fn hits(&self) -> u64 {
        self.stats.read().hits()
    }

    pub fn sum(&self) -> f64 {
        self.stats.read().sum()
    }

    pub fn min(&self) -> f64 {
        self.stats.read().min()
    }

    pub fn max(&self) -> f64 {
        self.stats.read().max()
    }

    pub fn mean(&self) -> f64 {
        self.stats.read().mean()
    }

    pub fn variance(&self) -> f64 {
        self.stats.read().variance()
    }

    pub fn stddev(&self) -> f64 {
        self.stats.read().stddev()
    }

    /// Milliseconds since the epoch of the last write.
    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            role: self.key.role().name().to_string(),
            unit: self.key.role().unit().name(),
            name: self.key.name().to_string(),
            stats: self.statistics().summary(),
            concurrency: self.current_concurrency(),
            max_concurrency: self.max_concurrency(),
        }
    }

    fn touch(&self) {
        self.last_update_ms.store(now_ms(), Ordering::Relaxed);
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("key", &self.key)
            .field("hits", &self.hits())
            .field("concurrency", &self.current_concurrency())
            .finish()
    }
}

/// Immutable copy of a counter, safe to hand to sinks and serialize.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub role: String,
    pub unit: &'static str,
    pub name: String,
    #[serde(flatten)]
    pub stats: StatSummary,
    pub concurrency: i32,
    pub max_concurrency: i32,
}

/// Times one operation against a [`Counter`].
pub struct Stopwatch<'a> {
    counter: &'a Counter,
    started: Instant,
}

impl Stopwatch<'_> {
    /// Records the elapsed time in nanoseconds and releases the concurrency
    /// slot taken at start.
    pub fn stop(self) -> Result<Duration, UnitError> {
        let elapsed = self.started.elapsed();
        self.counter.decrement_concurrency();
        self.counter
            .add(elapsed.as_nanos() as f64, &Unit::NANOSECOND)?;
        Ok(elapsed)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
