//! Counter, gauge, status and path-tracking stores.
//!
//! Agent-side stores ([`counter`], [`batch`], [`gauge`]) accumulate local
//! measurements; collector-side stores ([`aggregator`], [`status`] and the
//! gauge series) hold what remote nodes report.

pub mod aggregator;
pub mod batch;
pub mod counter;
pub mod gauge;
pub mod path;
pub mod schedule;
pub mod status;

pub use aggregator::DistributedAggregator;
pub use batch::{BatchCounterStore, CounterBatch, CounterSink};
pub use counter::CounterStore;
pub use gauge::{AggregatedGaugeStore, GaugeAccumulator, GaugeBatch, GaugeSeriesStore, GaugeSink};
pub use path::{InMemoryPathTrackingStore, PathTrackingStore};
pub use status::{NodeStatus, NodeStatusStore};
