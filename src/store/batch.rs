use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;

use super::counter::CounterStore;
use super::schedule::ScheduledTask;
use crate::counter::CounterSnapshot;
use crate::export::health::HealthMetrics;

/// Counter snapshots reported by one source.
#[derive(Debug, Clone, Serialize)]
pub struct CounterBatch {
    pub marker: String,
    pub counters: Vec<CounterSnapshot>,
}

/// Destination for periodically collected counters.
pub trait CounterSink: Send + Sync + 'static {
    fn push_counters(&self, batch: CounterBatch) -> impl Future<Output = Result<()>> + Send;
}

/// Wraps a [`CounterStore`] with a fixed-period push to a [`CounterSink`].
///
/// With `clear_on_collect` the pushed counters are reset in place, so each
/// push carries deltas rather than cumulative totals.
pub struct BatchCounterStore<S: CounterSink> {
    store: Arc<CounterStore>,
    sink: Arc<S>,
    marker: Arc<str>,
    period: Duration,
    clear_on_collect: bool,
    health: Option<Arc<HealthMetrics>>,
    task: parking_lot::Mutex<Option<ScheduledTask>>,
}

impl<S: CounterSink> BatchCounterStore<S> {
    pub fn new(
        store: Arc<CounterStore>,
        sink: Arc<S>,
        marker: impl Into<Arc<str>>,
        period: Duration,
        clear_on_collect: bool,
    ) -> Self {
        Self {
            store,
            sink,
            marker: marker.into(),
            period,
            clear_on_collect,
            health: None,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Counts every flush in `store_flushes{store="batch"}`.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    /// Starts the periodic push. Starting an already running store is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.period.is_zero() {
            bail!("batch counter store period must be positive");
        }

        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let sink = Arc::clone(&self.sink);
        let marker = Arc::clone(&self.marker);
        let clear = self.clear_on_collect;
        let health = self.health.clone();

        *task = Some(ScheduledTask::spawn(
            "batch-counter-store",
            self.period,
            move || {
                let store = Arc::clone(&store);
                let sink = Arc::clone(&sink);
                let marker = Arc::clone(&marker);
                let health = health.clone();
                async move {
                    push_once(&store, sink.as_ref(), &marker, clear, health.as_deref()).await
                }
            },
        ));

        tracing::info!(
            period = ?self.period,
            clear_on_collect = self.clear_on_collect,
            "batch counter store started",
        );

        Ok(())
    }

    /// Pushes the current counters immediately, outside the schedule.
    pub async fn flush(&self) -> Result<()> {
        push_once(
            &self.store,
            self.sink.as_ref(),
            &self.marker,
            self.clear_on_collect,
            self.health.as_deref(),
        )
        .await
    }

    /// Stops the schedule. Safe to call repeatedly.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
            tracing::info!("batch counter store stopped");
        }
    }
}

async fn push_once<S: CounterSink>(
    store: &CounterStore,
    sink: &S,
    marker: &str,
    clear: bool,
    health: Option<&HealthMetrics>,
) -> Result<()> {
    let counters = store.collect(clear);
    tracing::debug!(counters = counters.len(), "pushing counters");
    if let Some(health) = health {
        health.store_flushes.with_label_values(&["batch"]).inc();
    }
    sink.push_counters(CounterBatch {
        marker: marker.to_string(),
        counters,
    })
    .await
}
