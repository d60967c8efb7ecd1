use std::collections::BTreeMap;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use dashmap::DashMap;
use serde::Serialize;

use super::schedule::ScheduledTask;
use crate::counter::{now_ms, Role, StatAccumulator};
use crate::export::health::HealthMetrics;

/// One flushed gauge window for a role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GaugeAggregate {
    pub role: String,
    pub unit: &'static str,
    pub time: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub n: u64,
    pub sum: f64,
}

/// Gauge windows reported by one source.
#[derive(Debug, Clone, Serialize)]
pub struct GaugeBatch {
    pub marker: String,
    pub gauges: Vec<GaugeAggregate>,
}

/// Destination for flushed gauge windows.
pub trait GaugeSink: Send + Sync + 'static {
    fn push_gauges(&self, batch: GaugeBatch) -> impl Future<Output = Result<()>> + Send;
}

/// Accumulates raw gauge samples per role between flushes.
///
/// A flush turns each role's samples into one [`GaugeAggregate`] and
/// forgets them. Roles without samples since the last flush are omitted.
#[derive(Default)]
pub struct GaugeAccumulator {
    gauges: DashMap<Role, parking_lot::Mutex<StatAccumulator>>,
}

impl GaugeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_to_gauge(&self, role: &Role, value: f64) {
        if let Some(stats) = self.gauges.get(role) {
            stats.lock().add_value(value);
            return;
        }
        self.gauges
            .entry(role.clone())
            .or_default()
            .lock()
            .add_value(value);
    }

    /// Stops tracking `role`; pending samples are discarded.
    pub fn gauge_stopped(&self, role: &Role) {
        self.gauges.remove(role);
    }

    pub fn flush(&self) -> Vec<GaugeAggregate> {
        let time = now_ms();
        let roles: Vec<Role> = self.gauges.iter().map(|e| e.key().clone()).collect();

        roles
            .into_iter()
            .filter_map(|role| self.gauges.remove(&role))
            .map(|(role, stats)| {
                let stats = stats.into_inner();
                GaugeAggregate {
                    role: role.name().to_string(),
                    unit: role.unit().name(),
                    time,
                    mean: stats.mean(),
                    min: stats.min(),
                    max: stats.max(),
                    n: stats.hits(),
                    sum: stats.sum(),
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.gauges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty()
    }
}

/// [`GaugeAccumulator`] flushed to a [`GaugeSink`] on a fixed period.
pub struct AggregatedGaugeStore<S: GaugeSink> {
    gauges: Arc<GaugeAccumulator>,
    sink: Arc<S>,
    marker: Arc<str>,
    period: Duration,
    health: Option<Arc<HealthMetrics>>,
    task: parking_lot::Mutex<Option<ScheduledTask>>,
}

impl<S: GaugeSink> AggregatedGaugeStore<S> {
    pub fn new(sink: Arc<S>, marker: impl Into<Arc<str>>, period: Duration) -> Self {
        Self::with_accumulator(Arc::new(GaugeAccumulator::new()), sink, marker, period)
    }

    /// Flushes an accumulator that other readers may drain as well.
    pub fn with_accumulator(
        gauges: Arc<GaugeAccumulator>,
        sink: Arc<S>,
        marker: impl Into<Arc<str>>,
        period: Duration,
    ) -> Self {
        Self {
            gauges,
            sink,
            marker: marker.into(),
            period,
            health: None,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Counts every flush in `store_flushes{store="gauge"}`.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Records one gauge sample.
    pub fn record_gauge(&self, role: &Role, value: f64) {
        self.gauges.add_to_gauge(role, value);
    }

    pub fn gauges(&self) -> &Arc<GaugeAccumulator> {
        &self.gauges
    }

    pub fn start(&self) -> Result<()> {
        if self.period.is_zero() {
            bail!("gauge store period must be positive");
        }

        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }

        let gauges = Arc::clone(&self.gauges);
        let sink = Arc::clone(&self.sink);
        let marker = Arc::clone(&self.marker);
        let health = self.health.clone();

        *task = Some(ScheduledTask::spawn(
            "aggregated-gauge-store",
            self.period,
            move || {
                let gauges = Arc::clone(&gauges);
                let sink = Arc::clone(&sink);
                let marker = Arc::clone(&marker);
                let health = health.clone();
                async move {
                    let batch = GaugeBatch {
                        marker: marker.to_string(),
                        gauges: gauges.flush(),
                    };
                    if let Some(health) = &health {
                        health.store_flushes.with_label_values(&["gauge"]).inc();
                    }
                    sink.push_gauges(batch).await
                }
            },
        ));

        Ok(())
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    role: Role,
    marker: Arc<str>,
}

/// Collector-side gauge history: one bounded, time-ordered series per
/// `(role, marker)`. The oldest point is evicted once a series is full.
pub struct GaugeSeriesStore {
    series: DashMap<SeriesKey, parking_lot::Mutex<BTreeMap<u64, f64>>>,
    max_size: usize,
}

impl GaugeSeriesStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            series: DashMap::new(),
            max_size: max_size.max(1),
        }
    }

    pub fn add_to_gauge(&self, role: &Role, time: u64, value: f64, marker: &str) {
        let key = SeriesKey {
            role: role.clone(),
            marker: Arc::from(marker),
        };
        let entry = self.series.entry(key).or_default();
        let mut points = entry.lock();
        points.insert(time, value);
        while points.len() > self.max_size {
            points.pop_first();
        }
    }

    /// Points of `role` within `range` for one marker.
    pub fn gauge_values_for_marker(
        &self,
        role: &Role,
        range: RangeInclusive<u64>,
        marker: &str,
    ) -> BTreeMap<u64, f64> {
        let key = SeriesKey {
            role: role.clone(),
            marker: Arc::from(marker),
        };
        self.series
            .get(&key)
            .map(|points| {
                points
                    .lock()
                    .range(range)
                    .map(|(t, v)| (*t, *v))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Points of `role` within `range` across every marker. Values sharing a
    /// timestamp are summed.
    pub fn gauge_values(&self, role: &Role, range: RangeInclusive<u64>) -> BTreeMap<u64, f64> {
        let mut merged = BTreeMap::new();
        for entry in self.series.iter().filter(|e| &e.key().role == role) {
            for (t, v) in entry.value().lock().range(range.clone()) {
                *merged.entry(*t).or_insert(0.0) += *v;
            }
        }
        merged
    }

    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.series.iter().map(|e| e.key().role.clone()).collect();
        roles.sort_by(|a, b| a.name().cmp(b.name()));
        roles.dedup();
        roles
    }

    pub fn markers(&self, role: &Role) -> Vec<String> {
        let mut markers: Vec<String> = self
            .series
            .iter()
            .filter(|e| &e.key().role == role)
            .map(|e| e.key().marker.to_string())
            .collect();
        markers.sort();
        markers
    }

    pub fn clear(&self) {
        self.series.clear();
    }
}
