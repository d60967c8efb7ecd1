pub mod push;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::event::{counter_event, gauge_event, path_tracking_event, WireEvent};
use crate::config::Config;
use crate::counter::Role;
use crate::export::health::{bind_address, HealthMetrics};
use crate::store::batch::BatchCounterStore;
use crate::store::counter::CounterStore;
use crate::store::gauge::{AggregatedGaugeStore, GaugeAccumulator};
use crate::store::path::PathTrackingStore;
use crate::store::schedule::ScheduledTask;
use crate::tracking::entry::PathTrackingEntry;
use crate::tracking::PathTracker;
use push::PushExporter;

/// Holds finished transactions until they are pushed or pulled.
#[derive(Default)]
pub struct PathBuffer {
    entries: parking_lot::Mutex<Vec<PathTrackingEntry>>,
}

impl PathBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every buffered entry.
    pub fn drain(&self) -> Vec<PathTrackingEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl PathTrackingStore for PathBuffer {
    fn store_path_entries(&self, entries: HashMap<String, Vec<PathTrackingEntry>>) -> Result<()> {
        let mut buffered = self.entries.lock();
        for (_, transaction) in entries {
            buffered.extend(transaction);
        }
        Ok(())
    }
}

/// Agent-side wiring: the counter store instrumented code writes to, the
/// gauge accumulator, the path tracker, and either a push schedule towards
/// the collector or a pull endpoint the collector polls.
pub struct Agent {
    cfg: Config,
    counters: Arc<CounterStore>,
    gauge_samples: Arc<GaugeAccumulator>,
    paths: Arc<PathBuffer>,
    tracker: PathTracker,
    health: Option<Arc<HealthMetrics>>,
    exporter: Option<Arc<PushExporter>>,
    batch: Option<BatchCounterStore<PushExporter>>,
    gauges: Option<AggregatedGaugeStore<PushExporter>>,
    path_task: parking_lot::Mutex<Option<ScheduledTask>>,
    pull_shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl Agent {
    pub fn new(cfg: Config) -> Result<Self> {
        Self::build(cfg, None)
    }

    /// Like [`Agent::new`], counting flushes and push failures in `health`.
    pub fn with_health(cfg: Config, health: Arc<HealthMetrics>) -> Result<Self> {
        Self::build(cfg, Some(health))
    }

    fn build(cfg: Config, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let counters = Arc::new(CounterStore::bounded(
            cfg.store.counter.max_size,
            cfg.store.counter.eviction_ratio,
        ));
        let gauge_samples = Arc::new(GaugeAccumulator::new());
        let paths = Arc::new(PathBuffer::new());
        let tracker = PathTracker::new(
            cfg.node_id.as_str(),
            Arc::clone(&paths) as Arc<dyn PathTrackingStore>,
        );

        let (exporter, batch, gauges) = if cfg.push.enabled {
            let exporter = Arc::new(
                PushExporter::new(cfg.push.clone(), health.clone())
                    .context("creating push exporter")?,
            );
            let mut batch = BatchCounterStore::new(
                Arc::clone(&counters),
                Arc::clone(&exporter),
                cfg.node_id.as_str(),
                cfg.store.batch.period,
                cfg.store.batch.clear_on_collect,
            );
            let mut gauges = AggregatedGaugeStore::with_accumulator(
                Arc::clone(&gauge_samples),
                Arc::clone(&exporter),
                cfg.node_id.as_str(),
                cfg.store.gauge.period,
            );
            if let Some(health) = &health {
                batch = batch.with_health(Arc::clone(health));
                gauges = gauges.with_health(Arc::clone(health));
            }
            (Some(exporter), Some(batch), Some(gauges))
        } else {
            (None, None, None)
        };

        Ok(Self {
            cfg,
            counters,
            gauge_samples,
            paths,
            tracker,
            health,
            exporter,
            batch,
            gauges,
            path_task: parking_lot::Mutex::new(None),
            pull_shutdown: parking_lot::Mutex::new(None),
        })
    }

    /// Starts the push schedules. Without push this only logs.
    pub fn start(&self) -> Result<()> {
        let (Some(exporter), Some(batch), Some(gauges)) = (&self.exporter, &self.batch, &self.gauges)
        else {
            info!(node = %self.cfg.node_id, "agent started without push");
            return Ok(());
        };

        batch.start().context("starting batch counter store")?;
        gauges.start().context("starting gauge store")?;

        let paths = Arc::clone(&self.paths);
        let exporter = Arc::clone(exporter);
        let health = self.health.clone();
        *self.path_task.lock() = Some(ScheduledTask::spawn(
            "path-push",
            self.cfg.store.batch.period,
            move || {
                let paths = Arc::clone(&paths);
                let exporter = Arc::clone(&exporter);
                let health = health.clone();
                async move {
                    let entries = paths.drain();
                    if let Some(health) = &health {
                        health.store_flushes.with_label_values(&["path"]).inc();
                    }
                    exporter.send_path_entries(&entries).await
                }
            },
        ));

        info!(
            node = %self.cfg.node_id,
            address = %self.cfg.push.address,
            "agent started",
        );

        Ok(())
    }

    /// Stops the schedules, then pushes what is left once.
    pub async fn stop(&self) {
        if let Some(cancel) = self.pull_shutdown.lock().take() {
            cancel.cancel();
        }

        let path_task = self.path_task.lock().take();
        if let Some(task) = path_task {
            task.stop().await;
        }
        if let Some(gauges) = &self.gauges {
            gauges.stop().await;
        }
        if let Some(batch) = &self.batch {
            batch.stop().await;
            if let Err(e) = batch.flush().await {
                warn!(error = %e, "final counter push failed");
            }
        }
        if let Some(exporter) = &self.exporter {
            if let Err(e) = exporter.send_path_entries(&self.paths.drain()).await {
                warn!(error = %e, "final path push failed");
            }
        }
    }

    /// Serves the current counters, the gauge windows and the buffered path
    /// entries as an event batch on `GET /`. Returns the bound address.
    pub async fn serve_pull(&self, addr: &str) -> Result<SocketAddr> {
        let bind_addr = bind_address(addr, ":8081");
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let state = Arc::new(PullState {
            marker: self.cfg.node_id.clone(),
            counters: Arc::clone(&self.counters),
            gauges: Arc::clone(&self.gauge_samples),
            paths: Arc::clone(&self.paths),
        });
        let app = Router::new()
            .route("/", get(pull_handler))
            .with_state(state);

        let cancel = CancellationToken::new();
        *self.pull_shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            info!(addr = %local_addr, "agent pull endpoint started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "agent pull endpoint error");
            }
        });

        Ok(local_addr)
    }

    /// Announces `agent_url` to the collector configured for push.
    pub async fn register(&self, agent_url: &str) -> Result<()> {
        match &self.exporter {
            Some(exporter) => exporter.register(agent_url).await,
            None => anyhow::bail!("registration needs push.address"),
        }
    }

    pub fn counters(&self) -> &Arc<CounterStore> {
        &self.counters
    }

    pub fn tracker(&self) -> &PathTracker {
        &self.tracker
    }

    pub fn paths(&self) -> &Arc<PathBuffer> {
        &self.paths
    }

    /// Records one gauge sample. It leaves with the next gauge push or pull.
    pub fn record_gauge(&self, role: &Role, value: f64) {
        self.gauge_samples.add_to_gauge(role, value);
    }

    pub fn gauges(&self) -> &Arc<GaugeAccumulator> {
        &self.gauge_samples
    }
}

struct PullState {
    marker: String,
    counters: Arc<CounterStore>,
    gauges: Arc<GaugeAccumulator>,
    paths: Arc<PathBuffer>,
}

/// GET / - current counters, gauge windows flushed by this pull, and path
/// entries finished since the last pull.
async fn pull_handler(State(state): State<Arc<PullState>>) -> Json<Vec<WireEvent>> {
    let mut events: Vec<WireEvent> = state
        .counters
        .snapshot()
        .iter()
        .map(|c| counter_event(c, &state.marker))
        .collect();
    events.extend(
        state
            .gauges
            .flush()
            .iter()
            .map(|g| gauge_event(g, &state.marker)),
    );
    events.extend(state.paths.drain().iter().map(path_tracking_event));
    Json(events)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::collector::pull::PullScheduler;
    use crate::collector::server::CollectorServer;
    use crate::collector::Ingestor;
    use crate::counter::{Key, Unit};

    fn agent_config() -> Config {
        let mut cfg: Config = serde_yaml::from_str("node_id: agent-1").expect("config");
        cfg.push.enabled = false;
        cfg
    }

    #[test]
    fn test_path_buffer_collects_transactions() {
        let buffer = Arc::new(PathBuffer::new());
        let tracker = PathTracker::new("n", Arc::clone(&buffer) as Arc<dyn PathTrackingStore>);

        let root = tracker.start("Shop", "order");
        let child = tracker.start("Stock", "reserve");
        tracker.stop(child);
        tracker.stop(root);

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.drain().len(), 2);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_collector_pulls_agent_endpoint() {
        let agent = Agent::new(agent_config()).expect("agent");
        agent.start().expect("start");

        let key = Key::new(Role::web(), "/search");
        agent.counters().record_timing(&key, 2_000).expect("timing");
        agent.counters().record_timing(&key, 4_000).expect("timing");
        let root = agent.tracker().start("Search", "query");
        agent.tracker().stop(root);
        let heap = Role::new("heap", Unit::MBYTE);
        agent.record_gauge(&heap, 40.0);
        agent.record_gauge(&heap, 44.0);

        let addr = agent.serve_pull("127.0.0.1:0").await.expect("serve");

        let ingestor = Arc::new(Ingestor::in_memory());
        ingestor.registry().register(&format!("http://{addr}/"));
        let scheduler = PullScheduler::new(
            Arc::clone(&ingestor),
            Duration::from_secs(60),
            Duration::from_secs(2),
        )
        .expect("scheduler");

        let report = scheduler.sweep_now().await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.events, 3);

        let aggregate = ingestor.counters().aggregate(&key).expect("pulled");
        assert_eq!(aggregate.hits(), 2);
        assert_eq!(aggregate.mean(), 3_000.0);
        assert_eq!(aggregate.markers(), vec!["agent-1".to_string()]);
        assert_eq!(ingestor.paths().len(), 1);
        assert!(agent.paths().is_empty());

        let heap_values = ingestor
            .gauges()
            .gauge_values_for_marker(&heap, 0..=u64::MAX, "agent-1");
        assert_eq!(heap_values.values().copied().collect::<Vec<_>>(), vec![42.0]);
        assert!(agent.gauges().is_empty());

        // Gauge windows leave with the pull that flushed them.
        let again = scheduler.sweep_now().await;
        assert_eq!(again.events, 1);

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_registers_and_pushes_on_stop() {
        let ingestor = Arc::new(Ingestor::in_memory());
        let server = CollectorServer::new("127.0.0.1:0", Arc::clone(&ingestor));
        let collector_addr = server.start().await.expect("collector");

        let mut cfg = agent_config();
        cfg.push.enabled = true;
        cfg.push.address = format!("http://{collector_addr}/");
        cfg.push.compression = "zlib".to_string();
        let agent = Agent::new(cfg).expect("agent");
        agent.start().expect("start");

        agent.register("http://agent-1:8081/").await.expect("register");
        assert!(ingestor.registry().node("http://agent-1:8081/").is_some());

        let key = Key::new(Role::jdbc(), "select");
        agent.counters().record_timing(&key, 500).expect("timing");
        let root = agent.tracker().start("Dao", "find");
        agent.tracker().stop(root);

        agent.stop().await;

        let aggregate = ingestor.counters().aggregate(&key).expect("pushed");
        assert_eq!(aggregate.hits(), 1);
        assert_eq!(ingestor.paths().len(), 1);

        server.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_flushes_are_counted() {
        // Nothing is recorded, so no flush reaches the network.
        let mut cfg = agent_config();
        cfg.push.enabled = true;
        cfg.push.address = "http://127.0.0.1:9/".to_string();
        cfg.store.batch.period = Duration::from_secs(10);
        cfg.store.gauge.period = Duration::from_secs(10);
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let agent = Agent::with_health(cfg, Arc::clone(&health)).expect("agent");
        agent.start().expect("start");

        tokio::time::sleep(Duration::from_secs(15)).await;
        agent.stop().await;

        // One tick each, plus the final counter flush on stop.
        let flushes = |store: &str| health.store_flushes.with_label_values(&[store]).get();
        assert_eq!(flushes("batch"), 2.0);
        assert_eq!(flushes("gauge"), 1.0);
        assert_eq!(flushes("path"), 1.0);
        assert_eq!(health.export_errors.with_label_values(&["push"]).get(), 0.0);
    }

    #[tokio::test]
    async fn test_register_without_push_fails() {
        let agent = Agent::new(agent_config()).expect("agent");
        assert!(agent.register("http://a/").await.is_err());
    }
}
