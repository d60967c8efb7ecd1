pub mod event;
pub mod pipeline;
pub mod pull;
pub mod registry;
pub mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::store::aggregator::DistributedAggregator;
use crate::store::gauge::GaugeSeriesStore;
use crate::store::path::{InMemoryPathTrackingStore, PathTrackingStore};
use crate::store::status::NodeStatusStore;
use event::{decode_binary_path_entries, CollectorEvent, DecodeError, EventDecoder};
use pipeline::{PipelineReport, WritePipeline};
use pull::PullScheduler;
use registry::NodeRegistry;
use server::CollectorServer;

/// Routes decoded events to the collector's stores.
///
/// Push requests and pull sweeps both end up here. A batch is decoded in
/// full before any event is applied, so a rejected batch leaves every store
/// untouched.
pub struct Ingestor {
    decoder: EventDecoder,
    counters: DistributedAggregator,
    gauges: GaugeSeriesStore,
    statuses: NodeStatusStore,
    paths: Arc<InMemoryPathTrackingStore>,
    pipeline: WritePipeline,
    registry: NodeRegistry,
    health: Option<Arc<HealthMetrics>>,
}

impl Ingestor {
    pub fn new(
        paths: Arc<InMemoryPathTrackingStore>,
        pipeline: WritePipeline,
        gauge_series_max_size: usize,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            decoder: EventDecoder::new(),
            counters: DistributedAggregator::new(),
            gauges: GaugeSeriesStore::new(gauge_series_max_size),
            statuses: NodeStatusStore::new(),
            paths,
            pipeline,
            registry: NodeRegistry::new(),
            health,
        }
    }

    /// Ingestor writing path entries straight into an in-memory store.
    pub fn in_memory() -> Self {
        let paths = Arc::new(InMemoryPathTrackingStore::new());
        let pipeline = WritePipeline::direct(Arc::clone(&paths) as Arc<dyn PathTrackingStore>);
        Self::new(paths, pipeline, 100, None)
    }

    /// Decodes and applies a JSON event batch. Returns the number of events
    /// applied.
    pub async fn ingest_json(&self, body: &[u8]) -> Result<usize, DecodeError> {
        let events = self.decoded(self.decoder.decode_batch(body))?;
        Ok(self.apply(events).await)
    }

    /// Decodes and applies a binary path-tracking payload.
    pub async fn ingest_binary(&self, body: &[u8]) -> Result<usize, DecodeError> {
        let entries = self.decoded(decode_binary_path_entries(body))?;
        let events = entries.into_iter().map(CollectorEvent::PathTracking).collect();
        Ok(self.apply(events).await)
    }

    fn decoded<T>(&self, result: Result<T, DecodeError>) -> Result<T, DecodeError> {
        match result {
            Ok(value) => {
                if let Some(health) = &self.health {
                    health.batches_accepted.inc();
                }
                Ok(value)
            }
            Err(e) => {
                warn!(error = %e, "rejecting event batch");
                if let Some(health) = &self.health {
                    health.batches_rejected.inc();
                }
                Err(e)
            }
        }
    }

    /// Sends each event to its store. Returns the number of events applied.
    pub async fn apply(&self, events: Vec<CollectorEvent>) -> usize {
        let mut applied = 0;

        for event in events {
            let kind = event.kind();
            match event {
                CollectorEvent::Counter {
                    key,
                    marker,
                    stats,
                    concurrency,
                } => self.counters.update(&key, &marker, stats, concurrency),
                CollectorEvent::Gauge {
                    role,
                    marker,
                    time,
                    value,
                } => self.gauges.add_to_gauge(&role, time, value, &marker),
                CollectorEvent::Status { marker, status } => self.statuses.store(&marker, status),
                CollectorEvent::PathTracking(entry) => {
                    if let Err(e) = self.pipeline.publish(entry).await {
                        warn!(error = %e, "dropping path tracking entry");
                        if let Some(health) = &self.health {
                            health.pipeline_dropped.inc();
                        }
                        continue;
                    }
                    if let Some(health) = &self.health {
                        health.pipeline_published.inc();
                    }
                }
                CollectorEvent::Registration { url } => {
                    self.registry.register(&url);
                }
            }

            applied += 1;
            if let Some(health) = &self.health {
                health.events_by_type.with_label_values(&[kind]).inc();
            }
        }

        if let Some(health) = &self.health {
            health.counters_tracked.set(self.counters.len() as f64);
        }

        applied
    }

    pub fn counters(&self) -> &DistributedAggregator {
        &self.counters
    }

    pub fn gauges(&self) -> &GaugeSeriesStore {
        &self.gauges
    }

    pub fn statuses(&self) -> &NodeStatusStore {
        &self.statuses
    }

    pub fn paths(&self) -> &Arc<InMemoryPathTrackingStore> {
        &self.paths
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn decoder(&self) -> &EventDecoder {
        &self.decoder
    }

    pub fn health(&self) -> Option<&Arc<HealthMetrics>> {
        self.health.as_ref()
    }

    /// Drains the write pipeline and accounts for anything dropped.
    pub async fn shutdown(&self, timeout: std::time::Duration) -> PipelineReport {
        let report = self.pipeline.shutdown(timeout).await;
        if let Some(health) = &self.health {
            health.pipeline_dropped.inc_by(report.dropped as f64);
        }
        report
    }
}

/// Collector orchestrates the push server, pull scheduler, write pipeline
/// and health metrics.
pub struct Collector {
    cfg: Config,
    health: Arc<HealthMetrics>,
    ingestor: Arc<Ingestor>,
    server: CollectorServer,
    pull: PullScheduler,
}

impl Collector {
    /// Creates a collector from configuration. Starts the pipeline
    /// consumers, so it must run inside a tokio runtime.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let paths = Arc::new(InMemoryPathTrackingStore::new());
        let store = Arc::clone(&paths) as Arc<dyn PathTrackingStore>;
        let pipeline_cfg = &cfg.collector.pipeline;
        let pipeline = if pipeline_cfg.enabled {
            WritePipeline::partitioned(store, pipeline_cfg.ring_buffer_size, pipeline_cfg.consumers)
                .context("starting write pipeline")?
        } else {
            WritePipeline::direct(store)
        };

        let ingestor = Arc::new(Ingestor::new(
            paths,
            pipeline,
            cfg.collector.gauge_series_max_size,
            Some(Arc::clone(&health)),
        ));

        let server = CollectorServer::new(&cfg.collector.listen_addr, Arc::clone(&ingestor));
        let pull = PullScheduler::new(
            Arc::clone(&ingestor),
            cfg.collector.pull.period,
            cfg.collector.pull.timeout,
        )
        .context("creating pull scheduler")?;

        Ok(Self {
            cfg,
            health,
            ingestor,
            server,
            pull,
        })
    }

    /// Starts every component. Returns the bound push endpoint address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        for agent in &self.cfg.collector.pull.agents {
            self.ingestor.registry().register(agent);
        }

        let addr = self
            .server
            .start()
            .await
            .context("starting collector server")?;

        self.pull.start().context("starting pull scheduler")?;

        info!(
            addr = %addr,
            pipeline = self.cfg.collector.pipeline.enabled,
            consumers = self.cfg.collector.pipeline.consumers,
            "collector started",
        );

        Ok(addr)
    }

    /// Stops pulling and accepting pushes, then drains the pipeline.
    pub async fn stop(&mut self) -> Result<()> {
        self.pull.stop().await;
        self.server.stop().await;

        let report = self
            .ingestor
            .shutdown(self.cfg.collector.pipeline.shutdown_timeout)
            .await;
        info!(
            published = report.published,
            processed = report.processed,
            dropped = report.dropped,
            "write pipeline stopped",
        );

        if let Err(e) = self.health.stop().await {
            error!(error = %e, "error stopping health metrics server");
        }

        Ok(())
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }
}
