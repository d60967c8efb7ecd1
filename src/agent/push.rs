use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::collector::event::{
    counter_event, encode_binary_path_entries, gauge_event, registration_event, WireEvent,
    BINARY_CONTENT_TYPE,
};
use crate::config::PushConfig;
use crate::export::compress::{compress, content_encoding};
use crate::export::health::HealthMetrics;
use crate::store::batch::{CounterBatch, CounterSink};
use crate::store::gauge::{GaugeBatch, GaugeSink};
use crate::tracking::entry::PathTrackingEntry;

/// HTTP push exporter.
///
/// Turns counter and gauge batches into a JSON array of wire events,
/// optionally compresses it, and POSTs it to the collector. Path-tracking
/// entries go out in the binary format. A failed request is counted and
/// returned to the caller; the scheduled stores log it and keep going.
pub struct PushExporter {
    cfg: PushConfig,
    client: reqwest::Client,
    health: Option<Arc<HealthMetrics>>,
}

impl PushExporter {
    pub fn new(cfg: PushConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        if cfg.address.is_empty() {
            bail!("push address must not be empty");
        }

        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        tracing::info!(
            address = %cfg.address,
            compression = %cfg.compression,
            "push exporter created",
        );

        Ok(Self {
            cfg,
            client,
            health,
        })
    }

    /// Returns the exporter name for logging and metric labels.
    pub fn name(&self) -> &str {
        "push"
    }

    /// Announces `agent_url` to the collector so it gets pulled.
    pub async fn register(&self, agent_url: &str) -> Result<()> {
        self.send_events(&[registration_event(agent_url)]).await
    }

    /// Sends one JSON event batch.
    pub async fn send_events(&self, events: &[WireEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let body = serde_json::to_vec(events).context("serializing events to JSON")?;
        let result = self.post(body, "application/json").await;
        self.record(&result, events.len());
        result
    }

    /// Sends path-tracking entries in the binary format.
    pub async fn send_path_entries(&self, entries: &[PathTrackingEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let body = encode_binary_path_entries(entries).context("encoding path entries")?;
        let result = self.post(body, BINARY_CONTENT_TYPE).await;
        self.record(&result, entries.len());
        result
    }

    async fn post(&self, body: Vec<u8>, content_type: &str) -> Result<()> {
        let raw_len = body.len();
        let compressed =
            compress(&body, &self.cfg.compression).context("compressing push body")?;

        let mut request = self
            .client
            .post(&self.cfg.address)
            .header("Content-Type", content_type)
            .body(compressed);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.send().await.context("sending push request")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("push unexpected status: {status}");
        }

        tracing::debug!(bytes = raw_len, "pushed batch");

        Ok(())
    }

    fn record(&self, result: &Result<()>, items: usize) {
        if let Err(e) = result {
            tracing::warn!(error = %e, items, "push export failed");
            if let Some(health) = &self.health {
                health.export_errors.with_label_values(&[self.name()]).inc();
            }
        }
    }
}

impl CounterSink for PushExporter {
    async fn push_counters(&self, batch: CounterBatch) -> Result<()> {
        let events: Vec<WireEvent> = batch
            .counters
            .iter()
            .map(|c| counter_event(c, &batch.marker))
            .collect();
        self.send_events(&events).await
    }
}

impl GaugeSink for PushExporter {
    async fn push_gauges(&self, batch: GaugeBatch) -> Result<()> {
        let events: Vec<WireEvent> = batch
            .gauges
            .iter()
            .map(|g| gauge_event(g, &batch.marker))
            .collect();
        self.send_events(&events).await
    }
}
