use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "meterline";

/// Prometheus metrics describing the collector's own health.
///
/// All metrics use the "meterline" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Inbound batches applied.
    pub batches_accepted: Counter,
    /// Inbound batches rejected by the decoder.
    pub batches_rejected: Counter,
    /// Applied events by event type.
    pub events_by_type: CounterVec,
    /// Path-tracking entries accepted by the write pipeline.
    pub pipeline_published: Counter,
    /// Path-tracking entries lost to a failed publish or shutdown timeout.
    pub pipeline_dropped: Counter,
    /// Agent nodes in the current pull set.
    pub live_nodes: Gauge,
    /// Agent nodes removed after too many missed pulls.
    pub dead_nodes: Counter,
    /// Pull requests that failed.
    pub pull_failures: Counter,
    /// Duration of a full pull sweep.
    pub pull_sweep_duration: Histogram,
    /// Scheduled store flushes by store.
    pub store_flushes: CounterVec,
    /// Export failures by sink.
    pub export_errors: CounterVec,
    /// Combined counters held by the aggregator.
    pub counters_tracked: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let batches_accepted = Counter::with_opts(
            Opts::new("batches_accepted_total", "Total inbound event batches applied.")
                .namespace(NAMESPACE),
        )?;
        let batches_rejected = Counter::with_opts(
            Opts::new(
                "batches_rejected_total",
                "Total inbound event batches rejected as malformed.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_by_type = CounterVec::new(
            Opts::new("events_by_type_total", "Total applied events by event type.")
                .namespace(NAMESPACE),
            &["event_type"],
        )?;
        let pipeline_published = Counter::with_opts(
            Opts::new(
                "pipeline_published_total",
                "Total path-tracking entries published to the write pipeline.",
            )
            .namespace(NAMESPACE),
        )?;
        let pipeline_dropped = Counter::with_opts(
            Opts::new(
                "pipeline_dropped_total",
                "Total path-tracking entries dropped by the write pipeline.",
            )
            .namespace(NAMESPACE),
        )?;
        let live_nodes = Gauge::with_opts(
            Opts::new("live_nodes", "Number of agent nodes in the pull set.").namespace(NAMESPACE),
        )?;
        let dead_nodes = Counter::with_opts(
            Opts::new(
                "dead_nodes_total",
                "Total agent nodes dropped after consecutive pull failures.",
            )
            .namespace(NAMESPACE),
        )?;
        let pull_failures = Counter::with_opts(
            Opts::new("pull_failures_total", "Total failed agent pulls.").namespace(NAMESPACE),
        )?;
        let pull_sweep_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pull_sweep_duration_seconds",
                "Time to pull every live agent node once.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        let store_flushes = CounterVec::new(
            Opts::new("store_flushes_total", "Total scheduled store flushes by store.")
                .namespace(NAMESPACE),
            &["store"],
        )?;
        let export_errors = CounterVec::new(
            Opts::new("export_errors_total", "Total export errors by sink.").namespace(NAMESPACE),
            &["sink"],
        )?;
        let counters_tracked = Gauge::with_opts(
            Opts::new(
                "counters_tracked",
                "Number of combined counters held by the aggregator.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(batches_accepted.clone()))?;
        registry.register(Box::new(batches_rejected.clone()))?;
        registry.register(Box::new(events_by_type.clone()))?;
        registry.register(Box::new(pipeline_published.clone()))?;
        registry.register(Box::new(pipeline_dropped.clone()))?;
        registry.register(Box::new(live_nodes.clone()))?;
        registry.register(Box::new(dead_nodes.clone()))?;
        registry.register(Box::new(pull_failures.clone()))?;
        registry.register(Box::new(pull_sweep_duration.clone()))?;
        registry.register(Box::new(store_flushes.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(counters_tracked.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            batches_accepted,
            batches_rejected,
            events_by_type,
            pipeline_published,
            pipeline_dropped,
            live_nodes,
            dead_nodes,
            pull_failures,
            pull_sweep_duration,
            store_flushes,
            export_errors,
            counters_tracked,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":9090");

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to an all-interfaces bind address.
pub(crate) fn bind_address(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
