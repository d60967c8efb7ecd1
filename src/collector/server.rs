use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::event::BINARY_CONTENT_TYPE;
use super::Ingestor;
use crate::counter::CounterSnapshot;
use crate::export::compress::decompress;
use crate::export::health::bind_address;
use crate::store::status::NodeStatus;

/// HTTP endpoint receiving pushed event batches and serving the collected
/// state.
///
/// - `POST /`: JSON event array, or the binary path-tracking payload when
///   sent as `application/octet-stream`, optionally compressed as named by
///   Content-Encoding. Answers `{}` or `400 {"error": ...}`.
/// - `GET /counters`: combined counters with their contributing markers.
/// - `GET /pathtracking?start=&end=`: transactions started in a range (ms).
/// - `GET /pathtracking/{id}`: entries of one transaction.
/// - `GET /status`: last status per node.
pub struct CollectorServer {
    addr: String,
    ingestor: Arc<Ingestor>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl CollectorServer {
    pub fn new(addr: &str, ingestor: Arc<Ingestor>) -> Self {
        Self {
            addr: addr.to_string(),
            ingestor,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    pub fn router(ingestor: Arc<Ingestor>) -> Router {
        Router::new()
            .route("/", get(root_handler).post(push_handler))
            .route("/counters", get(counters_handler))
            .route("/pathtracking", get(tracking_ids_handler))
            .route("/pathtracking/:id", get(path_handler))
            .route("/status", get(status_handler))
            .with_state(ingestor)
    }

    /// Binds the listener and serves in the background. Returns the bound
    /// address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":8080");
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let app = Self::router(Arc::clone(&self.ingestor));
        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "collector server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "collector server error");
            }
        });

        Ok(local_addr)
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// GET / - liveness of the push endpoint.
async fn root_handler() -> &'static str {
    "ok"
}

/// POST / - ingest one pushed batch.
async fn push_handler(
    State(ingestor): State<Arc<Ingestor>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let binary = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(BINARY_CONTENT_TYPE));
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());

    let body = match decompress(&body, encoding) {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("{e:#}") })),
            )
                .into_response();
        }
    };

    let result = if binary {
        ingestor.ingest_binary(&body).await
    } else {
        ingestor.ingest_json(&body).await
    };

    match result {
        Ok(_) => (StatusCode::OK, Json(json!({}))).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
struct CounterReport {
    #[serde(flatten)]
    counter: CounterSnapshot,
    markers: Vec<String>,
}

/// GET /counters
async fn counters_handler(State(ingestor): State<Arc<Ingestor>>) -> Json<Vec<CounterReport>> {
    let mut reports: Vec<CounterReport> = ingestor
        .counters()
        .aggregates()
        .into_iter()
        .map(|aggregate| CounterReport {
            counter: aggregate.snapshot(),
            markers: aggregate.markers(),
        })
        .collect();
    reports.sort_by(|a, b| {
        (a.counter.role.as_str(), a.counter.name.as_str())
            .cmp(&(b.counter.role.as_str(), b.counter.name.as_str()))
    });
    Json(reports)
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    #[serde(default)]
    start: u64,
    end: Option<u64>,
}

/// GET /pathtracking?start=&end=
async fn tracking_ids_handler(
    State(ingestor): State<Arc<Ingestor>>,
    Query(range): Query<RangeQuery>,
) -> impl IntoResponse {
    let end = range.end.unwrap_or(u64::MAX);
    Json(ingestor.paths().retrieve_tracking_ids(range.start..=end))
}

/// GET /pathtracking/{id}
async fn path_handler(
    State(ingestor): State<Arc<Ingestor>>,
    Path(id): Path<String>,
) -> Response {
    let entries = ingestor.paths().retrieve(&id);
    if entries.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown tracking id {id}") })),
        )
            .into_response();
    }
    Json(entries).into_response()
}

/// GET /status
async fn status_handler(
    State(ingestor): State<Arc<Ingestor>>,
) -> Json<BTreeMap<String, NodeStatus>> {
    Json(ingestor.statuses().statuses())
}
