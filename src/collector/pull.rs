use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;

use super::registry::AgentNode;
use super::Ingestor;
use crate::store::schedule::ScheduledTask;

/// Outcome of one pull sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub polled: usize,
    pub failed: usize,
    pub events: usize,
}

/// Periodically pulls the event batch of every live agent node.
///
/// Within a sweep every node is fetched by its own task with its own
/// timeout, so a slow node delays nobody else. Failures only count against
/// the node; the sweep itself never fails.
pub struct PullScheduler {
    ingestor: Arc<Ingestor>,
    client: reqwest::Client,
    period: Duration,
    task: parking_lot::Mutex<Option<ScheduledTask>>,
}

impl PullScheduler {
    pub fn new(ingestor: Arc<Ingestor>, period: Duration, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            ingestor,
            client,
            period,
            task: parking_lot::Mutex::new(None),
        })
    }

    pub fn start(&self) -> Result<()> {
        if self.period.is_zero() {
            bail!("pull period must be positive");
        }

        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }

        let ingestor = Arc::clone(&self.ingestor);
        let client = self.client.clone();
        *task = Some(ScheduledTask::spawn("pull-scheduler", self.period, move || {
            let ingestor = Arc::clone(&ingestor);
            let client = client.clone();
            async move {
                sweep(&ingestor, &client).await;
                Ok(())
            }
        }));

        Ok(())
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// Runs one sweep immediately.
    pub async fn sweep_now(&self) -> SweepReport {
        sweep(&self.ingestor, &self.client).await
    }
}

async fn sweep(ingestor: &Arc<Ingestor>, client: &reqwest::Client) -> SweepReport {
    let start = Instant::now();
    let before = ingestor.registry().len();
    let nodes = ingestor.registry().live_nodes();

    if let Some(health) = ingestor.health() {
        health.live_nodes.set(nodes.len() as f64);
        health
            .dead_nodes
            .inc_by(before.saturating_sub(nodes.len()) as f64);
    }

    let mut report = SweepReport {
        polled: nodes.len(),
        ..Default::default()
    };

    let mut in_flight = JoinSet::new();
    for node in nodes {
        let ingestor = Arc::clone(ingestor);
        let client = client.clone();
        in_flight.spawn(async move {
            let result = pull_node(&client, &ingestor, &node).await;
            match &result {
                Ok(_) => node.ok(),
                Err(e) => {
                    node.ko();
                    tracing::warn!(node = node.url(), misses = node.misses(), error = %e, "pull failed");
                    if let Some(health) = ingestor.health() {
                        health.pull_failures.inc();
                    }
                }
            }
            result
        });
    }

    while let Some(joined) = in_flight.join_next().await {
        match joined {
            Ok(Ok(events)) => report.events += events,
            Ok(Err(_)) => report.failed += 1,
            Err(e) => {
                report.failed += 1;
                tracing::error!(error = %e, "pull task panicked");
            }
        }
    }

    if let Some(health) = ingestor.health() {
        health
            .pull_sweep_duration
            .observe(start.elapsed().as_secs_f64());
    }

    tracing::debug!(
        polled = report.polled,
        failed = report.failed,
        events = report.events,
        "pull sweep finished",
    );

    report
}

async fn pull_node(client: &reqwest::Client, ingestor: &Ingestor, node: &AgentNode) -> Result<usize> {
    let response = client
        .get(node.url())
        .header("Accept", "application/json")
        .send()
        .await
        .with_context(|| format!("requesting {}", node.url()))?;

    let status = response.status();
    if !status.is_success() {
        bail!("unexpected status {status} from {}", node.url());
    }

    let body = response
        .bytes()
        .await
        .with_context(|| format!("reading response from {}", node.url()))?;

    let applied = ingestor
        .ingest_json(&body)
        .await
        .with_context(|| format!("decoding events from {}", node.url()))?;

    Ok(applied)
}
