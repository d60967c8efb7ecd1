use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::store::path::{group_by_tracking_id, PathTrackingStore};
use crate::tracking::entry::PathTrackingEntry;

/// Maximum entries a consumer hands to the store in one call.
const CONSUMER_BATCH: usize = 256;

/// Counts reported when a pipeline shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineReport {
    pub published: u64,
    pub processed: u64,
    pub dropped: u64,
}

/// Write stage between path-tracking ingestion and the store.
pub enum WritePipeline {
    /// Every entry is written by the publishing caller.
    Direct(DirectWriter),
    /// Entries are spread over `C` consumer tasks by sequence number.
    Partitioned(PartitionedPipeline),
}

impl WritePipeline {
    pub fn direct(store: Arc<dyn PathTrackingStore>) -> Self {
        WritePipeline::Direct(DirectWriter::new(store))
    }

    /// Starts `consumers` consumer tasks sharing `capacity` slots. Must be
    /// called inside a tokio runtime.
    pub fn partitioned(
        store: Arc<dyn PathTrackingStore>,
        capacity: usize,
        consumers: usize,
    ) -> Result<Self> {
        Ok(WritePipeline::Partitioned(PartitionedPipeline::start(
            store, capacity, consumers,
        )?))
    }

    pub async fn publish(&self, entry: PathTrackingEntry) -> Result<()> {
        match self {
            WritePipeline::Direct(w) => w.write(vec![entry]),
            WritePipeline::Partitioned(p) => p.publish(entry).await,
        }
    }

    /// Publishes from a thread that cannot await; spins while the target
    /// partition is full.
    pub fn publish_blocking(&self, entry: PathTrackingEntry) -> Result<()> {
        match self {
            WritePipeline::Direct(w) => w.write(vec![entry]),
            WritePipeline::Partitioned(p) => p.publish_blocking(entry),
        }
    }

    pub fn published(&self) -> u64 {
        match self {
            WritePipeline::Direct(w) => w.written.load(Ordering::Relaxed),
            WritePipeline::Partitioned(p) => p.published.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting entries and drains what is queued, for at most
    /// `timeout`. Entries still queued after that are dropped.
    pub async fn shutdown(&self, timeout: Duration) -> PipelineReport {
        match self {
            WritePipeline::Direct(w) => {
                let written = w.written.load(Ordering::Relaxed);
                PipelineReport {
                    published: written,
                    processed: written,
                    dropped: 0,
                }
            }
            WritePipeline::Partitioned(p) => p.shutdown(timeout).await,
        }
    }
}

/// Lets a [`PathTracker`](crate::tracking::PathTracker) flush straight
/// into the pipeline.
impl PathTrackingStore for WritePipeline {
    fn store_path_entries(&self, entries: HashMap<String, Vec<PathTrackingEntry>>) -> Result<()> {
        match self {
            WritePipeline::Direct(w) => {
                let count: usize = entries.values().map(Vec::len).sum();
                w.store.store_path_entries(entries)?;
                w.written.fetch_add(count as u64, Ordering::Relaxed);
                Ok(())
            }
            WritePipeline::Partitioned(p) => {
                for entry in entries.into_values().flatten() {
                    p.publish_blocking(entry)?;
                }
                Ok(())
            }
        }
    }
}

pub struct DirectWriter {
    store: Arc<dyn PathTrackingStore>,
    written: AtomicU64,
}

impl DirectWriter {
    fn new(store: Arc<dyn PathTrackingStore>) -> Self {
        Self {
            store,
            written: AtomicU64::new(0),
        }
    }

    fn write(&self, entries: Vec<PathTrackingEntry>) -> Result<()> {
        let count = entries.len() as u64;
        self.store.store(entries)?;
        self.written.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }
}

/// Fixed-capacity write stage with `C` consumers owning disjoint partitions.
///
/// Entry `n` (global publish sequence) goes to partition `n % C`, so each
/// entry is handled by exactly one consumer and each consumer sees its
/// partition in publish order.
pub struct PartitionedPipeline {
    partitions: parking_lot::RwLock<Option<Vec<mpsc::Sender<PathTrackingEntry>>>>,
    consumers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    sequence: AtomicU64,
    published: AtomicU64,
    processed: Arc<AtomicU64>,
}

impl PartitionedPipeline {
    fn start(store: Arc<dyn PathTrackingStore>, capacity: usize, consumers: usize) -> Result<Self> {
        if consumers == 0 {
            bail!("pipeline needs at least one consumer");
        }
        if capacity < consumers {
            bail!("pipeline capacity {capacity} is smaller than consumer count {consumers}");
        }

        let per_partition = capacity / consumers;
        let processed = Arc::new(AtomicU64::new(0));
        let mut partitions = Vec::with_capacity(consumers);
        let mut handles = Vec::with_capacity(consumers);

        for ordinal in 0..consumers {
            let (tx, rx) = mpsc::channel(per_partition);
            partitions.push(tx);
            handles.push(tokio::spawn(consume(
                ordinal,
                rx,
                Arc::clone(&store),
                Arc::clone(&processed),
            )));
        }

        tracing::info!(consumers, capacity, "path tracking pipeline started");

        Ok(Self {
            partitions: parking_lot::RwLock::new(Some(partitions)),
            consumers: parking_lot::Mutex::new(handles),
            sequence: AtomicU64::new(0),
            published: AtomicU64::new(0),
            processed,
        })
    }

    fn route(&self) -> Option<mpsc::Sender<PathTrackingEntry>> {
        let partitions = self.partitions.read();
        let partitions = partitions.as_ref()?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let index = (seq % partitions.len() as u64) as usize;
        partitions.get(index).cloned()
    }

    async fn publish(&self, entry: PathTrackingEntry) -> Result<()> {
        let Some(tx) = self.route() else {
            bail!("pipeline is shut down");
        };
        if tx.send(entry).await.is_err() {
            bail!("pipeline consumer has exited");
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn publish_blocking(&self, entry: PathTrackingEntry) -> Result<()> {
        let Some(tx) = self.route() else {
            bail!("pipeline is shut down");
        };

        let mut entry = entry;
        let mut spins = 0u32;
        loop {
            match tx.try_send(entry) {
                Ok(()) => {
                    self.published.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(TrySendError::Full(back)) => {
                    entry = back;
                    spins += 1;
                    if spins < 64 {
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
                Err(TrySendError::Closed(_)) => bail!("pipeline consumer has exited"),
            }
        }
    }

    async fn shutdown(&self, timeout: Duration) -> PipelineReport {
        // Closing the senders lets consumers drain and exit.
        drop(self.partitions.write().take());
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.consumers.lock());

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drained = tokio::time::timeout(timeout, async {
            for handle in handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        tracing::error!(error = %e, "pipeline consumer failed");
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            for abort in &aborts {
                abort.abort();
            }
        }

        let published = self.published.load(Ordering::Relaxed);
        let processed = self.processed.load(Ordering::Relaxed);
        let dropped = published.saturating_sub(processed);

        if dropped > 0 {
            tracing::warn!(dropped, timeout = ?timeout, "pipeline shutdown timed out, dropping entries");
        } else {
            tracing::info!(processed, "path tracking pipeline drained");
        }

        PipelineReport {
            published,
            processed,
            dropped,
        }
    }
}

async fn consume(
    ordinal: usize,
    mut rx: mpsc::Receiver<PathTrackingEntry>,
    store: Arc<dyn PathTrackingStore>,
    processed: Arc<AtomicU64>,
) {
    let mut batch = Vec::with_capacity(CONSUMER_BATCH);

    while let Some(entry) = rx.recv().await {
        batch.push(entry);
        while batch.len() < CONSUMER_BATCH {
            match rx.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }

        let count = batch.len() as u64;
        let entries = std::mem::replace(&mut batch, Vec::with_capacity(CONSUMER_BATCH));
        if let Err(e) = store.store_path_entries(group_by_tracking_id(entries)) {
            tracing::error!(consumer = ordinal, error = %e, entries = count, "storing path entries failed");
        }
        processed.fetch_add(count, Ordering::Relaxed);
    }

    tracing::debug!(consumer = ordinal, "pipeline consumer stopped");
}
