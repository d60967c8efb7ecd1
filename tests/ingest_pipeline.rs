use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meterline::collector::event::{
    counter_event, encode_binary_path_entries, path_tracking_event, registration_event, WireEvent,
};
use meterline::collector::pipeline::WritePipeline;
use meterline::collector::Ingestor;
use meterline::counter::{Counter, Key, Role, StatAccumulator, Unit};
use meterline::export::health::HealthMetrics;
use meterline::store::path::{InMemoryPathTrackingStore, PathTrackingStore};
use meterline::tracking::entry::PathTrackingEntry;
use meterline::tracking::PathTracker;

fn partitioned_ingestor(consumers: usize) -> (Ingestor, Arc<HealthMetrics>) {
    let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
    let paths = Arc::new(InMemoryPathTrackingStore::new());
    let pipeline = WritePipeline::partitioned(
        Arc::clone(&paths) as Arc<dyn PathTrackingStore>,
        1024,
        consumers,
    )
    .expect("pipeline");
    let ingestor = Ingestor::new(paths, pipeline, 50, Some(Arc::clone(&health)));
    (ingestor, health)
}

fn reported_counter(key: &Key, stats: StatAccumulator, concurrency: i32) -> Counter {
    let counter = Counter::new(key.clone());
    counter.replace(stats, concurrency);
    counter
}

fn body(events: &[WireEvent]) -> Vec<u8> {
    serde_json::to_vec(events).expect("encode batch")
}

fn assert_near(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-3,
        "actual={actual} expected={expected}",
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_agents_merge_into_reference_counter() {
    let (ingestor, health) = partitioned_ingestor(4);
    let key = Key::new(Role::new("cpu", Unit::UNARY), "node-load");

    let a = reported_counter(
        &key,
        StatAccumulator::from_parts(5, 6.0, 10.0, 0.0, 1.0, 7.0),
        4,
    );
    let b = reported_counter(
        &key,
        StatAccumulator::from_parts(8, 9.0, 15.0, 1.0, 2.0, 5.0),
        2,
    );

    ingestor
        .ingest_json(&body(&[counter_event(&a.snapshot(), "client1")]))
        .await
        .expect("client1 batch");
    ingestor
        .ingest_json(&body(&[counter_event(&b.snapshot(), "client2")]))
        .await
        .expect("client2 batch");

    let merged = ingestor.counters().aggregate(&key).expect("merged counter");
    assert_eq!(merged.hits(), 13);
    assert_eq!(merged.min(), 10.0);
    assert_eq!(merged.max(), 1.0);
    assert_eq!(merged.sum(), 15.0);
    assert_near(merged.variance(), 1.2564);
    assert_near(merged.stddev(), 1.1209);
    assert_eq!(merged.current_concurrency(), 6);

    assert_eq!(health.batches_accepted.get(), 2.0);
    assert_eq!(
        health.events_by_type.with_label_values(&["counter"]).get(),
        2.0
    );

    let report = ingestor.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.dropped, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tracked_transactions_flow_through_partitions() {
    let (ingestor, health) = partitioned_ingestor(4);

    // Build real transactions with the tracker, captured in a local store.
    let local = Arc::new(InMemoryPathTrackingStore::new());
    let tracker = PathTracker::new("agent-1", Arc::clone(&local) as Arc<dyn PathTrackingStore>);
    for _ in 0..20 {
        let root = tracker.start("Checkout", "submit");
        let child = tracker.start("Payment", "charge");
        let grandchild = tracker.start("Gateway", "call");
        tracker.stop(grandchild);
        tracker.stop(child);
        tracker.stop(root);
    }

    let ids: Vec<String> = local
        .retrieve_tracking_ids(0..=u64::MAX)
        .into_iter()
        .map(|c| c.tracking_id)
        .collect();
    assert_eq!(ids.len(), 20);

    // Half travels as JSON events, half as the binary payload.
    let (json_ids, binary_ids) = ids.split_at(10);
    let json_events: Vec<WireEvent> = json_ids
        .iter()
        .flat_map(|id| local.retrieve(id))
        .map(|entry| path_tracking_event(&entry))
        .collect();
    let binary_entries: Vec<PathTrackingEntry> =
        binary_ids.iter().flat_map(|id| local.retrieve(id)).collect();

    assert_eq!(
        ingestor.ingest_json(&body(&json_events)).await.expect("json"),
        30
    );
    assert_eq!(
        ingestor
            .ingest_binary(&encode_binary_path_entries(&binary_entries).expect("encode"))
            .await
            .expect("binary"),
        30
    );

    let report = ingestor.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.published, 60);
    assert_eq!(report.processed, 60);
    assert_eq!(report.dropped, 0);
    assert_eq!(health.pipeline_published.get(), 60.0);

    let stored: HashMap<String, Vec<PathTrackingEntry>> = ids
        .iter()
        .map(|id| (id.clone(), ingestor.paths().retrieve(id)))
        .collect();
    for (id, entries) in &stored {
        let mut levels: Vec<u32> = entries.iter().map(|e| e.level).collect();
        levels.sort_unstable();
        assert_eq!(levels, vec![1, 2, 3], "transaction {id}");
    }
}

#[tokio::test]
async fn rejected_batch_does_not_register_roles_or_nodes() {
    let ingestor = Ingestor::in_memory();

    let mut bad = registration_event("http://agent-9:8081/");
    bad.kind = "counter".to_string();
    let batch = vec![registration_event("http://agent-1:8081/"), bad];
    assert!(ingestor.ingest_json(&body(&batch)).await.is_err());

    assert!(ingestor.registry().is_empty());
    assert!(ingestor.decoder().roles().is_empty());

    // A valid follow-up batch is unaffected by the earlier rejection.
    let good = vec![registration_event("http://agent-1:8081/")];
    assert_eq!(ingestor.ingest_json(&body(&good)).await.expect("good"), 1);
    assert_eq!(ingestor.registry().len(), 1);
}
