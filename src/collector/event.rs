use std::collections::HashMap;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::counter::{now_ms, CounterSnapshot, Key, Role, StatAccumulator, StatSummary, Unit};
use crate::store::gauge::GaugeAggregate;
use crate::store::status::{NodeStatus, ValidationResult};
use crate::tracking::entry::PathTrackingEntry;

pub const COUNTER: &str = "counter";
pub const GAUGE: &str = "gauge";
pub const STATUS: &str = "status";
pub const PATH_TRACKING: &str = "pathtracking";
pub const REGISTRATION: &str = "registration";
/// One validation result per event; a batch led by one is a node status.
pub const VALIDATION: &str = "validation";

/// First byte of a binary path-tracking payload.
pub const BINARY_PATH_TRACKING_MARKER: u8 = 0x50;

/// Content type of the binary path-tracking fast path.
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Reasons an inbound batch is rejected. Any error rejects the whole batch.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed event batch: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event {index} ({kind}): {source}")]
    InvalidEvent {
        index: usize,
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("event {index}: unknown unit '{unit}'")]
    UnknownUnit { index: usize, unit: String },

    #[error("event {index}: role '{role}' is measured in {existing}, got '{unit}'")]
    IncompatibleRole {
        index: usize,
        role: String,
        existing: &'static str,
        unit: String,
    },

    #[error("validation batch has no marker on its first event")]
    MissingMarker,

    #[error("binary payload does not start with the path-tracking marker")]
    BadMarker,

    #[error("binary path-tracking payload: {0}")]
    Binary(#[from] bincode::Error),
}

/// Envelope of one event on the wire.
///
/// `time` is milliseconds since the epoch; when absent the reception time
/// is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "now_ms")]
    pub time: u64,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl WireEvent {
    pub fn new(kind: &str, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.to_string(),
            time: now_ms(),
            data,
        }
    }
}

/// A decoded, validated event ready to be routed to its store.
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    Counter {
        key: Key,
        marker: String,
        stats: StatAccumulator,
        concurrency: i32,
    },
    Gauge {
        role: Role,
        marker: String,
        time: u64,
        value: f64,
    },
    Status {
        marker: String,
        status: NodeStatus,
    },
    PathTracking(PathTrackingEntry),
    Registration {
        url: String,
    },
}

impl CollectorEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CollectorEvent::Counter { .. } => COUNTER,
            CollectorEvent::Gauge { .. } => GAUGE,
            CollectorEvent::Status { .. } => STATUS,
            CollectorEvent::PathTracking(_) => PATH_TRACKING,
            CollectorEvent::Registration { .. } => REGISTRATION,
        }
    }
}

#[derive(Deserialize)]
struct CounterData {
    role: String,
    unit: String,
    name: String,
    marker: String,
    #[serde(flatten)]
    summary: StatSummary,
    #[serde(default)]
    concurrency: i32,
}

#[derive(Deserialize)]
struct GaugeData {
    role: String,
    unit: String,
    marker: String,
    value: f64,
}

#[derive(Deserialize)]
struct StatusData {
    marker: String,
    #[serde(default)]
    results: Vec<ValidationResult>,
}

#[derive(Deserialize)]
struct ValidationData {
    #[serde(default)]
    marker: Option<String>,
    #[serde(flatten)]
    result: ValidationResult,
}

#[derive(Deserialize)]
struct RegistrationData {
    url: String,
}

/// Turns wire batches into [`CollectorEvent`]s.
///
/// Roles are cached by name so every event for a role shares one unit. A
/// report in another unit of the same dimension is rescaled into the cached
/// unit; a report in a different dimension rejects the batch.
#[derive(Default)]
pub struct EventDecoder {
    roles: DashMap<String, Role>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a JSON array of events. Nothing is returned unless every
    /// event decodes; roles first seen in a rejected batch are not cached.
    /// Events of unknown type are logged and skipped. A batch whose first
    /// event is a validation decodes as a single node status.
    pub fn decode_batch(&self, body: &[u8]) -> Result<Vec<CollectorEvent>, DecodeError> {
        let wire: Vec<WireEvent> = serde_json::from_slice(body)?;
        self.decode_events(wire)
    }

    pub fn decode_events(&self, wire: Vec<WireEvent>) -> Result<Vec<CollectorEvent>, DecodeError> {
        if wire.first().is_some_and(|e| e.kind == VALIDATION) {
            return decode_validation_batch(&wire).map(|status| vec![status]);
        }

        let mut pending: HashMap<String, Role> = HashMap::new();
        let mut events = Vec::with_capacity(wire.len());

        for (index, event) in wire.into_iter().enumerate() {
            let decoded = match event.kind.as_str() {
                COUNTER => {
                    let data: CounterData = parse(index, &event)?;
                    let (role, factor) = self.resolve_role(index, &data.role, &data.unit, &mut pending)?;
                    let stats = StatAccumulator::from(data.summary);
                    CollectorEvent::Counter {
                        key: Key::new(role, data.name),
                        marker: data.marker,
                        stats: if factor == 1.0 { stats } else { stats.scaled(factor) },
                        concurrency: data.concurrency,
                    }
                }
                GAUGE => {
                    let data: GaugeData = parse(index, &event)?;
                    let (role, factor) = self.resolve_role(index, &data.role, &data.unit, &mut pending)?;
                    CollectorEvent::Gauge {
                        role,
                        marker: data.marker,
                        time: event.time,
                        value: data.value * factor,
                    }
                }
                STATUS => {
                    let data: StatusData = parse(index, &event)?;
                    CollectorEvent::Status {
                        marker: data.marker,
                        status: NodeStatus::new(data.results),
                    }
                }
                PATH_TRACKING => CollectorEvent::PathTracking(parse(index, &event)?),
                REGISTRATION => {
                    let data: RegistrationData = parse(index, &event)?;
                    CollectorEvent::Registration { url: data.url }
                }
                other => {
                    tracing::warn!(index, event_type = other, "unexpected event type, skipping");
                    continue;
                }
            };
            events.push(decoded);
        }

        for (name, role) in pending {
            self.roles.entry(name).or_insert(role);
        }

        Ok(events)
    }

    /// Returns the role to record under and the factor converting values
    /// from `unit_name` into that role's unit.
    fn resolve_role(
        &self,
        index: usize,
        name: &str,
        unit_name: &str,
        pending: &mut HashMap<String, Role>,
    ) -> Result<(Role, f64), DecodeError> {
        let unit = Unit::by_name(unit_name).ok_or_else(|| DecodeError::UnknownUnit {
            index,
            unit: unit_name.to_string(),
        })?;

        let existing = self
            .roles
            .get(name)
            .map(|r| r.value().clone())
            .or_else(|| pending.get(name).cloned());

        let role = match existing {
            Some(role) => role,
            None => {
                let role = Role::new(name, unit);
                pending.insert(name.to_string(), role.clone());
                role
            }
        };

        let factor = role
            .unit()
            .convert(1.0, &unit)
            .map_err(|_| DecodeError::IncompatibleRole {
                index,
                role: name.to_string(),
                existing: role.unit().name(),
                unit: unit_name.to_string(),
            })?;

        Ok((role, factor))
    }

    /// Roles seen so far, by name.
    pub fn role(&self, name: &str) -> Option<Role> {
        self.roles.get(name).map(|r| r.value().clone())
    }

    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.roles.iter().map(|r| r.value().clone()).collect();
        roles.sort_by(|a, b| a.name().cmp(b.name()));
        roles
    }
}

/// Every event carries one result; the first one names the node.
fn decode_validation_batch(wire: &[WireEvent]) -> Result<CollectorEvent, DecodeError> {
    let mut marker = None;
    let mut results = Vec::with_capacity(wire.len());

    for (index, event) in wire.iter().enumerate() {
        let data: ValidationData = parse(index, event)?;
        if index == 0 {
            marker = data.marker;
        }
        results.push(data.result);
    }

    Ok(CollectorEvent::Status {
        marker: marker.ok_or(DecodeError::MissingMarker)?,
        status: NodeStatus::new(results),
    })
}

fn parse<T: DeserializeOwned>(index: usize, event: &WireEvent) -> Result<T, DecodeError> {
    T::deserialize(Value::Object(event.data.clone())).map_err(|source| DecodeError::InvalidEvent {
        index,
        kind: event.kind.clone(),
        source,
    })
}

/// Decodes the binary path-tracking fast path: the marker byte followed by
/// a bincode-encoded list of entries.
pub fn decode_binary_path_entries(body: &[u8]) -> Result<Vec<PathTrackingEntry>, DecodeError> {
    match body.split_first() {
        Some((&BINARY_PATH_TRACKING_MARKER, payload)) => Ok(bincode::deserialize(payload)?),
        _ => Err(DecodeError::BadMarker),
    }
}

pub fn encode_binary_path_entries(entries: &[PathTrackingEntry]) -> bincode::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(1 + bincode::serialized_size(entries)? as usize);
    out.push(BINARY_PATH_TRACKING_MARKER);
    bincode::serialize_into(&mut out, entries)?;
    Ok(out)
}

fn object<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => {
            tracing::error!(error = %e, "encoding event data");
            Map::new()
        }
    }
}

pub fn counter_event(snapshot: &CounterSnapshot, marker: &str) -> WireEvent {
    let mut data = object(snapshot);
    data.insert("marker".to_string(), Value::from(marker));
    WireEvent::new(COUNTER, data)
}

/// A flushed gauge window travels as its mean at the flush time.
pub fn gauge_event(gauge: &GaugeAggregate, marker: &str) -> WireEvent {
    let mut data = Map::new();
    data.insert("role".to_string(), Value::from(gauge.role.as_str()));
    data.insert("unit".to_string(), Value::from(gauge.unit));
    data.insert("marker".to_string(), Value::from(marker));
    data.insert("value".to_string(), Value::from(gauge.mean));
    WireEvent {
        kind: GAUGE.to_string(),
        time: gauge.time,
        data,
    }
}

pub fn status_event(marker: &str, results: &[ValidationResult]) -> WireEvent {
    let mut data = Map::new();
    data.insert("marker".to_string(), Value::from(marker));
    data.insert(
        "results".to_string(),
        Value::Array(results.iter().map(|r| Value::Object(object(r))).collect()),
    );
    WireEvent::new(STATUS, data)
}

pub fn path_tracking_event(entry: &PathTrackingEntry) -> WireEvent {
    WireEvent::new(PATH_TRACKING, object(entry))
}

pub fn registration_event(url: &str) -> WireEvent {
    let mut data = Map::new();
    data.insert("url".to_string(), Value::from(url));
    WireEvent::new(REGISTRATION, data)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::counter::Counter;
    use crate::store::status::Status;

    fn decode(decoder: &EventDecoder, batch: Value) -> Result<Vec<CollectorEvent>, DecodeError> {
        decoder.decode_batch(batch.to_string().as_bytes())
    }

    fn counter_json(role: &str, unit: &str, marker: &str, hits: u64) -> Value {
        json!({
            "type": "counter",
            "time": 1_700_000_000_000u64,
            "data": {
                "role": role, "unit": unit, "name": "checkout", "marker": marker,
                "hits": hits, "sum": 6.0, "min": 1.0, "max": 3.0,
                "mean": 2.0, "variance": 1.0, "m2": 2.0, "concurrency": 4
            }
        })
    }

    #[test]
    fn test_decode_counter_event() {
        let decoder = EventDecoder::new();
        let events = decode(&decoder, json!([counter_json("web", "ns", "node-a", 3)])).expect("decode");

        assert_eq!(events.len(), 1);
        match &events[0] {
            CollectorEvent::Counter { key, marker, stats, concurrency } => {
                assert_eq!(key.role().name(), "web");
                assert_eq!(key.role().unit(), Unit::NANOSECOND);
                assert_eq!(key.name(), "checkout");
                assert_eq!(marker, "node-a");
                assert_eq!(stats.hits(), 3);
                assert_eq!(stats.mean(), 2.0);
                assert_eq!(*concurrency, 4);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_every_kind() {
        let decoder = EventDecoder::new();
        let batch = json!([
            {"type": "gauge", "time": 1234, "data": {"role": "heap", "unit": "b", "marker": "n", "value": 5.0}},
            {"type": "status", "data": {"marker": "n", "results": [{"name": "db", "status": "DEGRADED", "message": "slow"}]}},
            {"type": "pathtracking", "data": {
                "trackingId": "t", "nodeId": "n", "className": "C", "methodName": "m",
                "startTime": 1, "executionTime": 2, "level": 1
            }},
            {"type": "registration", "data": {"url": "http://agent:8080/"}},
        ]);
        let events = decode(&decoder, batch).expect("decode");

        let kinds: Vec<&str> = events.iter().map(CollectorEvent::kind).collect();
        assert_eq!(kinds, vec![GAUGE, STATUS, PATH_TRACKING, REGISTRATION]);

        match &events[0] {
            CollectorEvent::Gauge { time, value, .. } => {
                assert_eq!(*time, 1234);
                assert_eq!(*value, 5.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[1] {
            CollectorEvent::Status { status, .. } => assert_eq!(status.status(), Status::Degraded),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let decoder = EventDecoder::new();
        let batch = json!([
            {"type": "registration", "data": {"url": "http://a/"}},
            {"type": "heartbeat", "data": {}},
        ]);
        let events = decode(&decoder, batch).expect("decode");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_validation_batch_is_one_node_status() {
        let decoder = EventDecoder::new();
        let batch = json!([
            {"type": "validation", "data": {"marker": "node1", "name": "db", "status": "OK", "message": "good"}},
            {"type": "validation", "data": {"name": "disk", "status": "KO", "message": "full"}},
        ]);
        let events = decode(&decoder, batch).expect("decode");

        assert_eq!(events.len(), 1);
        match &events[0] {
            CollectorEvent::Status { marker, status } => {
                assert_eq!(marker, "node1");
                assert_eq!(status.status(), Status::Ko);
                let names: Vec<&str> = status.results.iter().map(|r| r.name.as_str()).collect();
                assert_eq!(names, vec!["db", "disk"]);
                assert_eq!(status.results[1].message, "full");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_validation_batch_needs_marker() {
        let decoder = EventDecoder::new();
        let missing = json!([{"type": "validation", "data": {"name": "db", "status": "OK"}}]);
        assert!(matches!(
            decode(&decoder, missing),
            Err(DecodeError::MissingMarker)
        ));

        let bad_status = json!([
            {"type": "validation", "data": {"marker": "n", "name": "db", "status": "FINE"}},
        ]);
        assert!(matches!(
            decode(&decoder, bad_status),
            Err(DecodeError::InvalidEvent { index: 0, .. })
        ));
    }

    #[test]
    fn test_missing_field_rejects_batch() {
        let decoder = EventDecoder::new();
        let batch = json!([
            counter_json("fresh", "ms", "node-a", 1),
            {"type": "gauge", "data": {"role": "heap", "unit": "b", "marker": "n"}},
        ]);
        let err = decode(&decoder, batch).expect_err("missing value");
        assert!(matches!(err, DecodeError::InvalidEvent { index: 1, .. }), "{err}");
        // Roles from a rejected batch are not remembered.
        assert!(decoder.role("fresh").is_none());
    }

    #[test]
    fn test_malformed_json_rejected() {
        let decoder = EventDecoder::new();
        let err = decoder.decode_batch(b"[{\"type\":").expect_err("truncated");
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_unknown_unit_rejected() {
        let decoder = EventDecoder::new();
        let err = decode(&decoder, json!([counter_json("web", "parsec", "n", 1)])).expect_err("unit");
        assert!(matches!(err, DecodeError::UnknownUnit { .. }));
    }

    #[test]
    fn test_incompatible_role_rejected() {
        let decoder = EventDecoder::new();
        decode(&decoder, json!([counter_json("web", "ns", "n", 1)])).expect("first");
        let err = decode(&decoder, json!([counter_json("web", "Kb", "n", 1)])).expect_err("bytes");
        assert!(matches!(err, DecodeError::IncompatibleRole { existing: "ns", .. }), "{err}");
    }

    #[test]
    fn test_same_dimension_is_rescaled() {
        let decoder = EventDecoder::new();
        decode(&decoder, json!([counter_json("web", "ns", "n", 1)])).expect("first");
        let events = decode(&decoder, json!([counter_json("web", "us", "n", 3)])).expect("second");
        match &events[0] {
            CollectorEvent::Counter { key, stats, .. } => {
                assert_eq!(key.role().unit(), Unit::NANOSECOND);
                assert_eq!(stats.mean(), 2_000.0);
                assert_eq!(stats.m2(), 2_000_000.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_encoded_events_decode() {
        let counter = Counter::new(Key::new(Role::web(), "home"));
        counter.add_internal(10.0);
        counter.add_internal(30.0);

        let batch = vec![
            counter_event(&counter.snapshot(), "agent-1"),
            registration_event("http://agent-1:8080/"),
        ];
        let body = serde_json::to_vec(&batch).expect("encode");
        let events = EventDecoder::new().decode_batch(&body).expect("decode");

        match &events[0] {
            CollectorEvent::Counter { stats, marker, .. } => {
                assert_eq!(marker, "agent-1");
                assert_eq!(stats.hits(), 2);
                assert_eq!(stats.mean(), 20.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_binary_path_entries() {
        let entry = PathTrackingEntry {
            tracking_id: "t".into(),
            node_id: "n".into(),
            class_name: "C".into(),
            method_name: "m".into(),
            start_time: 10,
            execution_time: 20,
            level: 1,
        };
        let body = encode_binary_path_entries(&[entry.clone()]).expect("encode");
        assert_eq!(body[0], BINARY_PATH_TRACKING_MARKER);
        assert_eq!(decode_binary_path_entries(&body).expect("decode"), vec![entry]);

        assert!(matches!(decode_binary_path_entries(&[0x00, 1, 2]), Err(DecodeError::BadMarker)));
        assert!(matches!(decode_binary_path_entries(&[]), Err(DecodeError::BadMarker)));
        assert!(matches!(
            decode_binary_path_entries(&[BINARY_PATH_TRACKING_MARKER, 0xff]),
            Err(DecodeError::Binary(_))
        ));
    }
}
