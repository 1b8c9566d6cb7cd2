//! OTLP/JSON-shaped encoding of batches.
//!
//! The layout follows the collector's JSON mapping (resource → scope → records,
//! hex ids, nanosecond timestamps as strings) closely enough for an OTLP/HTTP
//! JSON receiver, without aiming to be byte-exact with the protobuf encoding.

use crate::exporter::Batch;
use crate::instrument::{InstrumentKind, Labels, MetricPoint, PointValue};
use crate::log_record::LogRecord;
use crate::resource::Resource;
use crate::span::{AttributeValue, Span, SpanKind, SpanStatus};
use serde_json::{json, Value};

/// Instrumentation scope name reported with every batch.
pub const SCOPE_NAME: &str = env!("CARGO_PKG_NAME");

/// A record type that can be shipped to an OTLP/HTTP collector.
pub trait OtlpSignal: Sized + Send + Sync + 'static {
    /// Signal name used in diagnostics (`"traces"`, `"logs"`, `"metrics"`).
    const SIGNAL: &'static str;
    /// Default path appended to a collector base URL.
    const PATH: &'static str;

    /// Encodes a whole batch as one request body.
    fn encode(batch: &Batch<Self>) -> Value;
}

fn any_value(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::String(s) => json!({ "stringValue": s }),
        AttributeValue::Int(i) => json!({ "intValue": i.to_string() }),
        AttributeValue::Float(f) => json!({ "doubleValue": f }),
        AttributeValue::Bool(b) => json!({ "boolValue": b }),
        AttributeValue::Array(items) => json!({
            "arrayValue": {
                "values": items.iter().map(|s| json!({ "stringValue": s })).collect::<Vec<_>>()
            }
        }),
    }
}

fn key_values<'a>(pairs: impl Iterator<Item = (&'a str, &'a AttributeValue)>) -> Value {
    Value::Array(
        pairs
            .map(|(k, v)| json!({ "key": k, "value": any_value(v) }))
            .collect(),
    )
}

fn label_values(labels: &Labels) -> Value {
    Value::Array(
        labels
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": { "stringValue": v } }))
            .collect(),
    )
}

fn resource_value(resource: &Resource) -> Value {
    json!({ "attributes": key_values(resource.iter()) })
}

fn scope() -> Value {
    json!({ "name": SCOPE_NAME, "version": env!("CARGO_PKG_VERSION") })
}

fn span_kind(kind: SpanKind) -> u8 {
    match kind {
        SpanKind::Internal => 1,
        SpanKind::Server => 2,
        SpanKind::Client => 3,
    }
}

fn status_code(status: SpanStatus) -> u8 {
    match status {
        SpanStatus::Unset => 0,
        SpanStatus::Ok => 1,
        SpanStatus::Error => 2,
    }
}

impl OtlpSignal for Span {
    const SIGNAL: &'static str = "traces";
    const PATH: &'static str = "/v1/traces";

    fn encode(batch: &Batch<Self>) -> Value {
        let spans: Vec<Value> = batch
            .records
            .iter()
            .map(|span| {
                let mut value = json!({
                    "traceId": format!("{:032x}", span.trace_id),
                    "spanId": format!("{:016x}", span.span_id),
                    "name": span.name,
                    "kind": span_kind(span.kind),
                    "startTimeUnixNano": span.start_time.to_string(),
                    "endTimeUnixNano": span.end_time.unwrap_or(span.start_time).to_string(),
                    "attributes": key_values(span.attributes.iter().map(|(k, v)| (k.as_str(), v))),
                    "status": { "code": status_code(span.status) },
                });
                if let Some(parent) = span.parent_span_id {
                    value["parentSpanId"] = json!(format!("{:016x}", parent));
                }
                value
            })
            .collect();

        json!({
            "resourceSpans": [{
                "resource": resource_value(&batch.resource),
                "scopeSpans": [{ "scope": scope(), "spans": spans }]
            }]
        })
    }
}

impl OtlpSignal for LogRecord {
    const SIGNAL: &'static str = "logs";
    const PATH: &'static str = "/v1/logs";

    fn encode(batch: &Batch<Self>) -> Value {
        let records: Vec<Value> = batch
            .records
            .iter()
            .map(|record| {
                let mut value = json!({
                    "timeUnixNano": record.timestamp.to_string(),
                    "severityNumber": record.severity.number(),
                    "severityText": record.severity.as_str(),
                    "body": { "stringValue": record.body },
                });
                if let Some(ctx) = record.span_context() {
                    value["traceId"] = json!(ctx.trace_id_hex());
                    value["spanId"] = json!(ctx.span_id_hex());
                }
                value
            })
            .collect();

        json!({
            "resourceLogs": [{
                "resource": resource_value(&batch.resource),
                "scopeLogs": [{ "scope": scope(), "logRecords": records }]
            }]
        })
    }
}

const CUMULATIVE: u8 = 2;

fn data_point(point: &MetricPoint) -> Value {
    let mut value = json!({
        "attributes": label_values(&point.labels),
        "startTimeUnixNano": point.start_time.to_string(),
        "timeUnixNano": point.timestamp.to_string(),
    });
    match &point.value {
        PointValue::Sum(sum) => {
            value["asInt"] = json!(sum.to_string());
        }
        PointValue::Histogram(h) => {
            value["count"] = json!(h.count.to_string());
            value["sum"] = json!(h.sum);
            value["min"] = json!(h.min);
            value["max"] = json!(h.max);
            value["explicitBounds"] = json!(h.bounds);
            value["bucketCounts"] = json!(h
                .bucket_counts
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>());
        }
    }
    value
}

impl OtlpSignal for MetricPoint {
    const SIGNAL: &'static str = "metrics";
    const PATH: &'static str = "/v1/metrics";

    fn encode(batch: &Batch<Self>) -> Value {
        // One metric entry per instrument, points kept in collection order.
        let mut metrics: Vec<(&MetricPoint, Vec<Value>)> = Vec::new();
        for point in &batch.records {
            match metrics.iter_mut().find(|(first, _)| {
                first.descriptor.name == point.descriptor.name
                    && first.descriptor.kind == point.descriptor.kind
            }) {
                Some((_, points)) => points.push(data_point(point)),
                None => metrics.push((point, vec![data_point(point)])),
            }
        }

        let metrics: Vec<Value> = metrics
            .into_iter()
            .map(|(first, points)| {
                let d = &first.descriptor;
                let mut value = json!({
                    "name": d.name,
                    "description": d.description,
                    "unit": d.unit,
                });
                match d.kind {
                    InstrumentKind::Counter => {
                        value["sum"] = json!({
                            "dataPoints": points,
                            "aggregationTemporality": CUMULATIVE,
                            "isMonotonic": true,
                        });
                    }
                    InstrumentKind::Histogram => {
                        value["histogram"] = json!({
                            "dataPoints": points,
                            "aggregationTemporality": CUMULATIVE,
                        });
                    }
                }
                value
            })
            .collect();

        json!({
            "resourceMetrics": [{
                "resource": resource_value(&batch.resource),
                "scopeMetrics": [{ "scope": scope(), "metrics": metrics }]
            }]
        })
    }
}
