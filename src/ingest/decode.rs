//! Shared OTLP decode helpers: resource-attribute extraction and
//! `ResourceMetrics`/`ResourceLogs` → `(session_id, Metric|Event)` mapping.
//! Used by both the gRPC and HTTP receivers so the two transports agree on
//! semantics.

use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::common::v1::{any_value::Value as AnyValueKind, AnyValue, KeyValue};
use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
use opentelemetry_proto::tonic::metrics::v1::{metric::Data, ResourceMetrics};
use opentelemetry_proto::tonic::resource::v1::Resource;

use crate::types::{Attributes, Event, Metric};

/// The subset of resource attributes the store cares about, plus whatever
/// else rode along (used for per-metric/per-event attribute merges).
#[derive(Debug, Clone, Default)]
pub struct ResourceInfo {
    pub session_id: String,
    pub attributes: Attributes,
}

fn any_value_to_string(value: &AnyValue) -> String {
    match &value.value {
        Some(AnyValueKind::StringValue(s)) => s.clone(),
        Some(AnyValueKind::BoolValue(b)) => b.to_string(),
        Some(AnyValueKind::IntValue(i)) => i.to_string(),
        Some(AnyValueKind::DoubleValue(d)) => d.to_string(),
        _ => String::new(),
    }
}

fn kv_to_attributes(kvs: &[KeyValue]) -> Attributes {
    kvs.iter()
        .filter_map(|kv| kv.value.as_ref().map(|v| (kv.key.clone(), any_value_to_string(v))))
        .collect()
}

pub fn resource_info(resource: Option<&Resource>) -> ResourceInfo {
    let mut info = ResourceInfo::default();
    let Some(resource) = resource else { return info };
    info.attributes = kv_to_attributes(&resource.attributes);
    info.session_id = info.attributes.get("session.id").cloned().unwrap_or_default();
    info
}

fn nanos_to_timestamp(nanos: u64) -> DateTime<Utc> {
    if nanos == 0 {
        return DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default();
    }
    DateTime::<Utc>::from_timestamp(
        (nanos / 1_000_000_000) as i64,
        (nanos % 1_000_000_000) as u32,
    )
    .unwrap_or_default()
}

/// Flatten one `ResourceMetrics` into `(session_id, Metric)` pairs, merging
/// resource attributes, scope, and data-point attributes on each metric.
pub fn decode_resource_metrics(rm: &ResourceMetrics) -> Vec<(String, Metric)> {
    let info = resource_info(rm.resource.as_ref());
    let mut out = Vec::new();

    for scope_metrics in &rm.scope_metrics {
        for metric in &scope_metrics.metrics {
            let Some(data) = &metric.data else { continue };
            match data {
                Data::Gauge(gauge) => {
                    for dp in &gauge.data_points {
                        out.push(build_metric(&info, &metric.name, dp.time_unix_nano, dp_value(dp), &dp.attributes));
                    }
                }
                Data::Sum(sum) => {
                    for dp in &sum.data_points {
                        out.push(build_metric(&info, &metric.name, dp.time_unix_nano, dp_value(dp), &dp.attributes));
                    }
                }
                _ => {
                    tracing::debug!(metric = %metric.name, "skipping unsupported metric data kind");
                }
            }
        }
    }
    out
}

fn dp_value(dp: &opentelemetry_proto::tonic::metrics::v1::NumberDataPoint) -> f64 {
    use opentelemetry_proto::tonic::metrics::v1::number_data_point::Value;
    match dp.value {
        Some(Value::AsDouble(d)) => d,
        Some(Value::AsInt(i)) => i as f64,
        None => 0.0,
    }
}

fn build_metric(
    info: &ResourceInfo,
    name: &str,
    time_unix_nano: u64,
    value: f64,
    dp_attrs: &[KeyValue],
) -> (String, Metric) {
    let mut attributes = info.attributes.clone();
    attributes.extend(kv_to_attributes(dp_attrs));
    (
        info.session_id.clone(),
        Metric {
            name: name.to_string(),
            value,
            attributes,
            timestamp: nanos_to_timestamp(time_unix_nano),
        },
    )
}

/// Flatten one `ResourceLogs` into `(session_id, Event)` pairs. The event
/// name comes from the log record's `event_name` when present, else falls
/// back to its body string.
pub fn decode_resource_logs(rl: &ResourceLogs) -> Vec<(String, Event)> {
    let info = resource_info(rl.resource.as_ref());
    let mut out = Vec::new();

    for scope_logs in &rl.scope_logs {
        for record in &scope_logs.log_records {
            let mut attributes = info.attributes.clone();
            attributes.extend(kv_to_attributes(&record.attributes));

            let name = if !record.event_name.is_empty() {
                record.event_name.clone()
            } else {
                record
                    .body
                    .as_ref()
                    .map(any_value_to_string)
                    .unwrap_or_default()
            };

            let timestamp = nanos_to_timestamp(record.time_unix_nano);
            out.push((info.session_id.clone(), Event::new(name, attributes, timestamp)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_value_to_string_handles_each_variant() {
        let s = AnyValue { value: Some(AnyValueKind::StringValue("x".to_string())) };
        assert_eq!(any_value_to_string(&s), "x");
        let i = AnyValue { value: Some(AnyValueKind::IntValue(42)) };
        assert_eq!(any_value_to_string(&i), "42");
        let none = AnyValue { value: None };
        assert_eq!(any_value_to_string(&none), "");
    }

    #[test]
    fn resource_info_extracts_session_id() {
        let resource = Resource {
            attributes: vec![KeyValue {
                key: "session.id".to_string(),
                value: Some(AnyValue { value: Some(AnyValueKind::StringValue("abc".to_string())) }),
            }],
            ..Default::default()
        };
        let info = resource_info(Some(&resource));
        assert_eq!(info.session_id, "abc");
    }

    #[test]
    fn zero_nanos_decodes_to_unix_epoch_sentinel() {
        let ts = nanos_to_timestamp(0);
        assert_eq!(ts.timestamp(), 0);
    }
}
