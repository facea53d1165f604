//! OTLP/JSON file telemetry source
//!
//! Reads a trace export (`resourceSpans[].scopeSpans[].spans[]`), merges
//! resource and span attributes (span wins) and maps each span to a
//! [`TelemetryRecord`]. Spans are matched on `app_id`, falling back to
//! `service.name`. The file is parsed on the blocking pool for every fetch.

use super::{into_chunks, ChunkStream, TelemetrySource};
use crate::error::{EvalError, Result};
use crate::types::{EvaluationWindow, TelemetryRecord, TRACE_ID_KEY};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

pub struct OtlpFileSource {
    path: PathBuf,
    chunk_size: usize,
}

impl OtlpFileSource {
    pub fn new(path: impl Into<PathBuf>, chunk_size: usize) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(EvalError::Config(
                "otlp_file_path is required when telemetry_source.type=otlp".to_string(),
            ));
        }
        Ok(Self {
            path,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySource for OtlpFileSource {
    fn fetch(&self, app_id: &str, window: &EvaluationWindow) -> ChunkStream {
        let (tx, rx) = mpsc::channel(2);
        let path = self.path.clone();
        let app_id = app_id.to_string();
        let window = *window;
        let chunk_size = self.chunk_size;

        tokio::spawn(async move {
            let loaded =
                tokio::task::spawn_blocking(move || read_records(&path, &app_id, &window)).await;
            let records = match loaded {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                Err(join_err) => {
                    let _ = tx
                        .send(Err(EvalError::Other(format!(
                            "OTLP reader task failed: {}",
                            join_err
                        ))))
                        .await;
                    return;
                }
            };
            for chunk in into_chunks(records, chunk_size) {
                if tx.send(Ok(chunk)).await.is_err() {
                    debug!("OTLP consumer dropped the stream");
                    return;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

fn read_records(path: &Path, app_id: &str, window: &EvaluationWindow) -> Result<Vec<TelemetryRecord>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EvalError::Io(std::io::Error::new(
            e.kind(),
            format!("OTLP file not found: {} ({})", path.display(), e),
        ))
    })?;
    let payload: Value = serde_json::from_str(&text)?;
    parse_payload(&payload, app_id, window)
}

fn attr_value(value: &Value) -> Value {
    for key in ["stringValue", "intValue", "doubleValue", "boolValue"] {
        if let Some(v) = value.get(key) {
            return v.clone();
        }
    }
    Value::Null
}

fn attrs_to_map(attrs: Option<&Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for attr in attrs.and_then(Value::as_array).into_iter().flatten() {
        let Some(key) = attr.get("key").and_then(Value::as_str) else {
            continue;
        };
        out.insert(
            key.to_string(),
            attr.get("value").map(attr_value).unwrap_or(Value::Null),
        );
    }
    out
}

fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn first_text(attrs: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| text_of(attrs.get(*k)))
}

fn timestamp_from_nanos(raw: Option<&Value>) -> DateTime<Utc> {
    let nanos = match raw {
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        Some(Value::Number(n)) => n.as_i64(),
        _ => None,
    };
    match nanos {
        Some(n) if n > 0 => DateTime::from_timestamp_nanos(n),
        _ => Utc::now(),
    }
}

/// Map an OTLP/JSON payload to the records of `app_id` inside `window`
pub fn parse_payload(
    payload: &Value,
    app_id: &str,
    window: &EvaluationWindow,
) -> Result<Vec<TelemetryRecord>> {
    let mut records = Vec::new();
    let resource_spans = payload
        .get("resourceSpans")
        .and_then(Value::as_array)
        .into_iter()
        .flatten();

    for rs in resource_spans {
        let resource_attrs = attrs_to_map(rs.get("resource").and_then(|r| r.get("attributes")));
        let spans = rs
            .get("scopeSpans")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .flat_map(|ss| ss.get("spans").and_then(Value::as_array).into_iter().flatten());

        for span in spans {
            let mut attrs = resource_attrs.clone();
            attrs.extend(attrs_to_map(span.get("attributes")));

            let record_app = first_text(&attrs, &["app_id", "service.name"]).unwrap_or_default();
            if record_app != app_id {
                continue;
            }
            let timestamp = timestamp_from_nanos(span.get("startTimeUnixNano"));
            if !window.contains(&timestamp) {
                continue;
            }

            let trace_id = text_of(span.get("traceId")).filter(|t| !t.is_empty());
            let span_id = text_of(span.get("spanId")).filter(|s| !s.is_empty());
            let id = first_text(&attrs, &["event_id"]).unwrap_or_else(|| {
                format!(
                    "{}:{}",
                    app_id,
                    trace_id.clone().or_else(|| span_id.clone()).unwrap_or_default()
                )
            });
            let latency_ms = first_text(&attrs, &["latency_ms", "duration_ms"])
                .and_then(|v| v.trim().parse::<f64>().ok());

            let mut metadata = HashMap::new();
            if let Some(t) = &trace_id {
                metadata.insert(TRACE_ID_KEY.to_string(), Value::String(t.clone()));
            }
            if let Some(s) = span_id {
                metadata.insert("span_id".to_string(), Value::String(s));
            }
            if let Some(service) = attrs.get("service.name") {
                metadata.insert("service_name".to_string(), service.clone());
            }
            for key in ["status", "resource_utilization", "demographic_group"] {
                if let Some(v) = attrs.get(key) {
                    metadata.insert(key.to_string(), v.clone());
                }
            }

            records.push(TelemetryRecord {
                id,
                app_id: record_app,
                timestamp,
                model_id: first_text(&attrs, &["model_id", "llm.model"])
                    .unwrap_or_else(|| "unknown-model".to_string()),
                model_version: first_text(&attrs, &["model_version", "llm.model_version"])
                    .unwrap_or_else(|| "unknown-version".to_string()),
                input_text: first_text(&attrs, &["input_text", "llm.input"]).unwrap_or_default(),
                output_text: first_text(&attrs, &["output_text", "llm.output"]).unwrap_or_default(),
                expected_output: first_text(&attrs, &["expected_output"]),
                user_id: first_text(&attrs, &["user_id"]),
                latency_ms,
                metadata,
            });
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::io::Write;
    use tokio_stream::StreamExt;

    fn window() -> EvaluationWindow {
        EvaluationWindow::new(
            Utc.with_ymd_and_hms(2026, 2, 24, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 25, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn nanos(hour: u32) -> String {
        Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap()
            .to_string()
    }

    fn payload() -> Value {
        json!({
            "resourceSpans": [{
                "resource": {"attributes": [
                    {"key": "service.name", "value": {"stringValue": "chat-app"}},
                    {"key": "model_id", "value": {"stringValue": "gpt-x"}}
                ]},
                "scopeSpans": [{
                    "spans": [
                        {
                            "traceId": "T1",
                            "spanId": "S1",
                            "startTimeUnixNano": nanos(10),
                            "attributes": [
                                {"key": "input_text", "value": {"stringValue": "hi"}},
                                {"key": "output_text", "value": {"stringValue": "hello."}},
                                {"key": "latency_ms", "value": {"doubleValue": 120.5}}
                            ]
                        },
                        {
                            "traceId": "T2",
                            "spanId": "S2",
                            "startTimeUnixNano": nanos(11),
                            "attributes": [
                                {"key": "app_id", "value": {"stringValue": "other-app"}}
                            ]
                        }
                    ]
                }]
            }]
        })
    }

    #[test]
    fn test_parse_payload_maps_attributes() {
        let records = parse_payload(&payload(), "chat-app", &window()).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.id, "chat-app:T1");
        assert_eq!(r.model_id, "gpt-x");
        assert_eq!(r.model_version, "unknown-version");
        assert_eq!(r.output_text, "hello.");
        assert_eq!(r.latency_ms, Some(120.5));
        assert_eq!(r.trace_id().as_deref(), Some("T1"));
    }

    #[test]
    fn test_span_app_id_overrides_service_name() {
        let records = parse_payload(&payload(), "other-app", &window()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "other-app:T2");
    }

    #[tokio::test]
    async fn test_fetch_streams_chunks_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", payload()).unwrap();

        let source = OtlpFileSource::new(file.path(), 10).unwrap();
        let chunks: Vec<Result<Vec<TelemetryRecord>>> =
            source.fetch("chat-app", &window()).collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_yields_error() {
        let source = OtlpFileSource::new("/nonexistent/otlp.json", 10).unwrap();
        let chunks: Vec<Result<Vec<TelemetryRecord>>> =
            source.fetch("chat-app", &window()).collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(EvalError::Io(_))));
    }
}
