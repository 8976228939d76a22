//! Span emission.
//!
//! The runner describes spans as partial [`SpanRecord`] writes and hands them to a
//! [`Tracer`]. Writes for the same `(root_span_id, span_id)` are meant to be
//! merged field by field by whoever stores them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::trace_store::TraceStore;
use evalflow_types::{FreshnessState, Metadata, SpanQuery, SpanQueryResponse, SpanRecord};

/// Span purpose that marks scorer spans. Trace queries made on behalf of a
/// scorer exclude spans carrying it.
pub const SCORER_PURPOSE: &str = "scorer";

#[async_trait]
pub trait Tracer: Send + Sync {
    /// Record a (possibly partial) write for one span.
    fn record(&self, record: SpanRecord);

    /// Push any buffered writes to wherever they are going.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Discards everything.
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn record(&self, _record: SpanRecord) {}
}

/// Emits every span write as a `tracing` debug event.
pub struct LogTracer;

impl Tracer for LogTracer {
    fn record(&self, record: SpanRecord) {
        tracing::debug!(
            target: "evalflow::span",
            root_span_id = %record.root_span_id,
            span_id = %record.span_id,
            span_type = record.span_type().unwrap_or("-"),
            record = %serde_json::to_string(&record).unwrap_or_default(),
            "span write"
        );
    }
}

/// Keeps merged span records in memory and answers trace queries from them.
///
/// Queries always report `complete` freshness since writes are visible immediately.
#[derive(Default)]
pub struct MemoryTracer {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    records: Vec<SpanRecord>,
    index: HashMap<(String, String), usize>,
}

impl MemoryTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every span, in first-write order.
    pub fn records(&self) -> Vec<SpanRecord> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .clone()
    }

    pub fn spans_for_root(&self, root_span_id: &str) -> Vec<SpanRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.root_span_id == root_span_id)
            .collect()
    }
}

impl Tracer for MemoryTracer {
    fn record(&self, record: SpanRecord) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (record.root_span_id.clone(), record.span_id.clone());
        match state.index.get(&key) {
            Some(&idx) => state.records[idx].merge(record),
            None => {
                let idx = state.records.len();
                state.index.insert(key, idx);
                state.records.push(record);
            }
        }
    }
}

#[async_trait]
impl TraceStore for MemoryTracer {
    async fn query(&self, query: &SpanQuery) -> Result<SpanQueryResponse> {
        let spans = self
            .records()
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();
        Ok(SpanQueryResponse {
            spans,
            freshness_state: FreshnessState::Complete,
        })
    }
}

/// Handle to an open span. Cheap to clone; every method writes through the tracer.
#[derive(Clone)]
pub struct Span {
    tracer: Arc<dyn Tracer>,
    root_span_id: String,
    span_id: String,
    started_at: f64,
}

impl Span {
    /// Open the root span of a new trace. `parent` is an opaque identifier of the
    /// object the trace belongs to (e.g. an experiment), recorded as an attribute.
    pub fn root(tracer: Arc<dyn Tracer>, name: &str, span_type: &str, parent: Option<&str>) -> Span {
        let span_id = Uuid::new_v4().to_string();
        let span = Span {
            tracer,
            root_span_id: span_id.clone(),
            span_id,
            started_at: now_secs(),
        };
        let mut attrs = attributes(name, span_type, None);
        if let Some(parent) = parent {
            attrs.insert("parent".into(), json!(parent));
        }
        span.open(name, attrs, None);
        span
    }

    pub fn child(&self, name: &str, span_type: &str) -> Span {
        self.child_span(name, attributes(name, span_type, None))
    }

    /// Child span tagged with a purpose, e.g. [`SCORER_PURPOSE`].
    pub fn child_with_purpose(&self, name: &str, span_type: &str, purpose: &str) -> Span {
        self.child_span(name, attributes(name, span_type, Some(purpose)))
    }

    fn child_span(&self, name: &str, attrs: Metadata) -> Span {
        let span = Span {
            tracer: self.tracer.clone(),
            root_span_id: self.root_span_id.clone(),
            span_id: Uuid::new_v4().to_string(),
            started_at: now_secs(),
        };
        span.open(name, attrs, Some(self.span_id.clone()));
        span
    }

    fn open(&self, name: &str, attrs: Metadata, parent_span_id: Option<String>) {
        self.log(SpanRecord {
            parent_span_id,
            name: Some(name.to_string()),
            span_attributes: Some(attrs),
            metrics: Some(metrics(&[("start", self.started_at)])),
            ..Default::default()
        });
    }

    pub fn root_span_id(&self) -> &str {
        &self.root_span_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Write fields onto this span. The record's ids are replaced with this span's.
    pub fn log(&self, mut record: SpanRecord) {
        record.root_span_id = self.root_span_id.clone();
        record.span_id = self.span_id.clone();
        self.tracer.record(record);
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.log(SpanRecord {
            error: Some(message.into()),
            ..Default::default()
        });
    }

    pub fn end(&self) {
        self.end_with_metrics(Metadata::new());
    }

    /// Close the span, recording `extra` next to the start and end timestamps.
    pub fn end_with_metrics(&self, mut extra: Metadata) {
        extra.extend(metrics(&[("start", self.started_at), ("end", now_secs())]));
        self.log(SpanRecord {
            metrics: Some(extra),
            ..Default::default()
        });
    }
}

fn attributes(name: &str, span_type: &str, purpose: Option<&str>) -> Metadata {
    let mut attrs = Metadata::new();
    attrs.insert("name".into(), json!(name));
    attrs.insert("type".into(), json!(span_type));
    if let Some(purpose) = purpose {
        attrs.insert("purpose".into(), json!(purpose));
    }
    attrs
}

fn metrics(pairs: &[(&str, f64)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect()
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_spans_share_root_and_point_at_parent() {
        let tracer = Arc::new(MemoryTracer::new());
        let root = Span::root(tracer.clone(), "eval", "eval", Some("experiment:e1"));
        let task = root.child("task", "task");
        let score = root.child_with_purpose("score", "score", SCORER_PURPOSE);
        task.end();
        score.end();
        root.end();

        let records = tracer.spans_for_root(root.root_span_id());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].span_id, root.span_id());
        assert_eq!(
            records[0].span_attributes.as_ref().unwrap()["parent"],
            json!("experiment:e1")
        );
        assert_eq!(records[1].parent_span_id.as_deref(), Some(root.span_id()));
        assert_eq!(records[1].span_type(), Some("task"));
        assert_eq!(records[2].purpose(), Some(SCORER_PURPOSE));
    }

    #[test]
    fn end_keeps_start_metric() {
        let tracer = Arc::new(MemoryTracer::new());
        let span = Span::root(tracer.clone(), "eval", "eval", None);
        span.end();
        let metrics = tracer.records()[0].metrics.clone().unwrap();
        assert!(metrics.contains_key("start"));
        assert!(metrics.contains_key("end"));
    }

    #[tokio::test]
    async fn memory_tracer_answers_queries_complete() {
        let tracer = Arc::new(MemoryTracer::new());
        let root = Span::root(tracer.clone(), "eval", "eval", None);
        root.child("llm", "llm");
        root.child_with_purpose("score", "score", SCORER_PURPOSE);

        let response = tracer
            .query(&SpanQuery {
                root_span_id: root.root_span_id().to_string(),
                exclude_purpose: Some(SCORER_PURPOSE.to_string()),
                span_types: None,
            })
            .await
            .unwrap();
        assert_eq!(response.freshness_state, FreshnessState::Complete);
        assert_eq!(response.spans.len(), 2);
    }
}
