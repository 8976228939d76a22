//! Read access to a case's own trace, for scorers.
//!
//! Spans are written by the tracer while the task runs, but the store they are
//! read back from may lag behind. [`TraceContext`] re-queries with exponential
//! backoff until the store reports `complete` freshness or retries run out, then
//! keeps whatever it got in the run's [`SpanCache`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::span_cache::SpanCache;
use crate::trace_store::TraceStore;
use crate::tracer::SCORER_PURPOSE;
use evalflow_types::{FreshnessState, SpanQuery, SpanRecord};

pub const DEFAULT_MAX_RETRIES: u32 = 8;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Span type of LLM call spans.
pub const LLM_SPAN_TYPE: &str = "llm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContextConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for TraceContextConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

/// Invoked once before the first remote query, e.g. to flush the tracer.
pub type FlushHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub struct TraceContext {
    root_span_id: String,
    store: Arc<dyn TraceStore>,
    cache: Arc<SpanCache>,
    config: TraceContextConfig,
    flush_hook: Option<FlushHook>,
    flushed: Arc<OnceCell<()>>,
}

impl TraceContext {
    pub fn new(root_span_id: impl Into<String>, store: Arc<dyn TraceStore>, cache: Arc<SpanCache>) -> Self {
        Self {
            root_span_id: root_span_id.into(),
            store,
            cache,
            config: TraceContextConfig::default(),
            flush_hook: None,
            flushed: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_config(mut self, config: TraceContextConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_flush_hook(mut self, hook: FlushHook) -> Self {
        self.flush_hook = Some(hook);
        self
    }

    pub fn root_span_id(&self) -> &str {
        &self.root_span_id
    }

    /// Spans of this trace, excluding scorer spans, optionally limited to the
    /// given span types (an empty slice means all types).
    ///
    /// Never fails: if the store cannot be queried the result is empty.
    pub async fn get_spans(&self, span_types: &[&str]) -> Vec<SpanRecord> {
        let records = match self.cache.get(&self.root_span_id) {
            Some(records) => records,
            None => match self.fetch().await {
                Ok(records) => records,
                Err(err) => {
                    warn!(root_span_id = %self.root_span_id, error = %format!("{err:#}"), "trace query failed; returning no spans");
                    return Vec::new();
                }
            },
        };

        if span_types.is_empty() {
            return records;
        }
        records
            .into_iter()
            .filter(|r| r.span_type().map(|t| span_types.contains(&t)).unwrap_or(false))
            .collect()
    }

    /// The conversation across this trace's LLM calls, in call order (by the
    /// `start` metric; spans without one go last, in store order).
    ///
    /// Input messages repeated by later turns are kept once; output messages are
    /// always appended.
    pub async fn get_thread(&self) -> Vec<Value> {
        let mut spans = self.get_spans(&[LLM_SPAN_TYPE]).await;
        spans.sort_by(|a, b| started_at(a).total_cmp(&started_at(b)));

        let mut seen = HashSet::new();
        let mut thread = Vec::new();
        for span in spans {
            for message in input_messages(span.input.as_ref()) {
                if seen.insert(content_hash(&message)) {
                    thread.push(message);
                }
            }
            for message in output_messages(span.output.as_ref()) {
                seen.insert(content_hash(&message));
                thread.push(message);
            }
        }
        thread
    }

    async fn ensure_flushed(&self) {
        self.flushed
            .get_or_init(|| async {
                if let Some(hook) = &self.flush_hook {
                    hook().await;
                }
            })
            .await;
    }

    async fn fetch(&self) -> Result<Vec<SpanRecord>> {
        self.ensure_flushed().await;

        let query = SpanQuery {
            root_span_id: self.root_span_id.clone(),
            exclude_purpose: Some(SCORER_PURPOSE.to_string()),
            span_types: None,
        };

        let mut backoff = self.config.initial_backoff;
        let mut retries = 0;
        let response = loop {
            let response = self.store.query(&query).await?;
            if response.freshness_state == FreshnessState::Complete || retries >= self.config.max_retries {
                break response;
            }
            debug!(
                root_span_id = %self.root_span_id,
                attempt = retries + 1,
                backoff_ms = backoff.as_millis() as u64,
                "trace not yet complete, retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
            retries += 1;
        };

        if response.freshness_state != FreshnessState::Complete {
            warn!(
                root_span_id = %self.root_span_id,
                spans = response.spans.len(),
                "trace still partial after retries; using what is available"
            );
        }

        for record in &response.spans {
            self.cache.write(&record.root_span_id, &record.span_id, record.clone());
        }
        Ok(response.spans)
    }
}

fn started_at(span: &SpanRecord) -> f64 {
    span.metrics
        .as_ref()
        .and_then(|m| m.get("start"))
        .and_then(Value::as_f64)
        .unwrap_or(f64::INFINITY)
}

fn input_messages(input: Option<&Value>) -> Vec<Value> {
    match input {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(messages)) => messages.clone(),
        Some(Value::Object(obj)) => match obj.get("messages") {
            Some(Value::Array(messages)) => messages.clone(),
            _ => vec![Value::Object(obj.clone())],
        },
        Some(other) => vec![other.clone()],
    }
}

/// Output is typically a list of choices (`[{"message": {...}}, ...]`), a
/// `{"choices": [...]}` object, or the messages themselves.
fn output_messages(output: Option<&Value>) -> Vec<Value> {
    fn unwrap_choice(v: &Value) -> Value {
        v.get("message").cloned().unwrap_or_else(|| v.clone())
    }

    match output {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(unwrap_choice).collect(),
        Some(obj @ Value::Object(map)) => match map.get("choices") {
            Some(Value::Array(choices)) => choices.iter().map(unwrap_choice).collect(),
            _ => vec![unwrap_choice(obj)],
        },
        Some(other) => vec![other.clone()],
    }
}

fn content_hash(message: &Value) -> String {
    let canonical = serde_json::to_vec(message).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::FutureExt;
    use evalflow_types::{Metadata, SpanQueryResponse};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedStore {
        calls: AtomicUsize,
        complete_after: Option<usize>,
        spans: Vec<SpanRecord>,
        fail: bool,
    }

    impl ScriptedStore {
        fn new(spans: Vec<SpanRecord>, complete_after: Option<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                complete_after,
                spans,
                fail: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TraceStore for ScriptedStore {
        async fn query(&self, query: &SpanQuery) -> Result<SpanQueryResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                anyhow::bail!("store unavailable");
            }
            let complete = self.complete_after.map(|k| n >= k).unwrap_or(false);
            Ok(SpanQueryResponse {
                spans: self.spans.iter().filter(|s| query.matches(s)).cloned().collect(),
                freshness_state: if complete {
                    FreshnessState::Complete
                } else {
                    FreshnessState::Partial
                },
            })
        }
    }

    fn span(id: &str, span_type: &str, input: Value, output: Value) -> SpanRecord {
        let mut attrs = Metadata::new();
        attrs.insert("type".into(), json!(span_type));
        SpanRecord {
            span_attributes: Some(attrs),
            input: Some(input),
            output: Some(output),
            ..SpanRecord::new("root", id)
        }
    }

    fn context(store: Arc<ScriptedStore>) -> TraceContext {
        TraceContext::new("root", store, Arc::new(SpanCache::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_complete_then_caches() {
        let store = Arc::new(ScriptedStore::new(vec![span("a", "task", json!(1), json!(2))], Some(3)));
        let ctx = context(store.clone());

        assert_eq!(ctx.get_spans(&[]).await.len(), 1);
        assert_eq!(store.calls(), 3);

        // Served from the cache.
        assert_eq!(ctx.get_spans(&[]).await.len(), 1);
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries_with_partial_result() {
        let store = Arc::new(ScriptedStore::new(vec![span("a", "task", json!(1), json!(2))], None));
        let ctx = context(store.clone());

        let spans = ctx.get_spans(&[]).await;
        assert_eq!(store.calls(), 1 + DEFAULT_MAX_RETRIES as usize);
        assert_eq!(spans.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_from_initial() {
        let store = Arc::new(ScriptedStore::new(Vec::new(), Some(4)));
        let ctx = context(store.clone());
        let started = tokio::time::Instant::now();
        ctx.get_spans(&[]).await;
        // 250 + 500 + 1000 ms
        assert_eq!(started.elapsed(), Duration::from_millis(1750));
    }

    #[tokio::test(start_paused = true)]
    async fn filters_by_span_type_locally() {
        let store = Arc::new(ScriptedStore::new(
            vec![
                span("a", "task", json!(1), json!(2)),
                span("b", "llm", json!([]), json!([])),
            ],
            Some(1),
        ));
        let ctx = context(store);
        let llm = ctx.get_spans(&["llm"]).await;
        assert_eq!(llm.len(), 1);
        assert_eq!(llm[0].span_id, "b");
        assert_eq!(ctx.get_spans(&["task", "llm"]).await.len(), 2);
    }

    #[tokio::test]
    async fn store_failure_yields_empty_result() {
        let store = Arc::new(ScriptedStore {
            fail: true,
            ..ScriptedStore::new(Vec::new(), Some(1))
        });
        let ctx = context(store.clone());
        assert!(ctx.get_spans(&[]).await.is_empty());
        assert!(ctx.get_thread().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn flush_hook_runs_once_across_concurrent_callers() {
        let store = Arc::new(ScriptedStore::new(Vec::new(), Some(1)));
        let flushes = Arc::new(AtomicUsize::new(0));
        let counter = flushes.clone();
        let hook: FlushHook = Arc::new(move || {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        let ctx = context(store).with_flush_hook(hook);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.get_spans(&[]).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }

    /// Logs queries next to flushes so their order can be checked.
    struct EventLog {
        events: Arc<Mutex<Vec<&'static str>>>,
        queries: AtomicUsize,
    }

    #[async_trait]
    impl TraceStore for EventLog {
        async fn query(&self, _query: &SpanQuery) -> Result<SpanQueryResponse> {
            self.events.lock().unwrap().push("query");
            let n = self.queries.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SpanQueryResponse {
                spans: Vec::new(),
                freshness_state: if n >= 2 {
                    FreshnessState::Complete
                } else {
                    FreshnessState::Partial
                },
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flush_hook_runs_before_the_first_query() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::new(EventLog {
            events: events.clone(),
            queries: AtomicUsize::new(0),
        });
        let sink = events.clone();
        let hook: FlushHook = Arc::new(move || {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push("flush");
            }
            .boxed()
        });
        let ctx = TraceContext::new("root", store, Arc::new(SpanCache::default())).with_flush_hook(hook);

        ctx.get_spans(&[]).await;
        assert_eq!(*events.lock().unwrap(), vec!["flush", "query", "query"]);

        // Nothing was cached for an empty trace, so this queries again without flushing.
        ctx.get_spans(&[]).await;
        assert_eq!(*events.lock().unwrap(), vec!["flush", "query", "query", "query"]);
    }

    #[tokio::test]
    async fn thread_follows_call_start_not_store_order() {
        let u1 = json!({"role": "user", "content": "hi"});
        let a1 = json!({"role": "assistant", "content": "hello"});
        let u2 = json!({"role": "user", "content": "bye"});
        let a2 = json!({"role": "assistant", "content": "goodbye"});

        let with_start = |mut record: SpanRecord, start: f64| {
            let mut metrics = Metadata::new();
            metrics.insert("start".into(), json!(start));
            record.metrics = Some(metrics);
            record
        };
        let store = Arc::new(ScriptedStore::new(
            vec![
                with_start(
                    span("t2", "llm", json!([u1, a1, u2]), json!([{"message": a2}])),
                    20.0,
                ),
                with_start(span("t1", "llm", json!([u1]), json!([{"message": a1}])), 10.0),
            ],
            Some(1),
        ));
        let thread = context(store).get_thread().await;
        assert_eq!(thread, vec![u1, a1, u2, a2]);
    }

    #[tokio::test]
    async fn thread_dedupes_repeated_inputs_and_keeps_outputs() {
        let sys = json!({"role": "system", "content": "be brief"});
        let u1 = json!({"role": "user", "content": "hi"});
        let a1 = json!({"role": "assistant", "content": "hello"});
        let u2 = json!({"role": "user", "content": "bye"});
        let a2 = json!({"role": "assistant", "content": "goodbye"});

        let store = Arc::new(ScriptedStore::new(
            vec![
                span("t1", "llm", json!([sys, u1]), json!([{"index": 0, "message": a1}])),
                span("x", "task", json!("ignored"), json!("ignored")),
                span(
                    "t2",
                    "llm",
                    json!({"messages": [sys, u1, a1, u2]}),
                    json!({"choices": [{"message": a2}]}),
                ),
            ],
            Some(1),
        ));
        let thread = context(store).get_thread().await;
        assert_eq!(thread, vec![sys, u1, a1, u2, a2]);
    }
}
