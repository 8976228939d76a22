pub use evalflow_types::{LlmCall, LlmCallBuilder, TokenUsage};

use std::future::Future;

use serde_json::{json, Value};

use crate::tracer::Span;
use evalflow_types::{Metadata, SpanRecord};

tokio::task_local! {
    static CURRENT_SPAN: Span;
}

/// Run a future with `span` as the current span; LLM calls reported from inside
/// it become children of that span.
pub async fn scope_span<F, R>(span: Span, f: F) -> R
where
    F: Future<Output = R>,
{
    CURRENT_SPAN.scope(span, f).await
}

/// The span of the task currently running, if any.
pub fn current_span() -> Option<Span> {
    CURRENT_SPAN.try_with(|span| span.clone()).ok()
}

/// Record an LLM call as an `llm` child of the current span.
///
/// Returns `false` (and records nothing) when called outside a task.
pub fn record_llm_call(call: LlmCall) -> bool {
    let Some(parent) = current_span() else {
        return false;
    };

    let name = call.model.clone().unwrap_or_else(|| "llm".to_string());
    let span = parent.child(&name, "llm");

    let mut metadata = call.metadata.unwrap_or_default();
    if let Some(model) = call.model {
        metadata.insert("model".into(), json!(model));
    }

    let mut metrics = Metadata::new();
    if let Some(ms) = call.duration_ms {
        metrics.insert("duration_ms".into(), json!(ms));
    }
    if let Some(usage) = call.usage {
        metrics.insert("prompt_tokens".into(), json!(usage.input_tokens));
        metrics.insert("completion_tokens".into(), json!(usage.output_tokens));
        metrics.insert("tokens".into(), json!(usage.total_tokens));
    }

    span.log(SpanRecord {
        input: Some(call.input),
        output: match call.output {
            Value::Null => None,
            output => Some(output),
        },
        metadata: (!metadata.is_empty()).then_some(metadata),
        error: call.error,
        ..Default::default()
    });
    span.end_with_metrics(metrics);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::MemoryTracer;
    use std::sync::Arc;

    #[test]
    fn test_llm_call_builder() {
        let call = LlmCall::start_now().model("gpt-4o-mini").finish(
            json!({"messages": [{"role": "user", "content": "Hello"}]}),
            json!({"content": "Hi there!"}),
            Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            }),
        );

        assert_eq!(call.model, Some("gpt-4o-mini".to_string()));
        assert!(call.duration_ms.is_some());
        assert!(call.error.is_none());
    }

    #[test]
    fn outside_a_task_nothing_is_recorded() {
        let call = LlmCall::start_now().finish(json!("in"), json!("out"), None);
        assert!(!record_llm_call(call));
        assert!(current_span().is_none());
    }

    #[tokio::test]
    async fn calls_become_llm_children_of_the_current_span() {
        let tracer = Arc::new(MemoryTracer::new());
        let root = Span::root(tracer.clone(), "eval", "eval", None);
        let task = root.child("task", "task");
        let task_id = task.span_id().to_string();

        scope_span(task, async {
            let ok = LlmCall::start_now().model("claude-3").finish(
                json!([{"role": "user", "content": "hi"}]),
                json!([{"message": {"role": "assistant", "content": "hello"}}]),
                Some(TokenUsage {
                    input_tokens: 3,
                    output_tokens: 2,
                    total_tokens: 5,
                }),
            );
            assert!(record_llm_call(ok));
            let failed = LlmCall::start_now().finish_with_error(json!("again"), "rate limited");
            assert!(record_llm_call(failed));
        })
        .await;

        let llm: Vec<_> = tracer
            .records()
            .into_iter()
            .filter(|r| r.span_type() == Some("llm"))
            .collect();
        assert_eq!(llm.len(), 2);
        assert_eq!(llm[0].parent_span_id.as_deref(), Some(task_id.as_str()));
        assert_eq!(llm[0].metadata.as_ref().unwrap()["model"], json!("claude-3"));
        assert_eq!(llm[0].metrics.as_ref().unwrap()["tokens"], json!(5));
        assert_eq!(llm[1].error.as_deref(), Some("rate limited"));
        assert!(llm[1].output.is_none());
    }
}
