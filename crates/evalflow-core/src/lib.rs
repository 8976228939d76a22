//! evalflow-core: evaluation engine for agents and LLM tasks.
//! Run cases through a task and a set of scorers with bounded parallelism,
//! isolating per-case failures and letting scorers read back their own trace.
//! See `examples/simple.rs` for a quickstart.

pub mod config;
pub mod datasource;
pub mod error;
pub mod pool;
pub mod runner;
pub mod scorer;
pub mod span_cache;
pub mod task;
pub mod testing;
pub mod trace;
pub mod trace_context;
pub mod trace_store;
pub mod tracer;

pub mod scorers {
    pub mod contains;
    pub mod exact;
    pub mod json;
    pub mod levenshtein;
    pub mod regex;
}

pub use config::EvalConfig;
pub use datasource::{normalize_cases, DataSource, JsonlDataSource, VecDataSource};
pub use error::EvalError;
pub use pool::{Strategy, WorkerPool, MAX_PARALLELISM};
pub use runner::{Evaluation, EvaluationBuilder};
pub use scorer::{
    adapt, named, scorer_fn3, scorer_fn4, scorer_fn5, FnScorer, Scorer, ScorerArgs, ScorerFn, ScorerSignature,
};
pub use scorers::{
    contains::ContainsScorer, exact::ExactMatchScorer, json::JsonScorer, levenshtein::LevenshteinScorer,
    regex::RegexScorer,
};
pub use span_cache::SpanCache;
pub use task::{from_async_fn, HttpMethod, HttpTask, IdentityTask, Task};
pub use trace::record_llm_call;
pub use trace_context::{TraceContext, TraceContextConfig};
pub use trace_store::{HttpTraceStore, TraceStore};
pub use tracer::{LogTracer, MemoryTracer, NoopTracer, Span, Tracer};
pub use evalflow_types::{
    Case, CaseLike, EvaluationResult, ExperimentRef, FreshnessState, LlmCall, Metadata, Score, ScoreOutcome,
    ScoreSummary, SpanQuery, SpanQueryResponse, SpanRecord, TokenUsage,
};
