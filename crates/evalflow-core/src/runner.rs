use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::datasource::{normalize_cases, DataSource};
use crate::error::EvalError;
use crate::pool::WorkerPool;
use crate::scorer::{named, register_scorers, RegisteredScorer, Scorer, ScorerArgs};
use crate::span_cache::{SpanCache, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
use crate::task::Task;
use crate::trace;
use crate::trace_context::{FlushHook, TraceContext, TraceContextConfig};
use crate::trace_store::TraceStore;
use crate::tracer::{LogTracer, Span, Tracer, SCORER_PURPOSE};
use evalflow_types::{Case, CaseLike, EvaluationResult, ExperimentRef, Metadata, SpanRecord};

pub struct EvaluationBuilder {
	task: Option<Arc<dyn Task>>,
	scorers: Vec<Arc<dyn Scorer>>,
	parallelism: usize,
	tracer: Arc<dyn Tracer>,
	trace_store: Option<Arc<dyn TraceStore>>,
	trace_config: TraceContextConfig,
	cache_ttl: Duration,
	cache_max_entries: usize,
	parent: Option<String>,
	experiment: Option<ExperimentRef>,
}

impl Default for EvaluationBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl EvaluationBuilder {
	pub fn new() -> Self {
		Self {
			task: None,
			scorers: Vec::new(),
			parallelism: 1,
			tracer: Arc::new(LogTracer),
			trace_store: None,
			trace_config: TraceContextConfig::default(),
			cache_ttl: DEFAULT_TTL,
			cache_max_entries: DEFAULT_MAX_ENTRIES,
			parent: None,
			experiment: None,
		}
	}

	pub fn task(mut self, task: Arc<dyn Task>) -> Self {
		self.task = Some(task);
		self
	}

	pub fn scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
		self.scorers.push(scorer);
		self
	}

	/// Add a scorer under an explicit name, overriding the scorer's own.
	pub fn named_scorer(self, name: impl Into<String>, scorer: Arc<dyn Scorer>) -> Self {
		self.scorer(named(name, scorer))
	}

	pub fn scorers<I>(mut self, scorers: I) -> Self
	where
		I: IntoIterator<Item = Arc<dyn Scorer>>,
	{
		self.scorers.extend(scorers);
		self
	}

	/// Number of cases evaluated at once. Checked in [`build`](Self::build).
	pub fn parallelism(mut self, n: usize) -> Self {
		self.parallelism = n;
		self
	}

	pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
		self.tracer = tracer;
		self
	}

	/// Where scorers read traces back from. Without one, scorers get no `TraceContext`.
	pub fn trace_store(mut self, store: Arc<dyn TraceStore>) -> Self {
		self.trace_store = Some(store);
		self
	}

	pub fn trace_config(mut self, config: TraceContextConfig) -> Self {
		self.trace_config = config;
		self
	}

	pub fn span_cache(mut self, ttl: Duration, max_entries: usize) -> Self {
		self.cache_ttl = ttl;
		self.cache_max_entries = max_entries;
		self
	}

	/// Opaque identifier every case's root span is attached to.
	pub fn parent(mut self, parent: impl Into<String>) -> Self {
		self.parent = Some(parent.into());
		self
	}

	pub fn experiment(mut self, experiment: ExperimentRef) -> Self {
		self.experiment = Some(experiment);
		self
	}

	pub fn build(self) -> Result<Evaluation, EvalError> {
		let task = self.task.ok_or(EvalError::Missing("task"))?;
		let pool = WorkerPool::new(self.parallelism)?;
		Ok(Evaluation {
			task,
			scorers: register_scorers(self.scorers),
			pool,
			tracer: self.tracer,
			trace_store: self.trace_store,
			trace_config: self.trace_config,
			cache_ttl: self.cache_ttl,
			cache_max_entries: self.cache_max_entries,
			parent: self.parent,
			experiment: self.experiment,
		})
	}
}

pub struct Evaluation {
	task: Arc<dyn Task>,
	scorers: Vec<RegisteredScorer>,
	pool: WorkerPool,
	tracer: Arc<dyn Tracer>,
	trace_store: Option<Arc<dyn TraceStore>>,
	trace_config: TraceContextConfig,
	cache_ttl: Duration,
	cache_max_entries: usize,
	parent: Option<String>,
	experiment: Option<ExperimentRef>,
}

impl Evaluation {
	pub fn builder() -> EvaluationBuilder {
		EvaluationBuilder::new()
	}

	pub fn parallelism(&self) -> usize {
		self.pool.parallelism()
	}

	/// Resolved scorer names, in declaration order.
	pub fn scorer_names(&self) -> Vec<&str> {
		self.scorers.iter().map(|s| s.name.as_str()).collect()
	}

	pub async fn run_data_source(&self, source: &dyn DataSource) -> Result<EvaluationResult, EvalError> {
		let cases = source.load().await.map_err(EvalError::DataSource)?;
		self.run(cases).await
	}

	/// Evaluate every case. Task and scorer failures end up in `errors`; only
	/// configuration problems (an invalid case) are returned as `Err`, before
	/// anything runs.
	pub async fn run<I>(&self, cases: I) -> Result<EvaluationResult, EvalError>
	where
		I: IntoIterator,
		I::Item: Into<CaseLike>,
	{
		let cases = normalize_cases(cases.into_iter().map(Into::into)).collect::<Result<Vec<Case>, _>>()?;

		info!(
			cases = cases.len(),
			scorers = self.scorers.len(),
			parallelism = self.pool.parallelism(),
			"starting evaluation"
		);
		let started = Instant::now();

		let run = Arc::new(CaseRunner {
			task: self.task.clone(),
			scorers: self.scorers.clone(),
			tracer: self.tracer.clone(),
			trace_store: self.trace_store.clone(),
			trace_config: self.trace_config,
			cache: Arc::new(SpanCache::new(self.cache_ttl, self.cache_max_entries)),
			parent: self.parent.clone(),
			aggregate: Mutex::new(Aggregate::default()),
		});

		let worker = run.clone();
		self.pool
			.each(cases, move |case| {
				let worker = worker.clone();
				async move {
					worker.run_case(case).await;
					Ok(())
				}
			})
			.await
			.map_err(EvalError::Pool)?;

		if let Err(err) = self.tracer.flush().await {
			warn!(error = %format!("{err:#}"), "tracer flush failed");
		}

		let aggregate = std::mem::take(&mut *run.aggregate.lock().unwrap_or_else(PoisonError::into_inner));
		let duration = started.elapsed().as_secs_f64();
		info!(duration_secs = duration, errors = aggregate.errors.len(), "evaluation finished");

		Ok(EvaluationResult {
			errors: aggregate.errors,
			scores: aggregate.scores.into_iter().collect(),
			duration,
			experiment: self.experiment.clone(),
		})
	}
}

#[derive(Default)]
struct Aggregate {
	errors: Vec<String>,
	scores: std::collections::HashMap<String, Vec<f64>>,
}

/// Everything one run shares across its workers.
struct CaseRunner {
	task: Arc<dyn Task>,
	scorers: Vec<RegisteredScorer>,
	tracer: Arc<dyn Tracer>,
	trace_store: Option<Arc<dyn TraceStore>>,
	trace_config: TraceContextConfig,
	cache: Arc<SpanCache>,
	parent: Option<String>,
	aggregate: Mutex<Aggregate>,
}

impl CaseRunner {
	async fn run_case(&self, case: Case) {
		let root = Span::root(self.tracer.clone(), "eval", "eval", self.parent.as_deref());
		root.log(SpanRecord {
			input: Some(case.input.clone()),
			expected: case.expected.clone(),
			tags: case.tags.clone(),
			metadata: case.metadata.clone(),
			origin: case.origin.clone(),
			..Default::default()
		});

		let output = match self.run_task(&root, &case).await {
			Ok(output) => output,
			Err(err) => {
				let message = format!("Task failed for input '{}': {err:#}", preview(&case.input));
				debug!(root_span_id = root.root_span_id(), error = %message, "task failed; skipping scorers");
				root.log_error(message.clone());
				root.end();
				self.record(Vec::new(), Some(message));
				return;
			}
		};
		root.log(SpanRecord {
			output: Some(output.clone()),
			..Default::default()
		});

		let scored = self.run_scorers(&root, &case, &output).await;
		if let Some(first) = &scored.first_error {
			root.log_error(first.clone());
		}
		if !scored.span_scores.is_empty() {
			root.log(SpanRecord {
				scores: Some(scored.span_scores),
				..Default::default()
			});
		}
		root.end();

		debug!(
			root_span_id = root.root_span_id(),
			scores = scored.numeric.len(),
			failed = scored.first_error.is_some(),
			"case finished"
		);
		self.record(scored.numeric, scored.first_error);
	}

	async fn run_task(&self, root: &Span, case: &Case) -> Result<Value> {
		let span = root.child("task", "task");
		span.log(SpanRecord {
			input: Some(case.input.clone()),
			..Default::default()
		});

		let result = trace::scope_span(span.clone(), guarded(self.task.run(&case.input))).await;
		match &result {
			Ok(output) => span.log(SpanRecord {
				output: Some(output.clone()),
				..Default::default()
			}),
			Err(err) => span.log_error(format!("{err:#}")),
		}
		span.end();
		result
	}

	async fn run_scorers(&self, root: &Span, case: &Case, output: &Value) -> Scored {
		let span = root.child_with_purpose("score", "score", SCORER_PURPOSE);
		let trace = self.trace_store.as_ref().map(|store| {
			TraceContext::new(root.root_span_id(), store.clone(), self.cache.clone())
				.with_config(self.trace_config)
				.with_flush_hook(self.flush_hook())
		});

		let mut scored = Scored::default();
		let mut outputs = Metadata::new();
		let mut scorer_errors = Metadata::new();

		for registered in &self.scorers {
			let args = ScorerArgs {
				input: case.input.clone(),
				expected: case.expected.clone(),
				output: output.clone(),
				metadata: case.metadata.clone(),
				trace: trace.clone(),
			};
			match guarded(registered.scorer.score(args)).await {
				Ok(outcome) => {
					for (name, value) in outcome.numeric_scores(&registered.name) {
						scored.span_scores.insert(name.clone(), json!(value));
						scored.numeric.push((name, value));
					}
					outputs.insert(registered.name.clone(), outcome.to_value());
				}
				Err(err) => {
					let message = format!("{err:#}");
					debug!(scorer = %registered.name, error = %message, "scorer failed");
					scorer_errors.insert(registered.name.clone(), json!(message));
					scored.first_error.get_or_insert_with(|| {
						format!(
							"Scorer '{}' failed for input '{}': {message}",
							registered.name,
							preview(&case.input)
						)
					});
				}
			}
		}

		let mut metadata = Metadata::new();
		if !scorer_errors.is_empty() {
			metadata.insert("scorer_errors".into(), Value::Object(scorer_errors));
		}
		span.log(SpanRecord {
			output: Some(Value::Object(outputs)),
			scores: (!scored.span_scores.is_empty()).then(|| scored.span_scores.clone()),
			metadata: (!metadata.is_empty()).then_some(metadata),
			error: scored.first_error.clone(),
			..Default::default()
		});
		span.end();
		scored
	}

	fn flush_hook(&self) -> FlushHook {
		let tracer = self.tracer.clone();
		Arc::new(move || {
			let tracer = tracer.clone();
			async move {
				if let Err(err) = tracer.flush().await {
					warn!(error = %format!("{err:#}"), "tracer flush before trace query failed");
				}
			}
			.boxed()
		})
	}

	/// Append one case's results. The lock is held for the appends only.
	fn record(&self, numeric: Vec<(String, f64)>, error: Option<String>) {
		let mut aggregate = self.aggregate.lock().unwrap_or_else(PoisonError::into_inner);
		for (name, value) in numeric {
			aggregate.scores.entry(name).or_default().push(value);
		}
		if let Some(error) = error {
			aggregate.errors.push(error);
		}
	}
}

#[derive(Default)]
struct Scored {
	numeric: Vec<(String, f64)>,
	span_scores: Metadata,
	first_error: Option<String>,
}

/// Turn a panic inside user code into an error for that case.
async fn guarded<T, F>(fut: F) -> Result<T>
where
	F: Future<Output = Result<T>>,
{
	match AssertUnwindSafe(fut).catch_unwind().await {
		Ok(result) => result,
		Err(payload) => Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"unknown panic".to_string()
	}
}

/// Inputs are shown raw when they are strings, as JSON otherwise.
fn preview(input: &Value) -> String {
	match input {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::scorer::scorer_fn3;
	use crate::task::{from_async_fn, IdentityTask};
	use crate::tracer::MemoryTracer;
	use evalflow_types::{Score, ScoreOutcome};

	fn identity_eval() -> EvaluationBuilder {
		Evaluation::builder().task(Arc::new(IdentityTask)).tracer(Arc::new(crate::tracer::NoopTracer))
	}

	#[test]
	fn build_requires_task() {
		assert!(matches!(Evaluation::builder().build(), Err(EvalError::Missing("task"))));
	}

	#[test]
	fn build_validates_parallelism() {
		assert!(matches!(
			identity_eval().parallelism(0).build(),
			Err(EvalError::InvalidParallelism { value: 0, .. })
		));
		assert_eq!(identity_eval().build().unwrap().parallelism(), 1);
	}

	#[test]
	fn unnamed_scorers_get_positional_names() {
		let eval = identity_eval()
			.scorer(Arc::new(scorer_fn3(|_, _, _| async { Ok(ScoreOutcome::Value(1.0)) })))
			.named_scorer("second", Arc::new(scorer_fn3(|_, _, _| async { Ok(ScoreOutcome::Value(1.0)) })))
			.build()
			.unwrap();
		assert_eq!(eval.scorer_names(), vec!["scorer_0", "second"]);
	}

	#[tokio::test]
	async fn invalid_case_fails_before_anything_runs() {
		let tracer = Arc::new(MemoryTracer::new());
		let eval = identity_eval().tracer(tracer.clone()).build().unwrap();
		let err = eval
			.run(vec![json!({"input": 1}), json!({"expected": 2})])
			.await
			.unwrap_err();
		assert!(matches!(err, EvalError::InvalidCase { index: 1, .. }));
		assert!(tracer.records().is_empty());
	}

	#[tokio::test]
	async fn task_failure_message_names_the_input() {
		let eval = Evaluation::builder()
			.task(from_async_fn(|_input: &Value| async { Err::<Value, _>(anyhow!("kaput")) }))
			.tracer(Arc::new(crate::tracer::NoopTracer))
			.build()
			.unwrap();
		let result = eval.run(vec![Case::new(json!("abc"))]).await.unwrap();
		assert_eq!(result.errors, vec!["Task failed for input 'abc': kaput".to_string()]);
	}

	#[tokio::test]
	async fn panicking_task_is_isolated() {
		let eval = Evaluation::builder()
			.task(from_async_fn(|input: &Value| {
				let input = input.clone();
				async move {
					if input == json!(2) {
						panic!("bad input");
					}
					Ok(input)
				}
			}))
			.scorer(Arc::new(scorer_fn3(|_, _, _| async { Ok(ScoreOutcome::Value(1.0)) }).named("one")))
			.tracer(Arc::new(crate::tracer::NoopTracer))
			.build()
			.unwrap();
		let result = eval.run(vec![Case::new(json!(1)), Case::new(json!(2))]).await.unwrap();
		assert_eq!(result.errors.len(), 1);
		assert!(result.errors[0].contains("bad input"));
		assert_eq!(result.scores["one"], vec![1.0]);
	}

	#[tokio::test]
	async fn non_numeric_outcomes_are_not_aggregated() {
		let tracer = Arc::new(MemoryTracer::new());
		let eval = identity_eval()
			.tracer(tracer.clone())
			.named_scorer(
				"label",
				Arc::new(scorer_fn3(|_, _, _| async { Ok(ScoreOutcome::Unscored(json!("meh"))) })),
			)
			.named_scorer(
				"multi",
				Arc::new(scorer_fn3(|_, _, _| async {
					Ok(ScoreOutcome::Scores(vec![
						Score::new("precision", 0.5),
						Score::new("recall", 1.0),
					]))
				})),
			)
			.build()
			.unwrap();
		let result = eval.run(vec![Case::new(json!("q"))]).await.unwrap();
		assert!(result.errors.is_empty());
		assert!(!result.scores.contains_key("label"));
		assert_eq!(result.scores["precision"], vec![0.5]);
		assert_eq!(result.scores["recall"], vec![1.0]);

		let score_span = tracer
			.records()
			.into_iter()
			.find(|r| r.purpose() == Some(SCORER_PURPOSE))
			.unwrap();
		let output = score_span.output.unwrap();
		assert_eq!(output["label"], json!("meh"));
		assert!(!score_span.scores.unwrap().contains_key("label"));
	}

	#[tokio::test]
	async fn spans_nest_under_the_case_and_carry_case_fields() {
		let tracer = Arc::new(MemoryTracer::new());
		let eval = Evaluation::builder()
			.task(Arc::new(IdentityTask))
			.named_scorer("one", Arc::new(scorer_fn3(|_, _, _| async { Ok(ScoreOutcome::Value(1.0)) })))
			.tracer(tracer.clone())
			.parent("experiment:abc")
			.build()
			.unwrap();
		let case = Case::with_expected(json!("in"), json!("in"))
			.tags(["smoke"])
			.origin(json!({"dataset": "d1", "id": "r1"}));
		eval.run(vec![case]).await.unwrap();

		let records = tracer.records();
		assert_eq!(records.len(), 3);
		let root = &records[0];
		assert_eq!(root.span_type(), Some("eval"));
		assert_eq!(root.span_attributes.as_ref().unwrap()["parent"], json!("experiment:abc"));
		assert_eq!(root.tags, Some(vec!["smoke".to_string()]));
		assert_eq!(root.origin, Some(json!({"dataset": "d1", "id": "r1"})));
		assert_eq!(root.output, Some(json!("in")));
		assert_eq!(root.scores.as_ref().unwrap()["one"], json!(1.0));

		for child in &records[1..] {
			assert_eq!(child.root_span_id, root.root_span_id);
			assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
		}
		assert_eq!(records[1].span_type(), Some("task"));
		assert_eq!(records[2].purpose(), Some(SCORER_PURPOSE));
	}

	#[tokio::test]
	async fn every_scorer_error_is_on_the_score_span() {
		let tracer = Arc::new(MemoryTracer::new());
		let eval = Evaluation::builder()
			.task(Arc::new(IdentityTask))
			.named_scorer("a", Arc::new(scorer_fn3(|_, _, _| async { Err::<ScoreOutcome, _>(anyhow!("first")) })))
			.named_scorer("b", Arc::new(scorer_fn3(|_, _, _| async { Err::<ScoreOutcome, _>(anyhow!("second")) })))
			.tracer(tracer.clone())
			.build()
			.unwrap();
		let result = eval.run(vec![Case::new(json!("x"))]).await.unwrap();
		assert_eq!(result.errors, vec!["Scorer 'a' failed for input 'x': first".to_string()]);

		let score_span = tracer
			.records()
			.into_iter()
			.find(|r| r.purpose() == Some(SCORER_PURPOSE))
			.unwrap();
		let errors = &score_span.metadata.unwrap()["scorer_errors"];
		assert_eq!(errors["a"], json!("first"));
		assert_eq!(errors["b"], json!("second"));
	}
}
