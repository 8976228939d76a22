use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tabled::Tabled;

/// Free-form key/value metadata attached to cases and spans.
pub type Metadata = Map<String, Value>;

/// A single test case. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Opaque provenance token supplied by the data source (e.g. a dataset record reference).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Value>,
}

impl Case {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            expected: None,
            tags: None,
            metadata: None,
            origin: None,
        }
    }

    pub fn with_expected(input: Value, expected: Value) -> Self {
        Self {
            expected: Some(expected),
            ..Self::new(input)
        }
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn origin(mut self, origin: Value) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Anything a caller can hand to the runner as a case: a typed `Case` or a raw record.
#[derive(Debug, Clone)]
pub enum CaseLike {
    Case(Case),
    Record(Value),
}

impl From<Case> for CaseLike {
    fn from(case: Case) -> Self {
        CaseLike::Case(case)
    }
}

impl From<Value> for CaseLike {
    fn from(record: Value) -> Self {
        CaseLike::Record(record)
    }
}

/// A named score. `score` is `None` when the scorer produced no numeric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub name: String,
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Score {
    pub fn new(name: impl Into<String>, score: f64) -> Self {
        Self {
            name: name.into(),
            score: Some(score),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// What a scorer returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreOutcome {
    /// A bare number, recorded under the scorer's name.
    Value(f64),
    /// A structured score, recorded under its own name.
    Score(Score),
    /// Several scores from one scorer, each recorded under its own name.
    Scores(Vec<Score>),
    /// Anything non-numeric. Logged on the span, never aggregated.
    Unscored(Value),
}

impl ScoreOutcome {
    /// Numeric values this outcome contributes to the aggregate, paired with the slot name.
    pub fn numeric_scores(&self, scorer_name: &str) -> Vec<(String, f64)> {
        match self {
            ScoreOutcome::Value(v) => vec![(scorer_name.to_string(), *v)],
            ScoreOutcome::Score(s) => s.score.map(|v| (s.name.clone(), v)).into_iter().collect(),
            ScoreOutcome::Scores(scores) => scores
                .iter()
                .filter_map(|s| s.score.map(|v| (s.name.clone(), v)))
                .collect(),
            ScoreOutcome::Unscored(_) => Vec::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<f64> for ScoreOutcome {
    fn from(v: f64) -> Self {
        ScoreOutcome::Value(v)
    }
}

impl From<Score> for ScoreOutcome {
    fn from(s: Score) -> Self {
        ScoreOutcome::Score(s)
    }
}

/// Identifies the experiment a run was logged under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// One entry per failed case.
    pub errors: Vec<String>,
    /// Numeric scores by scorer (or score) name.
    pub scores: BTreeMap<String, Vec<f64>>,
    /// Wall-clock duration in seconds.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<ExperimentRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Tabled)]
struct SummaryRow {
    scorer: String,
    count: usize,
    mean: String,
    min: String,
    max: String,
}

impl EvaluationResult {
    pub fn summary(&self) -> Vec<ScoreSummary> {
        self.scores
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| {
                let count = values.len();
                let sum: f64 = values.iter().sum();
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                ScoreSummary {
                    name: name.clone(),
                    count,
                    mean: sum / count as f64,
                    min,
                    max,
                }
            })
            .collect()
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        let values = self.scores.get(name)?;
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    pub fn summary_table(&self) -> String {
        use tabled::Table;
        let rows: Vec<SummaryRow> = self
            .summary()
            .into_iter()
            .map(|s| SummaryRow {
                scorer: s.name,
                count: s.count,
                mean: format!("{:.3}", s.mean),
                min: format!("{:.3}", s.min),
                max: format!("{:.3}", s.max),
            })
            .collect();
        let table = Table::new(rows).to_string();

        let mut out = format!(
            "{}\n\nDuration: {:.2}s  Errors: {}\n",
            table,
            self.duration,
            self.errors.len()
        );
        for err in &self.errors {
            out.push_str("  - ");
            out.push_str(&truncate(err, 160));
            out.push('\n');
        }
        out
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut truncated = s.chars().take(max_len.saturating_sub(1)).collect::<String>();
    truncated.push('…');
    truncated
}

/// One span's data as recorded by a tracer or returned by a trace store.
///
/// Every field except the key is optional so that partial writes can be merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub root_span_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_attributes: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metadata>,
}

impl SpanRecord {
    pub fn new(root_span_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            root_span_id: root_span_id.into(),
            span_id: span_id.into(),
            ..Default::default()
        }
    }

    /// Overlay `other`'s present fields onto `self`. `None` never overwrites.
    pub fn merge(&mut self, other: SpanRecord) {
        overlay(&mut self.parent_span_id, other.parent_span_id);
        overlay(&mut self.name, other.name);
        overlay(&mut self.input, other.input);
        overlay(&mut self.output, other.output);
        overlay(&mut self.expected, other.expected);
        overlay(&mut self.tags, other.tags);
        overlay(&mut self.metadata, other.metadata);
        overlay(&mut self.origin, other.origin);
        overlay(&mut self.span_attributes, other.span_attributes);
        overlay(&mut self.error, other.error);
        overlay(&mut self.scores, other.scores);
        overlay(&mut self.metrics, other.metrics);
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.span_attributes.as_ref()?.get(key)?.as_str()
    }

    /// `span_attributes.type`, e.g. `"task"`, `"score"`, `"llm"`.
    pub fn span_type(&self) -> Option<&str> {
        self.attribute("type")
    }

    /// `span_attributes.purpose`; scorer spans carry `"scorer"`.
    pub fn purpose(&self) -> Option<&str> {
        self.attribute("purpose")
    }
}

fn overlay<T>(slot: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *slot = incoming;
    }
}

/// Query sent to a trace store for the spans of one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanQuery {
    pub root_span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_types: Option<Vec<String>>,
}

impl SpanQuery {
    pub fn matches(&self, record: &SpanRecord) -> bool {
        if record.root_span_id != self.root_span_id {
            return false;
        }
        if let Some(excluded) = &self.exclude_purpose {
            if record.purpose() == Some(excluded.as_str()) {
                return false;
            }
        }
        match &self.span_types {
            Some(types) => record
                .span_type()
                .map(|t| types.iter().any(|wanted| wanted == t))
                .unwrap_or(false),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessState {
    Complete,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanQueryResponse {
    pub spans: Vec<SpanRecord>,
    pub freshness_state: FreshnessState,
}

/// A single LLM call made from inside a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    pub start: SystemTime,
    pub end: SystemTime,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Model name (e.g., "gpt-4o-mini")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Messages sent to the model
    pub input: Value,

    /// Messages or choices returned by the model
    pub output: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl LlmCall {
    pub fn start_now() -> LlmCallBuilder {
        LlmCallBuilder {
            start: SystemTime::now(),
            model: None,
            metadata: None,
        }
    }
}

pub struct LlmCallBuilder {
    start: SystemTime,
    model: Option<String>,
    metadata: Option<Metadata>,
}

impl LlmCallBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn finish(self, input: Value, output: Value, usage: Option<TokenUsage>) -> LlmCall {
        self.build(input, output, usage, None)
    }

    pub fn finish_with_error(self, input: Value, error: impl Into<String>) -> LlmCall {
        self.build(input, Value::Null, None, Some(error.into()))
    }

    fn build(self, input: Value, output: Value, usage: Option<TokenUsage>, error: Option<String>) -> LlmCall {
        let end = SystemTime::now();
        let duration_ms = end
            .duration_since(self.start)
            .ok()
            .map(|d| d.as_millis() as u64);

        LlmCall {
            start: self.start,
            end,
            duration_ms,
            model: self.model,
            input,
            output,
            usage,
            metadata: self.metadata,
            error,
        }
    }
}
