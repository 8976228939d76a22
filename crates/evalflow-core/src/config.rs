use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::datasource::JsonlDataSource;
use crate::runner::EvaluationBuilder;
use crate::scorer::Scorer;
use crate::scorers::{
    contains::ContainsScorer, exact::ExactMatchScorer, json::JsonScorer, levenshtein::LevenshteinScorer,
    regex::RegexScorer,
};
use crate::span_cache::{DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
use crate::task::{from_async_fn, HttpMethod, HttpTask, IdentityTask, Task};
use crate::trace_context::{TraceContextConfig, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_RETRIES};
use crate::trace_store::HttpTraceStore;
use evalflow_types::ExperimentRef;

/// An evaluation described in a YAML or JSON file.
///
/// ```yaml
/// data:
///   path: cases.jsonl
/// task:
///   type: http
///   url: http://localhost:8080/agent
/// scorers:
///   - type: exact
///   - type: levenshtein
///     threshold: 0.8
/// parallelism: 4
/// trace:
///   url: http://localhost:8080/spans
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub data: Option<DataConfig>,
    #[serde(default)]
    pub scorers: Vec<ScorerConfig>,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub experiment: Option<ExperimentRef>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub trace: TraceConfig,
}

fn default_parallelism() -> usize {
    1
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::default(),
            data: None,
            scorers: Vec::new(),
            parallelism: default_parallelism(),
            experiment: None,
            parent: None,
            trace: TraceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum TaskConfig {
    /// Appends " World!" to string inputs.
    Echo,
    /// Returns the input unchanged.
    #[default]
    Identity,
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
    },
}

fn default_http_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ScorerConfig {
    Exact,
    Levenshtein {
        threshold: f64,
    },
    Contains {
        substring: String,
        #[serde(default = "default_true")]
        case_sensitive: bool,
    },
    Regex {
        pattern: String,
    },
    Json,
    JsonStructure,
    JsonSchema {
        path: PathBuf,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Trace query endpoint. Scorers get no trace access without it.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF.as_millis() as u64
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_TTL.as_secs()
}

fn default_cache_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

impl TraceConfig {
    pub fn context_config(&self) -> TraceContextConfig {
        TraceContextConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
        }
    }
}

impl EvalConfig {
    /// Load from `.yaml`/`.yml` or `.json`; anything else is read as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            serde_json::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
        } else {
            Self::from_yaml_str(&content).with_context(|| format!("parsing config {}", path.display()))
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn data_source(&self) -> Option<JsonlDataSource> {
        self.data.as_ref().map(|d| JsonlDataSource::new(&d.path))
    }

    /// Everything from the config except the cases. Scorer construction may read
    /// files (JSON schemas).
    pub async fn builder(&self) -> Result<EvaluationBuilder> {
        let mut builder = EvaluationBuilder::new()
            .task(self.task.build())
            .scorers(build_scorers(&self.scorers).await?)
            .parallelism(self.parallelism)
            .trace_config(self.trace.context_config())
            .span_cache(
                Duration::from_secs(self.trace.cache_ttl_secs),
                self.trace.cache_max_entries,
            );
        if let Some(url) = &self.trace.url {
            builder = builder.trace_store(Arc::new(HttpTraceStore::new(url.clone())));
        }
        if let Some(parent) = &self.parent {
            builder = builder.parent(parent.clone());
        }
        if let Some(experiment) = &self.experiment {
            builder = builder.experiment(experiment.clone());
        }
        Ok(builder)
    }
}

impl TaskConfig {
    pub fn build(&self) -> Arc<dyn Task> {
        match self {
            TaskConfig::Echo => from_async_fn(|input: &Value| {
                let s = input.as_str().unwrap_or_default().to_string();
                async move { Ok(json!(format!("{s} World!"))) }
            }),
            TaskConfig::Identity => Arc::new(IdentityTask),
            TaskConfig::Http { url, method } => Arc::new(HttpTask::new(url.clone(), HttpMethod::parse(method))),
        }
    }
}

impl ScorerConfig {
    pub async fn build(&self) -> Result<Arc<dyn Scorer>> {
        let scorer: Arc<dyn Scorer> = match self {
            ScorerConfig::Exact => Arc::new(ExactMatchScorer),
            ScorerConfig::Levenshtein { threshold } => Arc::new(LevenshteinScorer::new(*threshold)),
            ScorerConfig::Contains {
                substring,
                case_sensitive: true,
            } => Arc::new(ContainsScorer::new(substring.clone())),
            ScorerConfig::Contains { substring, .. } => Arc::new(ContainsScorer::case_insensitive(substring.clone())),
            ScorerConfig::Regex { pattern } => Arc::new(RegexScorer::new(pattern)?),
            ScorerConfig::Json => Arc::new(JsonScorer::new()),
            ScorerConfig::JsonStructure => Arc::new(JsonScorer::structure()),
            ScorerConfig::JsonSchema { path } => {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading JSON schema {}", path.display()))?;
                let schema: Value = serde_json::from_str(&content)
                    .with_context(|| format!("parsing JSON schema {}", path.display()))?;
                Arc::new(JsonScorer::with_schema(schema)?)
            }
        };
        Ok(scorer)
    }
}

pub async fn build_scorers(configs: &[ScorerConfig]) -> Result<Vec<Arc<dyn Scorer>>> {
    let mut scorers = Vec::with_capacity(configs.len());
    for config in configs {
        scorers.push(config.build().await?);
    }
    Ok(scorers)
}
