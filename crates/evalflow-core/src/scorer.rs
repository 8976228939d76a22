//! Scorer interface and the adapter that gives every scoring callable the same
//! five-argument shape.
//!
//! A scoring callable may care about `(input, expected, output)`, optionally
//! `metadata`, and optionally the case's [`TraceContext`]. The shape is fixed
//! when the scorer is built ([`scorer_fn3`], [`scorer_fn4`], [`scorer_fn5`], or
//! [`adapt`] for callables that declare their parameters at runtime). The runner
//! only ever sees the canonical [`Scorer::score`] call.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::error::EvalError;
use crate::trace_context::TraceContext;
use evalflow_types::{Metadata, ScoreOutcome};

/// Arguments handed to every scorer invocation.
#[derive(Clone)]
pub struct ScorerArgs {
    pub input: Value,
    pub expected: Option<Value>,
    pub output: Value,
    pub metadata: Option<Metadata>,
    pub trace: Option<TraceContext>,
}

impl ScorerArgs {
    pub fn new(input: Value, expected: Option<Value>, output: Value) -> Self {
        Self {
            input,
            expected,
            output,
            metadata: None,
            trace: None,
        }
    }

    /// `expected`, or `Value::Null` when the case has none.
    pub fn expected_or_null(&self) -> &Value {
        self.expected.as_ref().unwrap_or(&Value::Null)
    }
}

#[async_trait]
pub trait Scorer: Send + Sync {
    /// The scorer's own name. The runner falls back to `scorer_<index>` when `None`.
    fn name(&self) -> Option<&str> {
        None
    }

    async fn score(&self, args: ScorerArgs) -> Result<ScoreOutcome>;
}

pub type ScoreFuture = BoxFuture<'static, Result<ScoreOutcome>>;

type ThreeArgFn = dyn Fn(Value, Option<Value>, Value) -> ScoreFuture + Send + Sync;
type FourArgFn = dyn Fn(Value, Option<Value>, Value, Option<Metadata>) -> ScoreFuture + Send + Sync;
type FiveArgFn =
    dyn Fn(Value, Option<Value>, Value, Option<Metadata>, Option<TraceContext>) -> ScoreFuture + Send + Sync;

/// A scoring callable tagged with the number of parameters it takes.
#[derive(Clone)]
pub enum ScorerFn {
    ThreeArg(Arc<ThreeArgFn>),
    FourArg(Arc<FourArgFn>),
    FiveArg(Arc<FiveArgFn>),
}

impl ScorerFn {
    pub fn arity(&self) -> usize {
        match self {
            ScorerFn::ThreeArg(_) => 3,
            ScorerFn::FourArg(_) => 4,
            ScorerFn::FiveArg(_) => 5,
        }
    }

    fn call(&self, args: ScorerArgs) -> ScoreFuture {
        let ScorerArgs {
            input,
            expected,
            output,
            metadata,
            trace,
        } = args;
        match self {
            ScorerFn::ThreeArg(f) => f(input, expected, output),
            ScorerFn::FourArg(f) => f(input, expected, output, metadata),
            ScorerFn::FiveArg(f) => f(input, expected, output, metadata, trace),
        }
    }
}

/// A scorer backed by a closure.
#[derive(Clone)]
pub struct FnScorer {
    name: Option<String>,
    f: ScorerFn,
}

impl FnScorer {
    pub fn new(f: ScorerFn) -> Self {
        Self { name: None, f }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn arity(&self) -> usize {
        self.f.arity()
    }
}

#[async_trait]
impl Scorer for FnScorer {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn score(&self, args: ScorerArgs) -> Result<ScoreOutcome> {
        self.f.call(args).await
    }
}

/// Scorer over `(input, expected, output)`.
pub fn scorer_fn3<F, Fut>(f: F) -> FnScorer
where
    F: Fn(Value, Option<Value>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ScoreOutcome>> + Send + 'static,
{
    FnScorer::new(ScorerFn::ThreeArg(Arc::new(move |i, e, o| f(i, e, o).boxed())))
}

/// Scorer over `(input, expected, output, metadata)`.
pub fn scorer_fn4<F, Fut>(f: F) -> FnScorer
where
    F: Fn(Value, Option<Value>, Value, Option<Metadata>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ScoreOutcome>> + Send + 'static,
{
    FnScorer::new(ScorerFn::FourArg(Arc::new(move |i, e, o, m| f(i, e, o, m).boxed())))
}

/// Scorer over `(input, expected, output, metadata, trace)`.
pub fn scorer_fn5<F, Fut>(f: F) -> FnScorer
where
    F: Fn(Value, Option<Value>, Value, Option<Metadata>, Option<TraceContext>) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = Result<ScoreOutcome>> + Send + 'static,
{
    FnScorer::new(ScorerFn::FiveArg(Arc::new(move |i, e, o, m, t| {
        f(i, e, o, m, t).boxed()
    })))
}

/// Parameter list a callable declares: `required` positional parameters,
/// `optional` trailing ones, and whether it accepts any number of arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScorerSignature {
    pub required: usize,
    pub optional: usize,
    pub variadic: bool,
}

impl ScorerSignature {
    pub fn fixed(params: usize) -> Self {
        Self {
            required: params,
            optional: 0,
            variadic: false,
        }
    }

    pub fn with_optional(required: usize, optional: usize) -> Self {
        Self {
            required,
            optional,
            variadic: false,
        }
    }

    pub fn variadic(required: usize) -> Self {
        Self {
            required,
            optional: 0,
            variadic: true,
        }
    }

    fn accepts(&self, n: usize) -> bool {
        self.required <= n && (self.variadic || n <= self.required + self.optional)
    }

    /// Widest of 5, 4, 3 arguments this signature can take.
    pub fn resolve(&self) -> Option<usize> {
        [5, 4, 3].into_iter().find(|n| self.accepts(*n))
    }
}

impl fmt::Display for ScorerSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} required", self.required)?;
        if self.optional > 0 {
            write!(f, ", {} optional", self.optional)?;
        }
        if self.variadic {
            f.write_str(", variadic")?;
        }
        Ok(())
    }
}

/// Build a scorer for a callable whose parameter list is only known at runtime.
///
/// The callable always receives a full [`ScorerArgs`]; fields beyond what the
/// signature accepts are cleared before the call. The arity is resolved here,
/// once, and never re-inspected per invocation.
pub fn adapt<F, Fut>(name: impl Into<String>, signature: ScorerSignature, f: F) -> Result<FnScorer, EvalError>
where
    F: Fn(ScorerArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ScoreOutcome>> + Send + 'static,
{
    let name = name.into();
    let f = Arc::new(f);
    let scorer_fn = match signature.resolve() {
        Some(5) => ScorerFn::FiveArg(Arc::new(move |input, expected, output, metadata, trace| {
            f(ScorerArgs {
                input,
                expected,
                output,
                metadata,
                trace,
            })
            .boxed()
        })),
        Some(4) => ScorerFn::FourArg(Arc::new(move |input, expected, output, metadata| {
            f(ScorerArgs {
                metadata,
                ..ScorerArgs::new(input, expected, output)
            })
            .boxed()
        })),
        Some(_) => ScorerFn::ThreeArg(Arc::new(move |input, expected, output| {
            f(ScorerArgs::new(input, expected, output)).boxed()
        })),
        None => {
            return Err(EvalError::UnsupportedScorerArity {
                scorer: name,
                signature,
            })
        }
    };
    Ok(FnScorer::new(scorer_fn).named(name))
}

/// Give any scorer an explicit name, overriding its own.
pub fn named(name: impl Into<String>, scorer: Arc<dyn Scorer>) -> Arc<dyn Scorer> {
    Arc::new(Named {
        name: name.into(),
        inner: scorer,
    })
}

struct Named {
    name: String,
    inner: Arc<dyn Scorer>,
}

#[async_trait]
impl Scorer for Named {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    async fn score(&self, args: ScorerArgs) -> Result<ScoreOutcome> {
        self.inner.score(args).await
    }
}

/// A scorer with its resolved aggregate name.
#[derive(Clone)]
pub struct RegisteredScorer {
    pub name: String,
    pub scorer: Arc<dyn Scorer>,
}

/// Resolve names: the scorer's own name, else `scorer_<index>`.
/// Duplicates are kept as-is and share an aggregate slot.
pub fn register_scorers(scorers: Vec<Arc<dyn Scorer>>) -> Vec<RegisteredScorer> {
    scorers
        .into_iter()
        .enumerate()
        .map(|(idx, scorer)| RegisteredScorer {
            name: scorer
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("scorer_{idx}")),
            scorer,
        })
        .collect()
}
