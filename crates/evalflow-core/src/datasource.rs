use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::error::EvalError;
use evalflow_types::{Case, CaseLike, Metadata};

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn load(&self) -> Result<Vec<CaseLike>>;
}

pub struct VecDataSource {
    cases: Vec<CaseLike>,
}

impl VecDataSource {
    pub fn new<I>(cases: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<CaseLike>,
    {
        Self {
            cases: cases.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl DataSource for VecDataSource {
    async fn load(&self) -> Result<Vec<CaseLike>> {
        Ok(self.cases.clone())
    }
}

/// Read JSONL where each line is one record, e.g.
/// `{"input": ..., "expected": ..., "tags": [...], "metadata": {...}}`.
///
/// Lines are only parsed as JSON here; field validation happens in [`normalize_cases`].
pub struct JsonlDataSource {
    path: PathBuf,
}

impl JsonlDataSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DataSource for JsonlDataSource {
    async fn load(&self) -> Result<Vec<CaseLike>> {
        let content = tokio_fs_read_to_string(&self.path).await?;
        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)
                .with_context(|| format!("Invalid JSON on line {}", idx + 1))?;
            records.push(CaseLike::Record(value));
        }
        Ok(records)
    }
}

#[cfg(not(feature = "sync-fs"))]
async fn tokio_fs_read_to_string(path: &PathBuf) -> Result<String> {
    use tokio::fs;
    fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))
}

#[cfg(feature = "sync-fs")]
async fn tokio_fs_read_to_string(path: &PathBuf) -> Result<String> {
    use std::fs;
    use tokio::task;
    let path_clone = path.clone();
    let content = task::spawn_blocking(move || {
        fs::read_to_string(&path_clone).with_context(|| format!("Failed to read {:?}", path_clone))
    })
    .await
    .map_err(|e| anyhow!(e))??;
    Ok(content)
}

/// Lazily turn case-like items into [`Case`]s.
///
/// Nothing is materialized up front: each item is converted when the iterator is advanced.
pub fn normalize_cases<I>(items: I) -> CaseNormalizer<I::IntoIter>
where
    I: IntoIterator<Item = CaseLike>,
{
    CaseNormalizer {
        items: items.into_iter(),
        index: 0,
    }
}

pub struct CaseNormalizer<I> {
    items: I,
    index: usize,
}

impl<I> Iterator for CaseNormalizer<I>
where
    I: Iterator<Item = CaseLike>,
{
    type Item = Result<Case, EvalError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.items.next()?;
        let index = self.index;
        self.index += 1;
        Some(match item {
            CaseLike::Case(case) => Ok(case),
            CaseLike::Record(record) => case_from_record(index, record),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

fn case_from_record(index: usize, record: Value) -> Result<Case, EvalError> {
    let invalid = |reason: String| EvalError::InvalidCase { index, reason };

    let mut obj = match record {
        Value::Object(obj) => obj,
        other => return Err(invalid(format!("expected an object, got {}", kind(&other)))),
    };

    let input = obj
        .remove("input")
        .ok_or_else(|| invalid("missing 'input'".to_string()))?;
    let expected = take_any(&mut obj, &["expected", "expected_output"]);
    let origin = take_any(&mut obj, &["origin", "_origin"]);

    let tags = match obj.remove("tags") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => Some(
            items
                .into_iter()
                .map(|tag| match tag {
                    Value::String(s) => Ok(s),
                    other => Err(invalid(format!("tags must be strings, got {}", kind(&other)))),
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(other) => return Err(invalid(format!("'tags' must be an array, got {}", kind(&other)))),
    };

    let metadata: Option<Metadata> = match obj.remove("metadata") {
        None | Some(Value::Null) => None,
        Some(Value::Object(m)) => Some(m),
        Some(other) => return Err(invalid(format!("'metadata' must be an object, got {}", kind(&other)))),
    };

    Ok(Case {
        input,
        expected,
        tags,
        metadata,
        origin,
    })
}

/// First non-null value among `keys`; all listed keys are consumed.
fn take_any(obj: &mut Metadata, keys: &[&str]) -> Option<Value> {
    let mut found = None;
    for key in keys {
        match obj.remove(*key) {
            Some(Value::Null) | None => {}
            Some(v) if found.is_none() => found = Some(v),
            Some(_) => {}
        }
    }
    found
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn typed_cases_pass_through() {
        let case = Case::with_expected(json!("q"), json!("a")).tags(["smoke"]);
        let out: Vec<_> = normalize_cases(vec![CaseLike::Case(case.clone())]).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap(), &case);
    }

    #[test]
    fn records_map_recognized_fields() {
        let record = json!({
            "input": {"q": 1},
            "expected_output": "one",
            "tags": ["a", "b"],
            "metadata": {"source": "unit"},
            "_origin": {"dataset": "d1", "id": "r7"},
            "ignored": true
        });
        let case = normalize_cases(vec![CaseLike::Record(record)])
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(case.input, json!({"q": 1}));
        assert_eq!(case.expected, Some(json!("one")));
        assert_eq!(case.tags, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(case.metadata.unwrap()["source"], json!("unit"));
        assert_eq!(case.origin, Some(json!({"dataset": "d1", "id": "r7"})));
    }

    #[test]
    fn missing_input_is_rejected_with_index() {
        let items = vec![
            CaseLike::Record(json!({"input": "ok"})),
            CaseLike::Record(json!({"expected": "no input"})),
        ];
        let results: Vec<_> = normalize_cases(items).collect();
        assert!(results[0].is_ok());
        match &results[1] {
            Err(EvalError::InvalidCase { index, reason }) => {
                assert_eq!(*index, 1);
                assert!(reason.contains("input"));
            }
            other => panic!("expected InvalidCase, got {:?}", other),
        }
    }

    #[test]
    fn non_object_records_are_rejected() {
        let err = normalize_cases(vec![CaseLike::Record(json!("just a string"))])
            .next()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidCase { index: 0, .. }));
    }

    #[test]
    fn normalizer_is_lazy() {
        let mut pulled = 0;
        let source = (0..1_000_000).map(|i| {
            pulled += 1;
            CaseLike::Record(json!({ "input": i }))
        });
        let first_two: Vec<_> = normalize_cases(source).take(2).collect();
        assert_eq!(first_two.len(), 2);
        assert_eq!(pulled, 2);
    }

    #[tokio::test]
    async fn jsonl_source_loads_raw_records() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"input": "a", "expected": "A"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"input": "b"}}"#).unwrap();

        let records = JsonlDataSource::new(file.path()).load().await.unwrap();
        assert_eq!(records.len(), 2);
        let cases: Vec<Case> = normalize_cases(records).collect::<Result<_, _>>().unwrap();
        assert_eq!(cases[0].expected, Some(json!("A")));
        assert_eq!(cases[1].expected, None);
    }
}
