use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::scorer::{Scorer, ScorerArgs};
use evalflow_types::{Score, ScoreOutcome};

/// Checks if output matches a regex pattern.
pub struct RegexScorer {
	pattern: Regex,
}

impl RegexScorer {
	pub fn new(pattern: &str) -> Result<Self> {
		Ok(Self {
			pattern: Regex::new(pattern)?,
		})
	}
}

#[async_trait]
impl Scorer for RegexScorer {
	fn name(&self) -> Option<&str> {
		Some("regex")
	}

	async fn score(&self, args: ScorerArgs) -> Result<ScoreOutcome> {
		let output_str = match &args.output {
			Value::String(s) => s.clone(),
			other => serde_json::to_string(other)?,
		};

		let captures: Option<Vec<String>> = self.pattern.captures(&output_str).map(|caps| {
			caps.iter()
				.flatten()
				.map(|m| m.as_str().to_string())
				.collect()
		});
		let matched = captures.is_some();

		Ok(Score::new("regex", if matched { 1.0 } else { 0.0 })
			.with_metadata(serde_json::json!({
				"pattern": self.pattern.as_str(),
				"captures": captures,
			}))
			.into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	async fn score(pattern: &str, output: &str) -> (f64, Value) {
		let args = ScorerArgs::new(json!(null), None, json!(output));
		match RegexScorer::new(pattern).unwrap().score(args).await.unwrap() {
			ScoreOutcome::Score(s) => (s.score.unwrap(), s.metadata.unwrap()),
			other => panic!("unexpected outcome {other:?}"),
		}
	}

	#[tokio::test]
	async fn test_regex_match() {
		assert_eq!(score(r"capital.*Paris", "The capital of France is Paris").await.0, 1.0);
	}

	#[tokio::test]
	async fn test_regex_no_match() {
		let (value, meta) = score(r"capital.*London", "The capital of France is Paris").await;
		assert_eq!(value, 0.0);
		assert_eq!(meta["captures"], Value::Null);
	}

	#[tokio::test]
	async fn test_regex_with_capture_groups() {
		let (value, meta) = score(r"(\d{4})-(\d{2})-(\d{2})", "Date: 2024-11-12").await;
		assert_eq!(value, 1.0);
		assert_eq!(meta["captures"], json!(["2024-11-12", "2024", "11", "12"]));
	}

	#[test]
	fn test_invalid_pattern_is_rejected() {
		assert!(RegexScorer::new("(unclosed").is_err());
	}
}
