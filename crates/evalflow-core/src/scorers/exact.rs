use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::scorer::{Scorer, ScorerArgs};
use evalflow_types::{Score, ScoreOutcome};

/// 1.0 when the output equals `expected`, else 0.0. Cases without `expected` score 0.0.
pub struct ExactMatchScorer;

#[async_trait]
impl Scorer for ExactMatchScorer {
	fn name(&self) -> Option<&str> {
		Some("exact_match")
	}

	async fn score(&self, args: ScorerArgs) -> Result<ScoreOutcome> {
		let matched = args.expected.as_ref() == Some(&args.output);
		Ok(Score::new("exact_match", if matched { 1.0 } else { 0.0 })
			.with_metadata(json!({ "has_expected": args.expected.is_some() }))
			.into())
	}
}
