use anyhow::Result;
use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::{json, Value};

use crate::scorer::{Scorer, ScorerArgs};
use evalflow_types::{Score, ScoreOutcome};

/// Scores JSON outputs: against a schema, against the structure of `expected`,
/// or (by default) whether a string output parses as JSON.
pub struct JsonScorer {
	mode: Mode,
}

enum Mode {
	Parse,
	Schema(JSONSchema),
	Structure,
}

impl JsonScorer {
	pub fn new() -> Self {
		Self { mode: Mode::Parse }
	}

	pub fn with_schema(schema: Value) -> Result<Self> {
		let compiled = JSONSchema::compile(&schema)
			.map_err(|e| anyhow::anyhow!("Invalid JSON schema: {}", e))?;
		Ok(Self {
			mode: Mode::Schema(compiled),
		})
	}

	/// Keys and value types must match `expected`; values may differ.
	pub fn structure() -> Self {
		Self { mode: Mode::Structure }
	}
}

impl Default for JsonScorer {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Scorer for JsonScorer {
	fn name(&self) -> Option<&str> {
		Some("json")
	}

	async fn score(&self, args: ScorerArgs) -> Result<ScoreOutcome> {
		// String outputs are treated as serialized JSON.
		let parsed = match &args.output {
			Value::String(s) => match serde_json::from_str::<Value>(s) {
				Ok(v) => v,
				Err(e) => {
					return Ok(Score::new("json", 0.0)
						.with_metadata(json!({ "valid": false, "errors": [e.to_string()] }))
						.into())
				}
			},
			other => other.clone(),
		};

		let (passed, details) = match &self.mode {
			Mode::Parse => (true, json!({ "valid": true })),
			Mode::Schema(schema) => match schema.validate(&parsed) {
				Ok(()) => (true, json!({ "valid": true })),
				Err(errors) => {
					let msgs: Vec<String> = errors.map(|e| format!("{}: {}", e.instance_path, e)).collect();
					(false, json!({ "valid": false, "errors": msgs }))
				}
			},
			Mode::Structure => {
				let matches = compare_structure(args.expected_or_null(), &parsed);
				(matches, json!({ "structures_match": matches }))
			}
		};

		Ok(Score::new("json", if passed { 1.0 } else { 0.0 })
			.with_metadata(details)
			.into())
	}
}

/// Recursively compare JSON structure (keys and types, not values)
fn compare_structure(expected: &Value, actual: &Value) -> bool {
	match (expected, actual) {
		(Value::Object(e), Value::Object(a)) => {
			e.len() == a.len()
				&& e.iter().all(|(key, e_val)| {
					a.get(key).map(|a_val| compare_structure(e_val, a_val)).unwrap_or(false)
				})
		}
		(Value::Array(e), Value::Array(a)) => {
			e.len() == a.len() && e.iter().zip(a.iter()).all(|(x, y)| compare_structure(x, y))
		}
		(Value::String(_), Value::String(_))
		| (Value::Number(_), Value::Number(_))
		| (Value::Bool(_), Value::Bool(_))
		| (Value::Null, Value::Null) => true,
		_ => false,
	}
}
