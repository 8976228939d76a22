use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use evalflow_core::config::{DataConfig, ScorerConfig, TaskConfig};
use evalflow_core::EvalConfig;
use evalflow_store::Store;
use serde_json::json;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "evalflow", about = "Run agent and LLM evaluations")]
struct Cli {
	/// Log line format (stderr)
	#[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
	log_format: LogFormat,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
	Text,
	Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Run an evaluation
	Run(RunArgs),
	/// Print a saved evaluation
	Show(ShowArgs),
}

#[derive(Debug, Clone, Parser)]
struct RunArgs {
	/// YAML or JSON evaluation config; flags below override it
	#[arg(long)]
	config: Option<PathBuf>,

	/// JSONL file containing lines with fields: { "input": any, "expected"?: any, "tags"?: [..], "metadata"?: {..} }
	#[arg(long)]
	data: Option<PathBuf>,

	/// Cases evaluated at once (1..=50)
	#[arg(long)]
	parallelism: Option<usize>,

	/// Use exact-match scorer
	#[arg(long, action = ArgAction::SetTrue)]
	exact: bool,

	/// Use Levenshtein scorer with given min similarity (0.0..=1.0)
	#[arg(long)]
	levenshtein: Option<f64>,

	/// Check if output contains substring (case-sensitive)
	#[arg(long)]
	contains: Option<String>,

	/// Check if output contains substring (case-insensitive)
	#[arg(long)]
	contains_i: Option<String>,

	/// Validate output matches regex pattern
	#[arg(long)]
	regex: Option<String>,

	/// Validate output is valid JSON
	#[arg(long, action = ArgAction::SetTrue)]
	json: bool,

	/// Validate output JSON against a schema file
	#[arg(long)]
	json_schema: Option<PathBuf>,

	/// HTTP task endpoint (POST by default). Sends { "input": <value> } and expects JSON response.
	#[arg(long)]
	http_url: Option<String>,

	/// HTTP method for --http-url (GET or POST)
	#[arg(long, default_value = "POST")]
	http_method: String,

	/// Trace query endpoint; gives scorers access to their case's trace
	#[arg(long, env = "EVALFLOW_TRACE_URL")]
	trace_url: Option<String>,

	/// Output JSON result to a file
	#[arg(long)]
	json_out: Option<PathBuf>,

	/// Save the result into this SQLite database
	#[arg(long, env = "EVALFLOW_DB")]
	db: Option<PathBuf>,

	/// Name the evaluation is saved under
	#[arg(long, default_value = "eval")]
	name: String,
}

#[derive(Debug, Clone, Parser)]
struct ShowArgs {
	#[arg(long, env = "EVALFLOW_DB")]
	db: PathBuf,

	/// Evaluation id printed by `run --db`
	#[arg(long)]
	eval_id: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	init_tracing(cli.log_format);
	match cli.command {
		Commands::Run(args) => run(args).await?,
		Commands::Show(args) => show(args)?,
	}
	Ok(())
}

/// `EVALFLOW_LOG` takes `RUST_LOG`-style directives; defaults to `info`.
fn init_tracing(format: LogFormat) {
	let env_filter = EnvFilter::try_from_env("EVALFLOW_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(env_filter);
	match format {
		LogFormat::Json => registry
			.with(fmt::layer().with_writer(std::io::stderr).json())
			.try_init()
			.ok(),
		LogFormat::Text => registry
			.with(fmt::layer().with_writer(std::io::stderr))
			.try_init()
			.ok(),
	};
}

fn apply_overrides(config: &mut EvalConfig, args: &RunArgs) {
	if let Some(path) = &args.data {
		config.data = Some(DataConfig { path: path.clone() });
	}
	if let Some(n) = args.parallelism {
		config.parallelism = n;
	}
	if let Some(url) = &args.http_url {
		config.task = TaskConfig::Http {
			url: url.clone(),
			method: args.http_method.to_uppercase(),
		};
	}
	if let Some(url) = &args.trace_url {
		config.trace.url = Some(url.clone());
	}

	if args.exact {
		config.scorers.push(ScorerConfig::Exact);
	}
	if let Some(threshold) = args.levenshtein {
		config.scorers.push(ScorerConfig::Levenshtein { threshold });
	}
	if let Some(substring) = &args.contains {
		config.scorers.push(ScorerConfig::Contains {
			substring: substring.clone(),
			case_sensitive: true,
		});
	}
	if let Some(substring) = &args.contains_i {
		config.scorers.push(ScorerConfig::Contains {
			substring: substring.clone(),
			case_sensitive: false,
		});
	}
	if let Some(pattern) = &args.regex {
		config.scorers.push(ScorerConfig::Regex { pattern: pattern.clone() });
	}
	if args.json {
		config.scorers.push(ScorerConfig::Json);
	}
	if let Some(path) = &args.json_schema {
		config.scorers.push(ScorerConfig::JsonSchema { path: path.clone() });
	}

	// Default to exact if no scorers specified
	if config.scorers.is_empty() {
		config.scorers.push(ScorerConfig::Exact);
	}
}

async fn run(args: RunArgs) -> Result<()> {
	let mut config = match &args.config {
		Some(path) => EvalConfig::from_path(path)?,
		None => EvalConfig::default(),
	};
	apply_overrides(&mut config, &args);

	let data = config
		.data_source()
		.context("no cases to run: pass --data or set data.path in the config")?;
	let eval = config.builder().await?.build()?;

	let result = eval.run_data_source(&data).await?;
	println!("{}", result.summary_table());

	if let Some(path) = &args.json_out {
		let json = serde_json::to_string_pretty(&result)?;
		tokio::fs::write(path, json)
			.await
			.with_context(|| format!("writing {}", path.display()))?;
	}

	if let Some(db) = &args.db {
		let store = Store::open(db).with_context(|| format!("opening {}", db.display()))?;
		let run_id = store.create_run(Some(json!({
			"config": args.config.as_ref().map(|p| p.display().to_string()),
			"parallelism": config.parallelism,
		})))?;
		let eval_id = store.save_evaluation(run_id, &args.name, &result)?;
		info!(run_id, eval_id, db = %db.display(), "saved evaluation");
		println!("saved evaluation {eval_id} (run {run_id})");
	}

	Ok(())
}

fn show(args: ShowArgs) -> Result<()> {
	let store = Store::open(&args.db).with_context(|| format!("opening {}", args.db.display()))?;
	let result = store.load_evaluation(args.eval_id)?;
	println!("{}", result.summary_table());
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(args: &[&str]) -> RunArgs {
		let cli = Cli::parse_from(std::iter::once("evalflow").chain(args.iter().copied()));
		match cli.command {
			Commands::Run(args) => args,
			other => panic!("unexpected command {other:?}"),
		}
	}

	#[test]
	fn defaults_to_exact_scorer() {
		let mut config = EvalConfig::default();
		apply_overrides(&mut config, &parse(&["run", "--data", "cases.jsonl"]));
		assert_eq!(config.scorers.len(), 1);
		assert!(matches!(config.scorers[0], ScorerConfig::Exact));
		assert_eq!(config.parallelism, 1);
		assert_eq!(config.data.unwrap().path, PathBuf::from("cases.jsonl"));
	}

	#[test]
	fn flags_override_config() {
		let mut config = EvalConfig {
			parallelism: 2,
			..Default::default()
		};
		let args = parse(&[
			"run",
			"--parallelism",
			"8",
			"--levenshtein",
			"0.7",
			"--contains-i",
			"hello",
			"--http-url",
			"http://localhost:1/run",
			"--http-method",
			"get",
			"--trace-url",
			"http://localhost:1/spans",
		]);
		apply_overrides(&mut config, &args);
		assert_eq!(config.parallelism, 8);
		assert_eq!(config.scorers.len(), 2);
		assert!(matches!(
			config.scorers[1],
			ScorerConfig::Contains {
				case_sensitive: false,
				..
			}
		));
		assert!(matches!(&config.task, TaskConfig::Http { method, .. } if method == "GET"));
		assert_eq!(config.trace.url.as_deref(), Some("http://localhost:1/spans"));
	}
}
