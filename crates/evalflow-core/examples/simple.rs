use std::sync::Arc;

use evalflow_core::{
    from_async_fn, scorer_fn3, Case, Evaluation, ExactMatchScorer, JsonlDataSource, LevenshteinScorer, Scorer,
    ScoreOutcome,
};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Example 1: Inline cases
    let cases = vec![
        Case::with_expected(json!("Hello"), json!("Hello World!")),
        Case::with_expected(json!("Hi"), json!("Hi World!")).tags(["short"]),
    ];

    // Task: append " World!" to any string input
    let task = from_async_fn(|input| {
        let input = input.clone();
        async move {
            let s = input.as_str().unwrap_or_default();
            Ok(json!(format!("{s} World!")))
        }
    });

    let length_ratio = scorer_fn3(|_input, expected, output| async move {
        let want = expected.map(|e| e.to_string().len()).unwrap_or(0) as f64;
        let got = output.to_string().len() as f64;
        Ok(ScoreOutcome::Value(if want == 0.0 { 0.0 } else { (got / want).min(1.0) }))
    })
    .named("length_ratio");

    let scorers: Vec<Arc<dyn Scorer>> = vec![
        Arc::new(ExactMatchScorer),
        Arc::new(LevenshteinScorer::new(0.9)),
        Arc::new(length_ratio),
    ];

    let eval = Evaluation::builder()
        .task(task.clone())
        .scorers(scorers)
        .parallelism(4)
        .build()?;

    let result = eval.run(cases).await?;
    println!("{}", result.summary_table());

    // Example 2: Load from JSONL file if provided
    if let Some(path) = std::env::args().nth(1) {
        let eval = Evaluation::builder()
            .task(task)
            .scorer(Arc::new(ExactMatchScorer))
            .build()?;
        let result = eval.run_data_source(&JsonlDataSource::new(path)).await?;
        println!("{}", result.summary_table());
    }

    Ok(())
}

