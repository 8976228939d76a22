use anyhow::Result;
use evalflow_types::EvaluationResult;

/// Helper to assert no case failed.
///
/// Use this in your `#[tokio::test]` functions.
///
/// # Example
/// ```ignore
/// #[tokio::test]
/// async fn test_my_agent() -> Result<()> {
///     let eval = Evaluation::builder()
///         .task(task)
///         .scorer(Arc::new(ExactMatchScorer))
///         .parallelism(4)
///         .build()?;
///
///     let result = eval.run(cases).await?;
///
///     assert_no_errors(&result)?;
///     assert_mean_score(&result, "exact_match", 0.8)?;
///
///     Ok(())
/// }
/// ```
pub fn assert_no_errors(result: &EvaluationResult) -> Result<()> {
    if !result.errors.is_empty() {
        anyhow::bail!(
            "Evaluation failed: {} case(s) errored\n{}\n{}",
            result.errors.len(),
            result.errors.join("\n"),
            result.summary_table()
        );
    }
    Ok(())
}

/// Helper to assert the mean of one score meets a threshold.
pub fn assert_mean_score(result: &EvaluationResult, name: &str, min_mean: f64) -> Result<()> {
    let Some(mean) = result.mean(name) else {
        anyhow::bail!("Evaluation failed: no values recorded for score '{name}'\n{}", result.summary_table());
    };
    if mean < min_mean {
        anyhow::bail!(
            "Evaluation failed: mean {name} {:.3} is below threshold {:.3}\n{}",
            mean,
            min_mean,
            result.summary_table()
        );
    }
    Ok(())
}

/// Helper to assert at most `max` cases failed.
pub fn assert_max_errors(result: &EvaluationResult, max: usize) -> Result<()> {
    if result.errors.len() > max {
        anyhow::bail!(
            "Evaluation failed: {} case(s) errored, at most {} allowed\n{}",
            result.errors.len(),
            max,
            result.summary_table()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(errors: &[&str], exact: &[f64]) -> EvaluationResult {
        let mut r = EvaluationResult {
            errors: errors.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        };
        if !exact.is_empty() {
            r.scores.insert("exact".into(), exact.to_vec());
        }
        r
    }

    #[test]
    fn no_errors() {
        assert!(assert_no_errors(&result(&[], &[1.0])).is_ok());
        let err = assert_no_errors(&result(&["Task failed for input 'x': boom"], &[])).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn mean_threshold() {
        let r = result(&[], &[1.0, 0.5]);
        assert!(assert_mean_score(&r, "exact", 0.75).is_ok());
        assert!(assert_mean_score(&r, "exact", 0.8).is_err());
        assert!(assert_mean_score(&r, "missing", 0.0).is_err());
    }

    #[test]
    fn error_budget() {
        let r = result(&["a", "b"], &[]);
        assert!(assert_max_errors(&r, 2).is_ok());
        assert!(assert_max_errors(&r, 1).is_err());
    }
}
