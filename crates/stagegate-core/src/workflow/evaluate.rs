//! Output evaluation against success criteria.
//!
//! Declarative checks (keywords, format, length) run locally and
//! deterministically. A rubric adds one judge call through the same
//! provider the run generates with; its tokens count toward the run
//! total. How the pieces combine:
//!
//! - `min_quality_score` set: the score value is the rubric score when
//!   a rubric is present (otherwise the mean of the declarative
//!   checks), and acceptance requires the value to reach the minimum
//!   on top of every declarative check passing.
//! - `min_quality_score` unset: acceptance is just "every declarative
//!   check passed"; a rubric still runs but is informational.

use std::sync::Arc;

use stagegate_types::llm::{GenerationRequest, ProviderError};
use stagegate_types::run::{CheckOutcome, QualityScore, TokenUsage};
use stagegate_types::workflow::{OutputFormat, SuccessCriteria};

use crate::llm::BoxTextGenerator;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Longest output excerpt shown to the judge.
const JUDGE_OUTPUT_LIMIT: usize = 16_384;

/// Judge calls are deterministic-leaning on purpose.
const JUDGE_TEMPERATURE: f64 = 0.0;

// ---------------------------------------------------------------------------
// Evaluation result
// ---------------------------------------------------------------------------

/// Outcome of one evaluation, with the tokens it cost.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub score: QualityScore,
    pub accepted: bool,
    /// Judge tokens; zero when no rubric ran.
    pub usage: TokenUsage,
}

impl Evaluation {
    fn auto_pass() -> Self {
        Self {
            score: QualityScore::auto_pass(),
            accepted: true,
            usage: TokenUsage::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// CriteriaEvaluator
// ---------------------------------------------------------------------------

/// Evaluates outputs against [`SuccessCriteria`].
pub struct CriteriaEvaluator {
    judge: Arc<BoxTextGenerator>,
}

impl CriteriaEvaluator {
    pub fn new(judge: Arc<BoxTextGenerator>) -> Self {
        Self { judge }
    }

    /// Evaluate `output` against `criteria`.
    ///
    /// Only judge transport failures surface as errors; an output that
    /// merely fails its checks is a normal `accepted: false` result.
    pub async fn evaluate(
        &self,
        output: &str,
        criteria: &SuccessCriteria,
    ) -> Result<Evaluation, ProviderError> {
        if criteria.is_empty() {
            return Ok(Evaluation::auto_pass());
        }

        let mut checks = Vec::new();
        // Fractional pass levels of the declarative checks, for scoring.
        let mut contributions = Vec::new();

        if let Some(keywords) = &criteria.required_keywords {
            let (outcome, fraction) = check_keywords(output, keywords);
            checks.push(outcome);
            contributions.push(fraction);
        }

        if let Some(format) = criteria.output_format {
            let outcome = check_format(output, format);
            contributions.push(if outcome.passed { 1.0 } else { 0.0 });
            checks.push(outcome);
        }

        if let Some(max_length) = criteria.max_length {
            let outcome = check_length(output, max_length);
            contributions.push(if outcome.passed { 1.0 } else { 0.0 });
            checks.push(outcome);
        }

        let declarative_ok = checks.iter().all(|c| c.passed);

        let mut usage = TokenUsage::default();
        let mut rubric_score = None;
        if let Some(rubric) = &criteria.rubric {
            let (outcome, score, judge_usage) = self
                .run_judge(output, rubric, criteria.min_quality_score)
                .await?;
            usage.absorb(&judge_usage);
            rubric_score = Some(score);
            checks.push(outcome);
        }

        let value = combine_value(&contributions, rubric_score, criteria.min_quality_score);
        let accepted = checks.iter().all(|c| c.passed)
            && criteria.min_quality_score.is_none_or(|min| value >= min);

        tracing::debug!(
            value,
            accepted,
            declarative_ok,
            judged = rubric_score.is_some(),
            "evaluated output"
        );

        Ok(Evaluation {
            score: QualityScore { value, checks },
            accepted,
            usage,
        })
    }

    async fn run_judge(
        &self,
        output: &str,
        rubric: &str,
        min_score: Option<f64>,
    ) -> Result<(CheckOutcome, f64, TokenUsage), ProviderError> {
        let request = GenerationRequest::new(build_judge_prompt(rubric, output))
            .with_temperature(JUDGE_TEMPERATURE);
        let response = self.judge.generate(request).await?;

        match parse_judge_response(&response.text) {
            Some((score, reasoning)) => {
                let passed = min_score.is_none_or(|min| score >= min);
                let detail = match reasoning {
                    Some(reason) => format!("score {score:.2}: {reason}"),
                    None => format!("score {score:.2}"),
                };
                let outcome = if passed {
                    CheckOutcome {
                        name: "rubric".to_string(),
                        passed: true,
                        detail: Some(detail),
                    }
                } else {
                    CheckOutcome::failed("rubric", detail)
                };
                Ok((outcome, score, response.usage))
            }
            None => {
                tracing::warn!(
                    judge_response = %truncate(&response.text, 200),
                    "judge response was not parseable, scoring 0.0"
                );
                Ok((
                    CheckOutcome::failed(
                        "rubric",
                        format!(
                            "unparseable judge reply: {}",
                            truncate(&response.text, 200)
                        ),
                    ),
                    0.0,
                    response.usage,
                ))
            }
        }
    }
}

/// Score value per the combination rule in the module docs.
fn combine_value(
    contributions: &[f64],
    rubric_score: Option<f64>,
    min_score: Option<f64>,
) -> f64 {
    match (rubric_score, min_score) {
        // A gating rubric is authoritative.
        (Some(score), Some(_)) => score,
        (Some(score), None) if contributions.is_empty() => score,
        // Informational rubric alongside declarative checks stays out
        // of the value so it cannot drag a passing output down.
        (Some(_), None) => mean(contributions),
        (None, _) if contributions.is_empty() => 1.0,
        (None, _) => mean(contributions),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

// ---------------------------------------------------------------------------
// Declarative checks
// ---------------------------------------------------------------------------

fn check_keywords(output: &str, keywords: &[String]) -> (CheckOutcome, f64) {
    if keywords.is_empty() {
        return (CheckOutcome::passed("required_keywords"), 1.0);
    }
    let haystack = output.to_lowercase();
    let missing: Vec<&str> = keywords
        .iter()
        .filter(|k| !haystack.contains(&k.to_lowercase()))
        .map(String::as_str)
        .collect();
    let fraction = (keywords.len() - missing.len()) as f64 / keywords.len() as f64;

    if missing.is_empty() {
        (CheckOutcome::passed("required_keywords"), fraction)
    } else {
        (
            CheckOutcome::failed(
                "required_keywords",
                format!("missing required keywords: {}", missing.join(", ")),
            ),
            fraction,
        )
    }
}

fn check_format(output: &str, format: OutputFormat) -> CheckOutcome {
    match format {
        OutputFormat::FreeText => CheckOutcome::passed("output_format"),
        OutputFormat::Json => match serde_json::from_str::<serde_json::Value>(output.trim()) {
            Ok(_) => CheckOutcome::passed("output_format"),
            Err(e) => CheckOutcome::failed(
                "output_format",
                format!("output is not valid JSON: {e}"),
            ),
        },
    }
}

fn check_length(output: &str, max_length: usize) -> CheckOutcome {
    let length = output.chars().count();
    if length <= max_length {
        CheckOutcome::passed("max_length")
    } else {
        CheckOutcome::failed(
            "max_length",
            format!("output is {length} characters, limit is {max_length}"),
        )
    }
}

// ---------------------------------------------------------------------------
// Judge prompt and response parsing
// ---------------------------------------------------------------------------

fn build_judge_prompt(rubric: &str, output: &str) -> String {
    format!(
        "You are a strict quality judge. Score the response below against the rubric.\n\n\
         Rubric:\n{rubric}\n\n\
         Response:\n{}\n\n\
         Reply with a score between 0.0 and 1.0 on the first line, then one \
         sentence of reasoning on the next line.",
        truncate(output, JUDGE_OUTPUT_LIMIT)
    )
}

/// Pull the score (clamped to `[0.0, 1.0]`) and any reasoning out of a
/// judge reply. The instructed shape is a bare number on the first
/// non-empty line with reasoning after it; judges that answer with a
/// `{"score": ..., "reasoning": ...}` object anyway are tolerated.
fn parse_judge_response(text: &str) -> Option<(f64, Option<String>)> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    if let Some(first) = lines.next() {
        if let Ok(score) = first.parse::<f64>() {
            if score.is_finite() {
                let rest: Vec<&str> = lines.collect();
                let reasoning = (!rest.is_empty()).then(|| rest.join(" "));
                return Some((score.clamp(0.0, 1.0), reasoning));
            }
        }
    }
    parse_judge_json(text)
}

fn parse_judge_json(text: &str) -> Option<(f64, Option<String>)> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&text[start..=end]).ok()?;
    let score = value.get("score")?.as_f64()?.clamp(0.0, 1.0);
    let reasoning = value
        .get("reasoning")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some((score, reasoning))
}

fn truncate(text: &str, limit: usize) -> &str {
    if text.chars().count() <= limit {
        return text;
    }
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::ScriptedGenerator;
    use stagegate_types::llm::GenerationResponse;

    fn evaluator_with(responses: Vec<Result<GenerationResponse, ProviderError>>) -> CriteriaEvaluator {
        CriteriaEvaluator::new(Arc::new(BoxTextGenerator::new(ScriptedGenerator::new(
            responses,
        ))))
    }

    fn no_judge_evaluator() -> CriteriaEvaluator {
        evaluator_with(Vec::new())
    }

    // -----------------------------------------------------------------------
    // Auto-pass and declarative checks
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_empty_criteria_auto_passes() {
        let eval = no_judge_evaluator();
        let result = eval
            .evaluate("", &SuccessCriteria::default())
            .await
            .unwrap();
        assert!(result.accepted);
        assert_eq!(result.score.value, 1.0);
        assert!(result.score.checks.is_empty());
        assert_eq!(result.usage, TokenUsage::default());
    }

    #[tokio::test]
    async fn test_keywords_case_insensitive() {
        let eval = no_judge_evaluator();
        let criteria = SuccessCriteria {
            required_keywords: Some(vec!["Rust".to_string(), "ASYNC".to_string()]),
            ..Default::default()
        };
        let result = eval
            .evaluate("rust makes async pleasant", &criteria)
            .await
            .unwrap();
        assert!(result.accepted);
        assert_eq!(result.score.value, 1.0);
    }

    #[tokio::test]
    async fn test_missing_keywords_fail_with_detail() {
        let eval = no_judge_evaluator();
        let criteria = SuccessCriteria {
            required_keywords: Some(vec![
                "alpha".to_string(),
                "beta".to_string(),
                "gamma".to_string(),
                "delta".to_string(),
            ]),
            ..Default::default()
        };
        let result = eval.evaluate("alpha and beta only", &criteria).await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.score.value, 0.5);
        let detail = result.score.checks[0].detail.as_deref().unwrap();
        assert!(detail.contains("gamma"));
        assert!(detail.contains("delta"));
        assert!(!detail.contains("alpha"));
    }

    #[tokio::test]
    async fn test_json_format_check() {
        let eval = no_judge_evaluator();
        let criteria = SuccessCriteria {
            output_format: Some(OutputFormat::Json),
            ..Default::default()
        };
        assert!(
            eval.evaluate(r#"{"ok": true}"#, &criteria)
                .await
                .unwrap()
                .accepted
        );
        let failed = eval.evaluate("not json at all", &criteria).await.unwrap();
        assert!(!failed.accepted);
        assert_eq!(failed.score.value, 0.0);
    }

    #[tokio::test]
    async fn test_max_length_counts_chars() {
        let eval = no_judge_evaluator();
        let criteria = SuccessCriteria {
            max_length: Some(5),
            ..Default::default()
        };
        assert!(eval.evaluate("ütfäö", &criteria).await.unwrap().accepted);
        assert!(!eval.evaluate("ütfäöx", &criteria).await.unwrap().accepted);
    }

    #[tokio::test]
    async fn test_value_is_mean_of_declarative_checks() {
        let eval = no_judge_evaluator();
        let criteria = SuccessCriteria {
            required_keywords: Some(vec!["present".to_string()]),
            output_format: Some(OutputFormat::Json),
            ..Default::default()
        };
        // Keywords pass (1.0), format fails (0.0).
        let result = eval.evaluate("present but not json", &criteria).await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.score.value, 0.5);
    }

    #[tokio::test]
    async fn test_evaluation_is_deterministic() {
        let eval = no_judge_evaluator();
        let criteria = SuccessCriteria {
            required_keywords: Some(vec!["x".to_string(), "y".to_string()]),
            max_length: Some(100),
            ..Default::default()
        };
        let a = eval.evaluate("only x here", &criteria).await.unwrap();
        let b = eval.evaluate("only x here", &criteria).await.unwrap();
        assert_eq!(a.score, b.score);
        assert_eq!(a.accepted, b.accepted);
    }

    // -----------------------------------------------------------------------
    // Judge
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_first_line_float_judge_reply_gates() {
        let criteria = SuccessCriteria {
            min_quality_score: Some(0.8),
            rubric: Some("Judge coverage.".to_string()),
            ..Default::default()
        };
        let eval = evaluator_with(vec![Ok(ScriptedGenerator::response(
            "0.85\nThe output covers all points.",
            20,
            10,
        ))]);
        let result = eval.evaluate("fine output", &criteria).await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.score.value, 0.85);
        let detail = result.score.checks[0].detail.as_deref().unwrap();
        assert!(detail.contains("covers all points"));
    }

    #[test]
    fn test_first_line_float_parsing() {
        assert_eq!(
            parse_judge_response("0.85\nThe output covers all points."),
            Some((0.85, Some("The output covers all points.".to_string())))
        );
        // Bare score, no reasoning.
        assert_eq!(parse_judge_response("0.4\n"), Some((0.4, None)));
        // Leading blank lines and surrounding whitespace.
        assert_eq!(parse_judge_response("\n  0.6  \nterse"), Some((0.6, Some("terse".to_string()))));
        // Out-of-range first-line scores clamp.
        assert_eq!(parse_judge_response("1.4\ntoo generous"), Some((1.0, Some("too generous".to_string()))));
        // Prose before any number is not a score.
        assert_eq!(parse_judge_response("Score: 0.85"), None);
        assert_eq!(parse_judge_response("NaN\nhuh"), None);
    }

    #[tokio::test]
    async fn test_gating_rubric_drives_acceptance() {
        let criteria = SuccessCriteria {
            min_quality_score: Some(0.8),
            rubric: Some("Judge clarity.".to_string()),
            ..Default::default()
        };

        let eval = evaluator_with(vec![Ok(ScriptedGenerator::response(
            r#"{"score": 0.9, "reasoning": "clear and well structured"}"#,
            30,
            12,
        ))]);
        let result = eval.evaluate("fine output", &criteria).await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.score.value, 0.9);
        assert_eq!(result.usage, TokenUsage::new(30, 12));

        let eval = evaluator_with(vec![Ok(ScriptedGenerator::response(
            r#"{"score": 0.4, "reasoning": "rambling"}"#,
            30,
            12,
        ))]);
        let result = eval.evaluate("weak output", &criteria).await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.score.value, 0.4);
        assert!(!result.score.checks[0].passed);
    }

    #[tokio::test]
    async fn test_informational_rubric_never_gates() {
        let criteria = SuccessCriteria {
            rubric: Some("Judge tone.".to_string()),
            ..Default::default()
        };
        let eval = evaluator_with(vec![Ok(ScriptedGenerator::response(
            r#"{"score": 0.2, "reasoning": "dry"}"#,
            10,
            5,
        ))]);
        let result = eval.evaluate("an output", &criteria).await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.score.value, 0.2);
        assert!(result.score.checks[0].passed);
    }

    #[tokio::test]
    async fn test_rubric_with_declarative_checks_stays_informational() {
        let criteria = SuccessCriteria {
            required_keywords: Some(vec!["present".to_string()]),
            rubric: Some("Judge tone.".to_string()),
            ..Default::default()
        };
        let eval = evaluator_with(vec![Ok(ScriptedGenerator::response(
            r#"{"score": 0.1, "reasoning": "flat"}"#,
            10,
            5,
        ))]);
        let result = eval.evaluate("present and fine", &criteria).await.unwrap();
        assert!(result.accepted);
        // Value comes from the declarative checks alone.
        assert_eq!(result.score.value, 1.0);
    }

    #[tokio::test]
    async fn test_min_score_without_rubric_uses_declarative_mean() {
        let eval = no_judge_evaluator();
        let criteria = SuccessCriteria {
            required_keywords: Some(vec!["a".to_string(), "b".to_string()]),
            min_quality_score: Some(0.6),
            ..Default::default()
        };
        let result = eval.evaluate("only a", &criteria).await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.score.value, 0.5);
    }

    #[tokio::test]
    async fn test_unparseable_judge_scores_zero() {
        let criteria = SuccessCriteria {
            min_quality_score: Some(0.5),
            rubric: Some("Judge it.".to_string()),
            ..Default::default()
        };
        let eval = evaluator_with(vec![Ok(ScriptedGenerator::response(
            "I give it a solid seven out of ten.",
            10,
            8,
        ))]);
        let result = eval.evaluate("output", &criteria).await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.score.value, 0.0);
        assert!(!result.score.checks[0].passed);
        // The raw reply lands in the detail for the attempt log.
        let detail = result.score.checks[0].detail.as_deref().unwrap();
        assert!(detail.contains("seven out of ten"));
    }

    #[tokio::test]
    async fn test_judge_transport_errors_propagate() {
        let criteria = SuccessCriteria {
            rubric: Some("Judge it.".to_string()),
            ..Default::default()
        };
        let eval = evaluator_with(vec![Err(ProviderError::Network("reset".to_string()))]);
        let err = eval.evaluate("output", &criteria).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_judge_reply_with_surrounding_prose_parses() {
        assert_eq!(
            parse_judge_response("Sure! {\"score\": 0.75, \"reasoning\": \"ok\"} hope that helps"),
            Some((0.75, Some("ok".to_string())))
        );
        assert_eq!(parse_judge_response("no json here"), None);
        // Out-of-range scores clamp.
        assert_eq!(parse_judge_response("{\"score\": 3.0}"), Some((1.0, None)));
    }
}
