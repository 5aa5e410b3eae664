//! Step execution: the coarse retry tier.
//!
//! A step runs its substeps in declared order, aggregates the accepted
//! outputs, and gates the aggregate against the step-level criteria.
//! A gate failure re-runs the whole step under the next step attempt
//! number, up to the step's retry budget. Substep exhaustion and fatal
//! errors fail the step directly; only gate failures re-attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use stagegate_types::config::LimitSettings;
use stagegate_types::error::StoreError;
use stagegate_types::workflow::{AggregationPolicy, StepDefinition};

use crate::llm::BoxTextGenerator;
use crate::retrieval::BoxRetriever;
use crate::store::{RunStore, StoredRun};
use crate::task::{BoxHttpCaller, FunctionRegistry};

use super::evaluate::{CriteriaEvaluator, Evaluation};
use super::substep::{SubstepResult, SubstepRunner};

/// How a step execution ended. Infrastructure failures surface as
/// `Err(StoreError)` from the runner instead.
#[derive(Debug)]
pub(crate) enum StepOutcome {
    Passed { output: String },
    Failed { message: String },
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

pub(crate) struct StepRunner {
    substeps: SubstepRunner,
    evaluator: CriteriaEvaluator,
    limits: LimitSettings,
}

impl StepRunner {
    pub fn new(
        generator: Arc<BoxTextGenerator>,
        retriever: Option<Arc<BoxRetriever>>,
        retrieval_top_k: usize,
        functions: Arc<FunctionRegistry>,
        http: Option<Arc<BoxHttpCaller>>,
        limits: LimitSettings,
    ) -> Self {
        Self {
            substeps: SubstepRunner::new(
                generator.clone(),
                retriever,
                retrieval_top_k,
                functions,
                http,
                limits.clone(),
            ),
            evaluator: CriteriaEvaluator::new(generator),
            limits,
        }
    }

    /// Run one step to completion, mutating the run's context and usage
    /// totals in place. The caller owns cursor movement and the
    /// post-step checkpoint.
    pub async fn run_step<S: RunStore>(
        &self,
        store: &S,
        run: &mut StoredRun,
        step: &StepDefinition,
    ) -> Result<StepOutcome, StoreError> {
        let budget = 1 + step.max_retries.unwrap_or(self.limits.step_retries);
        // Checkpointed partials pin the attempt a resumed run continues
        // under; a fresh run starts at 1.
        let start_attempt = run
            .context
            .partial_attempt_for(&step.id)
            .unwrap_or(1)
            .clamp(1, budget);
        let fine_grained = store.supports_fine_grained_checkpoints();
        let mut last_failure = String::new();

        for step_attempt in start_attempt..=budget {
            if run.context.partial_attempt_for(&step.id) != Some(step_attempt) {
                run.context.clear_partials();
            }

            let mut outputs: Vec<(String, String)> = Vec::with_capacity(step.substeps.len());
            let mut failure: Option<String> = None;

            for substep in &step.substeps {
                if let Some(saved) =
                    run.context.partial_output(&step.id, step_attempt, &substep.id)
                {
                    tracing::debug!(
                        step_id = %step.id,
                        substep_id = %substep.id,
                        "substep already checkpointed, skipping"
                    );
                    outputs.push((substep.id.clone(), saved.to_string()));
                    continue;
                }

                let result = self
                    .substeps
                    .run(store, run.run_id, &step.id, step_attempt, substep, &run.context)
                    .await?;
                match result {
                    SubstepResult::Accepted { output, usage } => {
                        run.usage.absorb(&usage);
                        run.context
                            .record_partial(&step.id, step_attempt, &substep.id, &output);
                        outputs.push((substep.id.clone(), output));
                        if fine_grained {
                            run.updated_at = Utc::now();
                            store.save_run(run).await?;
                        }
                    }
                    SubstepResult::Exhausted { message, usage }
                    | SubstepResult::Fatal { message, usage } => {
                        run.usage.absorb(&usage);
                        failure = Some(message);
                        break;
                    }
                }
            }

            // Substep failures are terminal for the step; the coarse tier
            // only re-attempts gate failures.
            if let Some(message) = failure {
                return Ok(StepOutcome::Failed {
                    message: format!("step '{}' failed: {message}", step.id),
                });
            }

            let aggregate = aggregate_outputs(step.aggregation, &outputs);
            let evaluation = match self.gate(&aggregate, step).await {
                Ok(evaluation) => evaluation,
                Err(message) => {
                    return Ok(StepOutcome::Failed {
                        message: format!("step '{}' gate evaluation failed: {message}", step.id),
                    });
                }
            };
            run.usage.absorb(&evaluation.usage);

            if evaluation.accepted {
                run.context.clear_partials();
                if let Err(err) = run.context.bind_output(&step.id, &aggregate) {
                    return Ok(StepOutcome::Failed {
                        message: format!("step '{}' failed: {err}", step.id),
                    });
                }
                tracing::info!(
                    step_id = %step.id,
                    step_attempt,
                    score = evaluation.score.value,
                    "step passed its gate"
                );
                return Ok(StepOutcome::Passed { output: aggregate });
            }

            let failed: Vec<String> = evaluation
                .score
                .failed_checks()
                .map(|c| match &c.detail {
                    Some(detail) => format!("{}: {detail}", c.name),
                    None => c.name.clone(),
                })
                .collect();
            last_failure = format!(
                "gate rejected the aggregate (score {:.2}; {})",
                evaluation.score.value,
                if failed.is_empty() {
                    "score below threshold".to_string()
                } else {
                    failed.join("; ")
                }
            );
            tracing::info!(
                step_id = %step.id,
                step_attempt,
                budget,
                score = evaluation.score.value,
                "step gate failed"
            );
        }

        run.context.clear_partials();
        Ok(StepOutcome::Failed {
            message: format!(
                "step '{}' failed its gate after {budget} attempts: {last_failure}",
                step.id
            ),
        })
    }

    /// Evaluate the aggregate, retrying transient judge failures. Gate
    /// evaluations are not attempt records, so the retry loop is local.
    async fn gate(&self, aggregate: &str, step: &StepDefinition) -> Result<Evaluation, String> {
        let max_attempts = self.limits.max_attempts.max(1);
        let timeout = Duration::from_secs(self.limits.request_timeout_secs.max(1));
        let mut last = String::new();

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(timeout, self.evaluator.evaluate(aggregate, &step.criteria))
                .await
            {
                Ok(Ok(evaluation)) => return Ok(evaluation),
                Ok(Err(err)) if err.is_transient() && attempt < max_attempts => {
                    tracing::warn!(
                        step_id = %step.id,
                        attempt,
                        error = %err,
                        "step gate evaluation failed, retrying"
                    );
                    last = err.to_string();
                }
                Ok(Err(err)) => return Err(err.to_string()),
                Err(_) if attempt < max_attempts => {
                    last = format!("request timed out after {}ms", timeout.as_millis());
                    tracing::warn!(
                        step_id = %step.id,
                        attempt,
                        "step gate evaluation timed out, retrying"
                    );
                }
                Err(_) => {
                    return Err(format!("request timed out after {}ms", timeout.as_millis()));
                }
            }
        }
        Err(last)
    }
}

/// Combine substep outputs into the step-level result.
fn aggregate_outputs(policy: AggregationPolicy, outputs: &[(String, String)]) -> String {
    match policy {
        AggregationPolicy::Concat => outputs
            .iter()
            .map(|(_, output)| output.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
        AggregationPolicy::JsonMerge => {
            let mut object = serde_json::Map::new();
            for (id, output) in outputs {
                // Raw JSON outputs merge structurally; anything else is
                // carried as a string.
                let value = serde_json::from_str(output)
                    .unwrap_or_else(|_| serde_json::Value::String(output.clone()));
                object.insert(id.clone(), value);
            }
            serde_json::Value::Object(object).to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRunStore;
    use crate::workflow::context::ExecutionContext;
    use crate::workflow::testing::ScriptedGenerator;
    use stagegate_types::llm::{GenerationResponse, ProviderError};
    use stagegate_types::run::{RunStatus, TokenUsage};
    use stagegate_types::workflow::{SubstepDefinition, SuccessCriteria, TaskSpec};
    use uuid::Uuid;

    fn runner_with(
        script: Vec<Result<GenerationResponse, ProviderError>>,
    ) -> (StepRunner, ScriptedGenerator) {
        let generator = ScriptedGenerator::new(script);
        let probe = generator.clone();
        let runner = StepRunner::new(
            Arc::new(BoxTextGenerator::new(generator)),
            None,
            4,
            Arc::new(FunctionRegistry::new()),
            None,
            LimitSettings::default(),
        );
        (runner, probe)
    }

    fn prompt_substep(id: &str, template: &str) -> SubstepDefinition {
        SubstepDefinition {
            id: id.to_string(),
            task: TaskSpec::Prompt {
                template: template.to_string(),
                use_retrieval: false,
            },
            criteria: SuccessCriteria::default(),
        }
    }

    fn step(id: &str, substeps: Vec<SubstepDefinition>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            substeps,
            criteria: SuccessCriteria::default(),
            max_retries: None,
            aggregation: AggregationPolicy::Concat,
        }
    }

    async fn seeded_run(input: &str) -> (MemoryRunStore, StoredRun) {
        let store = MemoryRunStore::new();
        let now = Utc::now();
        let run = StoredRun {
            run_id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
            workflow_name: "Test".to_string(),
            status: RunStatus::Running,
            context: ExecutionContext::new(input),
            usage: TokenUsage::default(),
            error: None,
            created_at: now,
            updated_at: now,
        };
        store.save_run(&run).await.unwrap();
        (store, run)
    }

    #[tokio::test]
    async fn test_single_substep_step_binds_output() {
        let (runner, _) = runner_with(vec![Ok(ScriptedGenerator::response("the draft", 5, 5))]);
        let step = step("draft", vec![prompt_substep("write", "Write about {input}")]);
        let (store, mut run) = seeded_run("rust").await;

        let outcome = runner.run_step(&store, &mut run, &step).await.unwrap();
        match outcome {
            StepOutcome::Passed { output } => assert_eq!(output, "the draft"),
            other => panic!("expected pass, got {other:?}"),
        }
        assert_eq!(run.context.get("draft"), Some("the draft"));
        assert_eq!(run.context.partial_attempt_for("draft"), None, "partials cleared on commit");
        assert_eq!(run.usage, TokenUsage::new(5, 5));
    }

    #[tokio::test]
    async fn test_later_substeps_see_sibling_outputs() {
        let (runner, probe) = runner_with(vec![
            Ok(ScriptedGenerator::response("1. intro", 1, 1)),
            Ok(ScriptedGenerator::response("full text", 1, 1)),
        ]);
        let step = step(
            "draft",
            vec![
                prompt_substep("outline", "Outline {input}"),
                prompt_substep("expand", "Expand {outline}"),
            ],
        );
        let (store, mut run) = seeded_run("rust").await;

        let outcome = runner.run_step(&store, &mut run, &step).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Passed { .. }));

        let prompts = probe.recorded_prompts();
        assert_eq!(prompts[1], "Expand 1. intro");
    }

    #[tokio::test]
    async fn test_concat_joins_outputs_with_blank_lines() {
        let (runner, _) = runner_with(vec![
            Ok(ScriptedGenerator::response("part one", 1, 1)),
            Ok(ScriptedGenerator::response("part two", 1, 1)),
        ]);
        let step = step(
            "draft",
            vec![
                prompt_substep("first", "First {input}"),
                prompt_substep("second", "Second {input}"),
            ],
        );
        let (store, mut run) = seeded_run("rust").await;

        match runner.run_step(&store, &mut run, &step).await.unwrap() {
            StepOutcome::Passed { output } => assert_eq!(output, "part one\n\npart two"),
            other => panic!("expected pass, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_json_merge_keys_outputs_by_substep() {
        let (runner, _) = runner_with(vec![
            Ok(ScriptedGenerator::response(r#"{"count": 3}"#, 1, 1)),
            Ok(ScriptedGenerator::response("plain text", 1, 1)),
        ]);
        let mut step = step(
            "collect",
            vec![
                prompt_substep("stats", "Stats for {input}"),
                prompt_substep("notes", "Notes for {input}"),
            ],
        );
        step.aggregation = AggregationPolicy::JsonMerge;
        let (store, mut run) = seeded_run("rust").await;

        match runner.run_step(&store, &mut run, &step).await.unwrap() {
            StepOutcome::Passed { output } => {
                let merged: serde_json::Value = serde_json::from_str(&output).unwrap();
                assert_eq!(merged["stats"]["count"], serde_json::json!(3));
                assert_eq!(merged["notes"], serde_json::json!("plain text"));
            }
            other => panic!("expected pass, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gate_failure_reruns_whole_step() {
        let (runner, probe) = runner_with(vec![
            Ok(ScriptedGenerator::response("missing the word", 1, 1)),
            Ok(ScriptedGenerator::response("has beta now", 1, 1)),
        ]);
        let mut step = step("draft", vec![prompt_substep("write", "Write {input}")]);
        step.criteria = SuccessCriteria {
            required_keywords: Some(vec!["beta".to_string()]),
            ..Default::default()
        };
        step.max_retries = Some(1);
        let (store, mut run) = seeded_run("rust").await;

        let outcome = runner.run_step(&store, &mut run, &step).await.unwrap();
        match outcome {
            StepOutcome::Passed { output } => assert_eq!(output, "has beta now"),
            other => panic!("expected pass, got {other:?}"),
        }
        assert_eq!(probe.calls_made(), 2, "the substep re-ran under attempt 2");

        let log = store.list_attempts(run.run_id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].step_attempt, 1);
        assert_eq!(log[1].step_attempt, 2);
        assert_eq!(log[1].attempt, 1, "substep numbering restarts per step attempt");
    }

    #[tokio::test]
    async fn test_gate_exhaustion_fails_step() {
        let (runner, _) = runner_with(vec![
            Ok(ScriptedGenerator::response("wrong", 1, 1)),
            Ok(ScriptedGenerator::response("still wrong", 1, 1)),
        ]);
        let mut step = step("draft", vec![prompt_substep("write", "Write {input}")]);
        step.criteria = SuccessCriteria {
            required_keywords: Some(vec!["beta".to_string()]),
            ..Default::default()
        };
        step.max_retries = Some(1);
        let (store, mut run) = seeded_run("rust").await;

        match runner.run_step(&store, &mut run, &step).await.unwrap() {
            StepOutcome::Failed { message } => {
                assert!(message.contains("after 2 attempts"), "message: {message}");
                assert!(message.contains("required_keywords"), "message: {message}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(run.context.partial_attempt_for("draft"), None);
    }

    #[tokio::test]
    async fn test_substep_exhaustion_skips_coarse_retry() {
        let (runner, probe) = runner_with(vec![
            Ok(ScriptedGenerator::response("bad", 1, 1)),
            Ok(ScriptedGenerator::response("bad", 1, 1)),
            Ok(ScriptedGenerator::response("bad", 1, 1)),
        ]);
        let mut substep = prompt_substep("write", "Write {input}");
        substep.criteria = SuccessCriteria {
            required_keywords: Some(vec!["impossible".to_string()]),
            ..Default::default()
        };
        let mut step = step("draft", vec![substep]);
        step.max_retries = Some(3);
        let (store, mut run) = seeded_run("rust").await;

        match runner.run_step(&store, &mut run, &step).await.unwrap() {
            StepOutcome::Failed { message } => {
                assert!(message.contains("exhausted 3 attempts"), "message: {message}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // Only the substep budget was spent; the step never re-ran.
        assert_eq!(probe.calls_made(), 3);
    }

    #[tokio::test]
    async fn test_fine_grained_checkpoint_lands_before_failure() {
        let (runner, _) = runner_with(vec![
            Ok(ScriptedGenerator::response("good part", 1, 1)),
            Err(ProviderError::InvalidRequest("boom".to_string())),
        ]);
        let step = step(
            "draft",
            vec![
                prompt_substep("first", "First {input}"),
                prompt_substep("second", "Second {input}"),
            ],
        );
        let (store, mut run) = seeded_run("rust").await;

        let outcome = runner.run_step(&store, &mut run, &step).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { .. }));

        // The accepted first substep was checkpointed before the fatal
        // second one ran.
        let saved = store.get_run(run.run_id).await.unwrap();
        assert_eq!(saved.context.partial_output("draft", 1, "first"), Some("good part"));
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_substeps() {
        let (runner, probe) =
            runner_with(vec![Ok(ScriptedGenerator::response("fresh second", 1, 1))]);
        let step = step(
            "draft",
            vec![
                prompt_substep("first", "First {input}"),
                prompt_substep("second", "Second {input}"),
            ],
        );
        let (store, mut run) = seeded_run("rust").await;
        run.context.record_partial("draft", 1, "first", "cached first");

        match runner.run_step(&store, &mut run, &step).await.unwrap() {
            StepOutcome::Passed { output } => {
                assert_eq!(output, "cached first\n\nfresh second");
            }
            other => panic!("expected pass, got {other:?}"),
        }
        assert_eq!(probe.calls_made(), 1, "the checkpointed substep did not re-run");
    }

    #[tokio::test]
    async fn test_gate_judge_usage_counts_toward_run_total() {
        let (runner, probe) = runner_with(vec![
            Ok(ScriptedGenerator::response("the draft", 5, 5)),
            Ok(ScriptedGenerator::response("0.9\nfine", 7, 3)),
        ]);
        let mut step = step("draft", vec![prompt_substep("write", "Write {input}")]);
        step.criteria = SuccessCriteria {
            min_quality_score: Some(0.5),
            rubric: Some("judge the draft".to_string()),
            ..Default::default()
        };
        let (store, mut run) = seeded_run("rust").await;

        let outcome = runner.run_step(&store, &mut run, &step).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Passed { .. }));
        assert_eq!(probe.calls_made(), 2, "one generation call and one judge call");
        assert_eq!(run.usage, TokenUsage::new(12, 8));
    }
}
