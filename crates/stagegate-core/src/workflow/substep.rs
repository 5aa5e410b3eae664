//! The substep attempt loop.
//!
//! One substep execution is up to `max_attempts` tries at its task.
//! Every try appends a durable record to the attempt log before the
//! loop moves on, so a crash can never lose a model response that was
//! already paid for. Failure handling follows the error class:
//!
//! - quality gate failure: next try gets deterministic revision
//!   feedback built from the failed checks
//! - transient error (timeouts included): next try repeats the exact
//!   same input, no feedback
//! - fatal error: the loop aborts immediately, remaining budget unused

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use stagegate_types::config::LimitSettings;
use stagegate_types::error::{RetrievalError, StoreError, TaskError};
use stagegate_types::llm::{GenerationRequest, ProviderError};
use stagegate_types::run::{QualityScore, SubstepAttempt, TokenUsage};
use stagegate_types::workflow::{SubstepDefinition, TaskSpec};

use crate::llm::BoxTextGenerator;
use crate::retrieval::BoxRetriever;
use crate::store::RunStore;
use crate::task::{BoxHttpCaller, FunctionRegistry};

use super::context::ExecutionContext;
use super::evaluate::CriteriaEvaluator;
use super::feedback::FeedbackComposer;

/// Separator between retrieved chunks in the prompt prefix.
const CHUNK_SEPARATOR: &str = "\n---\n";

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How a substep execution ended. Token usage covers every attempt made,
/// judge calls included.
#[derive(Debug)]
pub(crate) enum SubstepResult {
    Accepted {
        output: String,
        usage: TokenUsage,
    },
    /// The attempt budget ran out on quality or transient failures.
    Exhausted {
        message: String,
        usage: TokenUsage,
    },
    /// A fatal error aborted the loop with budget left over.
    Fatal {
        message: String,
        usage: TokenUsage,
    },
}

/// Input prepared for one attempt.
enum TaskInput {
    Prompt { base: String },
    Payload { base: serde_json::Value },
}

/// One attempt's failure, classified.
struct AttemptFailure {
    message: String,
    transient: bool,
}

// ---------------------------------------------------------------------------
// SubstepRunner
// ---------------------------------------------------------------------------

/// Runs a single substep to acceptance, exhaustion, or a fatal error.
pub(crate) struct SubstepRunner {
    generator: Arc<BoxTextGenerator>,
    evaluator: CriteriaEvaluator,
    retriever: Option<Arc<BoxRetriever>>,
    retrieval_top_k: usize,
    functions: Arc<FunctionRegistry>,
    http: Option<Arc<BoxHttpCaller>>,
    limits: LimitSettings,
}

impl SubstepRunner {
    pub fn new(
        generator: Arc<BoxTextGenerator>,
        retriever: Option<Arc<BoxRetriever>>,
        retrieval_top_k: usize,
        functions: Arc<FunctionRegistry>,
        http: Option<Arc<BoxHttpCaller>>,
        limits: LimitSettings,
    ) -> Self {
        Self {
            evaluator: CriteriaEvaluator::new(generator.clone()),
            generator,
            retriever,
            retrieval_top_k,
            functions,
            http,
            limits,
        }
    }

    /// Execute the substep's attempt loop. Only storage failures are
    /// `Err`; everything else is a [`SubstepResult`].
    pub async fn run<S: RunStore>(
        &self,
        store: &S,
        run_id: Uuid,
        step_id: &str,
        step_attempt: u32,
        substep: &SubstepDefinition,
        ctx: &ExecutionContext,
    ) -> Result<SubstepResult, StoreError> {
        let max_attempts = self.limits.max_attempts.max(1);
        let mut usage = TokenUsage::default();

        // Base input is fixed for the whole loop; feedback layers on top.
        let base = match self.prepare_input(substep, ctx) {
            Ok(base) => base,
            Err(message) => {
                let record = AttemptRecord {
                    step_id,
                    step_attempt,
                    substep_id: &substep.id,
                    attempt: 1,
                    rendered_input: template_of(substep).to_string(),
                    retrieval_context: None,
                    output: None,
                    score: None,
                    accepted: false,
                    error: Some(message.clone()),
                    usage: TokenUsage::default(),
                    started: Instant::now(),
                };
                store.append_attempt(run_id, &record.build()).await?;
                return Ok(SubstepResult::Fatal {
                    message: format!("substep '{}' failed: {message}", substep.id),
                    usage,
                });
            }
        };

        if wants_retrieval(substep) && self.retriever.is_none() {
            tracing::warn!(
                substep_id = %substep.id,
                "retrieval requested but no retriever configured, continuing without context"
            );
        }

        // Retrieval runs at most once per substep; the result is reused
        // across attempts because the query does not change.
        let mut cached_retrieval: Option<Option<String>> = None;
        // Output and score of the last quality failure, for feedback.
        let mut quality_failure: Option<(String, QualityScore)> = None;
        let mut last_message = String::new();

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let (rendered_input, payload) =
                self.input_for_attempt(&base, &quality_failure, attempt, max_attempts);

            // Fetch retrieval context if this attempt needs it.
            let retrieval_context = match (&cached_retrieval, wants_retrieval(substep), &self.retriever) {
                (Some(cached), _, _) => cached.clone(),
                (None, true, Some(retriever)) => {
                    match self.fetch_retrieval(retriever, base_query(&base)).await {
                        Ok(context) => {
                            cached_retrieval = Some(context.clone());
                            context
                        }
                        Err(err) => {
                            let failure = AttemptFailure {
                                message: err.to_string(),
                                transient: err.is_transient(),
                            };
                            let record = AttemptRecord {
                                step_id,
                                step_attempt,
                                substep_id: &substep.id,
                                attempt,
                                rendered_input,
                                retrieval_context: None,
                                output: None,
                                score: None,
                                accepted: false,
                                error: Some(failure.message.clone()),
                                usage: TokenUsage::default(),
                                started,
                            };
                            store.append_attempt(run_id, &record.build()).await?;
                            match self.classify(&failure, &substep.id, attempt, max_attempts, usage) {
                                Some(result) => return Ok(result),
                                None => {
                                    last_message = failure.message;
                                    continue;
                                }
                            }
                        }
                    }
                }
                _ => None,
            };

            // Run the task itself.
            let task_result = self
                .execute_task(substep, &rendered_input, payload, retrieval_context.as_deref())
                .await;

            let (output, attempt_usage) = match task_result {
                Ok(pair) => pair,
                Err(failure) => {
                    tracing::warn!(
                        substep_id = %substep.id,
                        attempt,
                        transient = failure.transient,
                        error = %failure.message,
                        "task attempt failed"
                    );
                    let record = AttemptRecord {
                        step_id,
                        step_attempt,
                        substep_id: &substep.id,
                        attempt,
                        rendered_input,
                        retrieval_context,
                        output: None,
                        score: None,
                        accepted: false,
                        error: Some(failure.message.clone()),
                        usage: TokenUsage::default(),
                        started,
                    };
                    store.append_attempt(run_id, &record.build()).await?;
                    match self.classify(&failure, &substep.id, attempt, max_attempts, usage) {
                        Some(result) => return Ok(result),
                        None => {
                            last_message = failure.message;
                            continue;
                        }
                    }
                }
            };
            usage.absorb(&attempt_usage);

            // Gate the output.
            let evaluation = match self.evaluate_with_timeout(&output, substep).await {
                Ok(evaluation) => evaluation,
                Err(failure) => {
                    let record = AttemptRecord {
                        step_id,
                        step_attempt,
                        substep_id: &substep.id,
                        attempt,
                        rendered_input,
                        retrieval_context,
                        output: Some(output),
                        score: None,
                        accepted: false,
                        error: Some(failure.message.clone()),
                        usage: attempt_usage,
                        started,
                    };
                    store.append_attempt(run_id, &record.build()).await?;
                    match self.classify(&failure, &substep.id, attempt, max_attempts, usage) {
                        Some(result) => return Ok(result),
                        None => {
                            last_message = failure.message;
                            continue;
                        }
                    }
                }
            };
            usage.absorb(&evaluation.usage);

            let mut record_usage = attempt_usage;
            record_usage.absorb(&evaluation.usage);
            let record = AttemptRecord {
                step_id,
                step_attempt,
                substep_id: &substep.id,
                attempt,
                rendered_input,
                retrieval_context,
                output: Some(output.clone()),
                score: Some(evaluation.score.clone()),
                accepted: evaluation.accepted,
                error: None,
                usage: record_usage,
                started,
            };
            store.append_attempt(run_id, &record.build()).await?;

            if evaluation.accepted {
                tracing::debug!(
                    substep_id = %substep.id,
                    attempt,
                    score = evaluation.score.value,
                    "substep accepted"
                );
                return Ok(SubstepResult::Accepted { output, usage });
            }

            let failed: Vec<String> = evaluation
                .score
                .failed_checks()
                .map(|c| c.name.clone())
                .collect();
            last_message = format!(
                "quality gate failed (score {:.2}, failed checks: {})",
                evaluation.score.value,
                if failed.is_empty() {
                    "none".to_string()
                } else {
                    failed.join(", ")
                }
            );
            tracing::debug!(
                substep_id = %substep.id,
                attempt,
                score = evaluation.score.value,
                "substep rejected by quality gate"
            );
            quality_failure = Some((output, evaluation.score));
        }

        Ok(SubstepResult::Exhausted {
            message: format!(
                "substep '{}' exhausted {max_attempts} attempts, last failure: {last_message}",
                substep.id
            ),
            usage,
        })
    }

    /// `None` means "retry"; `Some` is a terminal result.
    fn classify(
        &self,
        failure: &AttemptFailure,
        substep_id: &str,
        attempt: u32,
        max_attempts: u32,
        usage: TokenUsage,
    ) -> Option<SubstepResult> {
        if !failure.transient {
            return Some(SubstepResult::Fatal {
                message: format!("substep '{substep_id}' failed: {}", failure.message),
                usage,
            });
        }
        if FeedbackComposer::should_retry(max_attempts, attempt) {
            None
        } else {
            Some(SubstepResult::Exhausted {
                message: format!(
                    "substep '{substep_id}' exhausted {max_attempts} attempts, last failure: {}",
                    failure.message
                ),
                usage,
            })
        }
    }

    fn prepare_input(
        &self,
        substep: &SubstepDefinition,
        ctx: &ExecutionContext,
    ) -> Result<TaskInput, String> {
        match &substep.task {
            TaskSpec::Prompt { template, .. } => ctx
                .render_template(template)
                .map(|base| TaskInput::Prompt { base })
                .map_err(|e| e.to_string()),
            TaskSpec::Function { .. } | TaskSpec::ApiCall { .. } => Ok(TaskInput::Payload {
                base: ctx.to_payload(),
            }),
        }
    }

    /// The input actually sent on this attempt, with feedback layered
    /// in after a quality failure. Returns the audit string and, for
    /// payload tasks, the JSON to send.
    fn input_for_attempt(
        &self,
        base: &TaskInput,
        quality_failure: &Option<(String, QualityScore)>,
        attempt: u32,
        max_attempts: u32,
    ) -> (String, Option<serde_json::Value>) {
        match base {
            TaskInput::Prompt { base } => {
                let input = match quality_failure {
                    Some((output, score)) => {
                        FeedbackComposer::compose(base, output, score, attempt - 1, max_attempts)
                    }
                    None => base.clone(),
                };
                (input, None)
            }
            TaskInput::Payload { base } => {
                let mut payload = base.clone();
                if let Some((output, score)) = quality_failure {
                    if let Some(object) = payload.as_object_mut() {
                        object.insert(
                            "feedback".to_string(),
                            serde_json::Value::String(FeedbackComposer::revision_notes(
                                output,
                                score,
                                attempt - 1,
                                max_attempts,
                            )),
                        );
                    }
                }
                (payload.to_string(), Some(payload))
            }
        }
    }

    async fn fetch_retrieval(
        &self,
        retriever: &BoxRetriever,
        query: &str,
    ) -> Result<Option<String>, RetrievalError> {
        let timeout = self.request_timeout();
        let chunks = tokio::time::timeout(timeout, retriever.retrieve(query, self.retrieval_top_k))
            .await
            .map_err(|_| RetrievalError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })??;
        if chunks.is_empty() {
            return Ok(None);
        }
        let joined = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(CHUNK_SEPARATOR);
        Ok(Some(joined))
    }

    async fn execute_task(
        &self,
        substep: &SubstepDefinition,
        rendered_input: &str,
        payload: Option<serde_json::Value>,
        retrieval_context: Option<&str>,
    ) -> Result<(String, TokenUsage), AttemptFailure> {
        let timeout = self.request_timeout();
        match &substep.task {
            TaskSpec::Prompt { .. } => {
                let prompt = match retrieval_context {
                    Some(context) => {
                        format!("Relevant context:\n{context}\n\n{rendered_input}")
                    }
                    None => rendered_input.to_string(),
                };
                let request = GenerationRequest::new(prompt);
                let response = tokio::time::timeout(timeout, self.generator.generate(request))
                    .await
                    .map_err(|_| ProviderError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                    .and_then(|r| r)
                    .map_err(|e| AttemptFailure {
                        transient: e.is_transient(),
                        message: e.to_string(),
                    })?;
                Ok((response.text, response.usage))
            }
            TaskSpec::Function { handler } => {
                let payload = payload.unwrap_or_else(|| serde_json::json!({}));
                let output = tokio::time::timeout(timeout, self.functions.invoke(handler, payload))
                    .await
                    .map_err(|_| TaskError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                    .and_then(|r| r)
                    .map_err(|e| AttemptFailure {
                        transient: e.is_transient(),
                        message: e.to_string(),
                    })?;
                Ok((output, TokenUsage::default()))
            }
            TaskSpec::ApiCall { endpoint, method } => {
                let Some(http) = &self.http else {
                    return Err(AttemptFailure {
                        message: "no HTTP transport configured for api_call tasks".to_string(),
                        transient: false,
                    });
                };
                let payload = payload.unwrap_or_else(|| serde_json::json!({}));
                let output =
                    tokio::time::timeout(timeout, http.call(method, endpoint, &payload))
                        .await
                        .map_err(|_| TaskError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        })
                        .and_then(|r| r)
                        .map_err(|e| AttemptFailure {
                            transient: e.is_transient(),
                            message: e.to_string(),
                        })?;
                Ok((output, TokenUsage::default()))
            }
        }
    }

    async fn evaluate_with_timeout(
        &self,
        output: &str,
        substep: &SubstepDefinition,
    ) -> Result<super::evaluate::Evaluation, AttemptFailure> {
        let timeout = self.request_timeout();
        tokio::time::timeout(timeout, self.evaluator.evaluate(output, &substep.criteria))
            .await
            .map_err(|_| ProviderError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
            .and_then(|r| r)
            .map_err(|e| AttemptFailure {
                transient: e.is_transient(),
                message: format!("evaluation failed: {e}"),
            })
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.request_timeout_secs.max(1))
    }
}

fn wants_retrieval(substep: &SubstepDefinition) -> bool {
    matches!(
        substep.task,
        TaskSpec::Prompt {
            use_retrieval: true,
            ..
        }
    )
}

fn base_query(base: &TaskInput) -> &str {
    match base {
        TaskInput::Prompt { base } => base,
        TaskInput::Payload { .. } => "",
    }
}

fn template_of(substep: &SubstepDefinition) -> &str {
    match &substep.task {
        TaskSpec::Prompt { template, .. } => template,
        TaskSpec::Function { handler } => handler,
        TaskSpec::ApiCall { endpoint, .. } => endpoint,
    }
}

/// Field bundle for building a [`SubstepAttempt`].
struct AttemptRecord<'a> {
    step_id: &'a str,
    step_attempt: u32,
    substep_id: &'a str,
    attempt: u32,
    rendered_input: String,
    retrieval_context: Option<String>,
    output: Option<String>,
    score: Option<QualityScore>,
    accepted: bool,
    error: Option<String>,
    usage: TokenUsage,
    started: Instant,
}

impl AttemptRecord<'_> {
    fn build(self) -> SubstepAttempt {
        SubstepAttempt {
            id: Uuid::now_v7(),
            step_id: self.step_id.to_string(),
            step_attempt: self.step_attempt,
            substep_id: self.substep_id.to_string(),
            attempt: self.attempt,
            rendered_input: self.rendered_input,
            retrieval_context: self.retrieval_context,
            output: self.output,
            score: self.score,
            accepted: self.accepted,
            error: self.error,
            usage: self.usage,
            latency_ms: self.started.elapsed().as_millis() as u64,
            recorded_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
