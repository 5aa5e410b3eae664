//! Run orchestration: the status state machine and the step loop.
//!
//! The orchestrator validates a definition, seeds and checkpoints the
//! run, then walks its steps in order. Cancellation is cooperative and
//! observed only between steps, so a paused checkpoint always reflects
//! whole completed steps. `resume` picks any non-completed run back up
//! at its cursor from nothing but the run id.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stagegate_types::config::LimitSettings;
use stagegate_types::run::{RunStatus, TokenUsage};
use stagegate_types::workflow::{TaskSpec, WorkflowDefinition};

use crate::llm::BoxTextGenerator;
use crate::retrieval::BoxRetriever;
use crate::store::{RunStore, StoredRun};
use crate::task::{BoxHttpCaller, FunctionRegistry};

use super::state::StateManager;
use super::step::{StepOutcome, StepRunner};
use super::EngineError;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What a run produced, in any terminal or parked state.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// The last step's aggregated output; only set for completed runs.
    pub final_output: Option<String>,
    /// Every committed step output, keyed by step id.
    pub outputs: BTreeMap<String, String>,
    /// Token totals across all attempts, judge calls included.
    pub usage: TokenUsage,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine trait
// ---------------------------------------------------------------------------

/// The engine surface the CLI and embedding callers drive.
///
/// Uses RPITIT (`impl Future` in return position) rather than
/// `async_trait`, consistent with the project's Rust 2024 edition
/// approach.
pub trait WorkflowEngine: Send + Sync {
    /// Validate, persist, and run a workflow from scratch.
    fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: &str,
    ) -> impl std::future::Future<Output = Result<RunOutcome, EngineError>> + Send;

    /// Continue a persisted run from its checkpoint. Completed runs
    /// return their recorded outcome without executing anything.
    fn resume(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<RunOutcome, EngineError>> + Send;

    /// Signal a run to pause at its next step boundary. Returns whether
    /// a live run was signalled; an unknown id parks a pre-cancelled
    /// token for a drive that has not reached its first boundary yet.
    fn cancel(&self, run_id: Uuid) -> bool;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives runs over any [`RunStore`] backend.
pub struct Orchestrator<S: RunStore> {
    state: StateManager<S>,
    generator: Arc<BoxTextGenerator>,
    retriever: Option<Arc<BoxRetriever>>,
    retrieval_top_k: usize,
    functions: Arc<FunctionRegistry>,
    http: Option<Arc<BoxHttpCaller>>,
    limits: LimitSettings,
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl<S: RunStore> Orchestrator<S> {
    pub fn new(store: Arc<S>, generator: BoxTextGenerator) -> Self {
        Self {
            state: StateManager::new(store),
            generator: Arc::new(generator),
            retriever: None,
            retrieval_top_k: 4,
            functions: Arc::new(FunctionRegistry::new()),
            http: None,
            limits: LimitSettings::default(),
            cancellations: DashMap::new(),
        }
    }

    pub fn with_retriever(mut self, retriever: BoxRetriever, top_k: usize) -> Self {
        self.retriever = Some(Arc::new(retriever));
        self.retrieval_top_k = top_k.max(1);
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = Arc::new(functions);
        self
    }

    pub fn with_http(mut self, http: BoxHttpCaller) -> Self {
        self.http = Some(Arc::new(http));
        self
    }

    pub fn with_limits(mut self, limits: LimitSettings) -> Self {
        self.limits = limits;
        self
    }

    /// Validate the definition and persist a pending run without
    /// executing it. Callers that need the run id before the first step
    /// starts (the CLI's Ctrl-C handler does) pair this with [`drive`].
    ///
    /// [`drive`]: Orchestrator::drive
    pub async fn prepare(
        &self,
        definition: &WorkflowDefinition,
        input: &str,
    ) -> Result<Uuid, EngineError> {
        definition.validate()?;
        for step in &definition.steps {
            for substep in &step.substeps {
                if let TaskSpec::Function { handler } = &substep.task {
                    if !self.functions.contains(handler) {
                        return Err(EngineError::HandlerNotRegistered {
                            substep_id: substep.id.clone(),
                            handler: handler.clone(),
                        });
                    }
                }
            }
        }

        let run = self.state.create_run(definition, input).await?;
        self.cancellations
            .insert(run.run_id, CancellationToken::new());

        tracing::info!(
            run_id = %run.run_id,
            workflow = definition.name.as_str(),
            steps = definition.steps.len(),
            "prepared workflow run"
        );
        Ok(run.run_id)
    }

    /// Run a prepared or persisted run to its next terminal or parked
    /// state. The cancellation token is dropped on the way out; a later
    /// resume starts with a fresh one.
    pub async fn drive(&self, run_id: Uuid) -> Result<RunOutcome, EngineError> {
        let result = self.drive_inner(run_id).await;
        self.cancellations.remove(&run_id);
        result
    }

    async fn drive_inner(&self, run_id: Uuid) -> Result<RunOutcome, EngineError> {
        let mut run = self.state.load_run(run_id).await?;
        let definition = self.state.load_definition(&run.workflow_id).await?;

        if run.status == RunStatus::Completed {
            tracing::debug!(run_id = %run_id, "run already completed, returning recorded outcome");
            return Ok(build_outcome(&run, &definition));
        }
        if run.status == RunStatus::Failed {
            tracing::info!(
                run_id = %run_id,
                cursor = run.context.cursor(),
                "re-running failed step with a fresh budget"
            );
        }

        let token = self
            .cancellations
            .entry(run_id)
            .or_insert_with(CancellationToken::new)
            .value()
            .clone();

        // Starting clears any failure detail from a prior session.
        self.state.start(&mut run).await?;

        let runner = self.step_runner();
        let steps = &definition.steps;

        while run.context.cursor() < steps.len() {
            if token.is_cancelled() {
                self.state.pause(&mut run).await?;
                tracing::info!(
                    run_id = %run_id,
                    cursor = run.context.cursor(),
                    "run paused at step boundary"
                );
                return Ok(build_outcome(&run, &definition));
            }

            let step = &steps[run.context.cursor()];
            tracing::info!(
                run_id = %run_id,
                step_id = step.id.as_str(),
                position = run.context.cursor() + 1,
                total = steps.len(),
                "running step"
            );

            match runner.run_step(self.state.store(), &mut run, step).await? {
                StepOutcome::Passed { .. } => {
                    run.context.advance();
                    self.state.checkpoint(&mut run).await?;
                }
                StepOutcome::Failed { message } => {
                    self.state.fail(&mut run, &message).await?;
                    tracing::warn!(
                        run_id = %run_id,
                        step_id = step.id.as_str(),
                        error = message.as_str(),
                        "run failed"
                    );
                    return Ok(build_outcome(&run, &definition));
                }
            }
        }

        self.state.complete(&mut run).await?;
        tracing::info!(
            run_id = %run_id,
            total_tokens = run.usage.total_tokens,
            "run completed"
        );
        Ok(build_outcome(&run, &definition))
    }

    fn step_runner(&self) -> StepRunner {
        StepRunner::new(
            self.generator.clone(),
            self.retriever.clone(),
            self.retrieval_top_k,
            self.functions.clone(),
            self.http.clone(),
            self.limits.clone(),
        )
    }
}

impl<S: RunStore> WorkflowEngine for Orchestrator<S> {
    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: &str,
    ) -> Result<RunOutcome, EngineError> {
        let run_id = self.prepare(definition, input).await?;
        self.drive(run_id).await
    }

    async fn resume(&self, run_id: Uuid) -> Result<RunOutcome, EngineError> {
        self.drive(run_id).await
    }

    fn cancel(&self, run_id: Uuid) -> bool {
        let was_live = self.cancellations.contains_key(&run_id);
        self.cancellations
            .entry(run_id)
            .or_default()
            .value()
            .cancel();
        tracing::info!(run_id = %run_id, was_live, "cancellation requested");
        was_live
    }
}

fn build_outcome(run: &StoredRun, definition: &WorkflowDefinition) -> RunOutcome {
    let final_output = match run.status {
        RunStatus::Completed => definition
            .steps
            .last()
            .and_then(|step| run.context.get(&step.id))
            .map(str::to_string),
        _ => None,
    };
    RunOutcome {
        run_id: run.run_id,
        status: run.status,
        final_output,
        outputs: run.context.step_outputs(),
        usage: run.usage,
        error: run.error.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
