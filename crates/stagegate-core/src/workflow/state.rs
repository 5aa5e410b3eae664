//! Durable run-state transitions.
//!
//! Wraps [`RunStore`] with the status transitions the orchestrator is
//! allowed to make. Every transition is persisted before execution
//! moves forward, so a crashed run can resume from its last
//! checkpoint.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use stagegate_types::error::StoreError;
use stagegate_types::run::{RunStatus, TokenUsage};
use stagegate_types::workflow::WorkflowDefinition;

use crate::store::{RunStore, StoredRun};

use super::context::ExecutionContext;
use super::EngineError;

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

/// Manages run records and their status transitions.
///
/// Generic over `S: RunStore` so it works with any storage backend.
pub(crate) struct StateManager<S> {
    store: Arc<S>,
}

impl<S: RunStore> StateManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Creation and loading
    // -----------------------------------------------------------------------

    /// Persist the definition and a fresh `pending` run seeded with the
    /// initial input. The run is durable before anything executes.
    pub async fn create_run(
        &self,
        definition: &WorkflowDefinition,
        input: &str,
    ) -> Result<StoredRun, StoreError> {
        self.store.put_definition(definition).await?;

        let now = Utc::now();
        let run = StoredRun {
            run_id: Uuid::now_v7(),
            workflow_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            status: RunStatus::Pending,
            context: ExecutionContext::new(input),
            usage: TokenUsage::default(),
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.save_run(&run).await?;

        tracing::debug!(
            run_id = %run.run_id,
            workflow_id = %run.workflow_id,
            "created pending run"
        );
        Ok(run)
    }

    pub async fn load_run(&self, run_id: Uuid) -> Result<StoredRun, EngineError> {
        match self.store.get_run(run_id).await {
            Ok(run) => Ok(run),
            Err(StoreError::NotFound) => Err(EngineError::RunNotFound(run_id)),
            Err(err) => Err(EngineError::Store(err)),
        }
    }

    pub async fn load_definition(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowDefinition, EngineError> {
        match self.store.get_definition(workflow_id).await {
            Ok(definition) => Ok(definition),
            Err(StoreError::NotFound) => {
                Err(EngineError::WorkflowNotFound(workflow_id.to_string()))
            }
            Err(err) => Err(EngineError::Store(err)),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Persist the run as `running`.
    pub async fn start(&self, run: &mut StoredRun) -> Result<(), StoreError> {
        self.transition(run, RunStatus::Running, None).await
    }

    /// Persist a mid-run context checkpoint without changing status.
    pub async fn checkpoint(&self, run: &mut StoredRun) -> Result<(), StoreError> {
        run.updated_at = Utc::now();
        self.store.save_run(run).await?;
        tracing::debug!(
            run_id = %run.run_id,
            cursor = run.context.cursor(),
            "checkpointed run context"
        );
        Ok(())
    }

    /// Park the run as `paused` after a cooperative cancellation.
    pub async fn pause(&self, run: &mut StoredRun) -> Result<(), StoreError> {
        self.transition(run, RunStatus::Paused, None).await
    }

    /// Persist the run as `completed`, clearing any stale failure.
    pub async fn complete(&self, run: &mut StoredRun) -> Result<(), StoreError> {
        self.transition(run, RunStatus::Completed, None).await
    }

    /// Persist the run as `failed` with the failure detail attached.
    pub async fn fail(&self, run: &mut StoredRun, error: &str) -> Result<(), StoreError> {
        self.transition(run, RunStatus::Failed, Some(error)).await
    }

    async fn transition(
        &self,
        run: &mut StoredRun,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        run.status = status;
        run.error = error.map(str::to_string);
        run.updated_at = Utc::now();
        self.store.save_run(run).await?;

        tracing::debug!(
            run_id = %run.run_id,
            status = %status,
            "checkpointed run status"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
