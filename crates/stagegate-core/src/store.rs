//! Durable run storage.
//!
//! The engine checkpoints through [`RunStore`] and never sees a backend
//! directly. SQLite and JSON-file backends live in the infra crate;
//! [`MemoryRunStore`] here backs tests and embedded use.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use stagegate_types::error::StoreError;
use stagegate_types::run::{RunStatus, RunSummary, SubstepAttempt, TokenUsage};
use stagegate_types::workflow::WorkflowDefinition;

use crate::workflow::context::ExecutionContext;

// ---------------------------------------------------------------------------
// Stored run record
// ---------------------------------------------------------------------------

/// The durable state of one run: everything `resume` needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRun {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    /// Bindings plus the cursor; serialized as one JSON document.
    pub context: ExecutionContext,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRun {
    /// Listing row for this run.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            workflow_id: self.workflow_id.clone(),
            workflow_name: self.workflow_name.clone(),
            status: self.status,
            usage: self.usage,
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// RunStore trait
// ---------------------------------------------------------------------------

/// Storage backend for definitions, run state, and the attempt log.
///
/// `save_run` is an upsert keyed by `run_id`; the engine calls it for
/// both creation and every checkpoint. `append_attempt` is append-only
/// and must be durable before it returns.
pub trait RunStore: Send + Sync {
    /// Persist a workflow definition, replacing any previous version
    /// under the same id.
    fn put_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get_definition(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<WorkflowDefinition, StoreError>> + Send;

    fn save_run(
        &self,
        run: &StoredRun,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get_run(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<StoredRun, StoreError>> + Send;

    /// Most recently updated first.
    fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<RunSummary>, StoreError>> + Send;

    fn append_attempt(
        &self,
        run_id: Uuid,
        attempt: &SubstepAttempt,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// In insertion order.
    fn list_attempts(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<SubstepAttempt>, StoreError>> + Send;

    /// Whether per-substep checkpoints are cheap enough to take. The
    /// JSON backend rewrites a whole file per checkpoint and opts out;
    /// step-boundary checkpoints still happen regardless.
    fn supports_fine_grained_checkpoints(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Object-safe wrapper
// ---------------------------------------------------------------------------

/// Object-safe version of [`RunStore`] with boxed futures.
pub trait RunStoreDyn: Send + Sync {
    fn put_definition_boxed<'a>(
        &'a self,
        definition: &'a WorkflowDefinition,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn get_definition_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<WorkflowDefinition, StoreError>> + Send + 'a>>;

    fn save_run_boxed<'a>(
        &'a self,
        run: &'a StoredRun,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn get_run_boxed(
        &self,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<StoredRun, StoreError>> + Send + '_>>;

    fn list_runs_boxed(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RunSummary>, StoreError>> + Send + '_>>;

    fn append_attempt_boxed<'a>(
        &'a self,
        run_id: Uuid,
        attempt: &'a SubstepAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn list_attempts_boxed(
        &self,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SubstepAttempt>, StoreError>> + Send + '_>>;

    fn supports_fine_grained_checkpoints_dyn(&self) -> bool;
}

impl<T: RunStore> RunStoreDyn for T {
    fn put_definition_boxed<'a>(
        &'a self,
        definition: &'a WorkflowDefinition,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.put_definition(definition))
    }

    fn get_definition_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<WorkflowDefinition, StoreError>> + Send + 'a>> {
        Box::pin(self.get_definition(workflow_id))
    }

    fn save_run_boxed<'a>(
        &'a self,
        run: &'a StoredRun,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.save_run(run))
    }

    fn get_run_boxed(
        &self,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<StoredRun, StoreError>> + Send + '_>> {
        Box::pin(self.get_run(run_id))
    }

    fn list_runs_boxed(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RunSummary>, StoreError>> + Send + '_>> {
        Box::pin(self.list_runs(status, limit))
    }

    fn append_attempt_boxed<'a>(
        &'a self,
        run_id: Uuid,
        attempt: &'a SubstepAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.append_attempt(run_id, attempt))
    }

    fn list_attempts_boxed(
        &self,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SubstepAttempt>, StoreError>> + Send + '_>> {
        Box::pin(self.list_attempts(run_id))
    }

    fn supports_fine_grained_checkpoints_dyn(&self) -> bool {
        self.supports_fine_grained_checkpoints()
    }
}

/// Type-erased run store for runtime backend selection.
///
/// Implements [`RunStore`] itself, so the engine can stay generic while
/// the CLI picks SQLite or JSON at startup.
pub struct BoxRunStore {
    inner: Box<dyn RunStoreDyn + Send + Sync>,
}

impl BoxRunStore {
    pub fn new<T: RunStore + 'static>(store: T) -> Self {
        Self {
            inner: Box::new(store),
        }
    }
}

impl RunStore for BoxRunStore {
    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        self.inner.put_definition_boxed(definition).await
    }

    async fn get_definition(&self, workflow_id: &str) -> Result<WorkflowDefinition, StoreError> {
        self.inner.get_definition_boxed(workflow_id).await
    }

    async fn save_run(&self, run: &StoredRun) -> Result<(), StoreError> {
        self.inner.save_run_boxed(run).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<StoredRun, StoreError> {
        self.inner.get_run_boxed(run_id).await
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<RunSummary>, StoreError> {
        self.inner.list_runs_boxed(status, limit).await
    }

    async fn append_attempt(
        &self,
        run_id: Uuid,
        attempt: &SubstepAttempt,
    ) -> Result<(), StoreError> {
        self.inner.append_attempt_boxed(run_id, attempt).await
    }

    async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<SubstepAttempt>, StoreError> {
        self.inner.list_attempts_boxed(run_id).await
    }

    fn supports_fine_grained_checkpoints(&self) -> bool {
        self.inner.supports_fine_grained_checkpoints_dyn()
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Non-durable store for tests and embedded use.
#[derive(Default)]
pub struct MemoryRunStore {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    runs: RwLock<HashMap<Uuid, StoredRun>>,
    attempts: RwLock<HashMap<Uuid, Vec<SubstepAttempt>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn get_definition(&self, workflow_id: &str) -> Result<WorkflowDefinition, StoreError> {
        self.definitions
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn save_run(&self, run: &StoredRun) -> Result<(), StoreError> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<StoredRun, StoreError> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<RunSummary>, StoreError> {
        let runs = self.runs.read().await;
        let mut summaries: Vec<RunSummary> = runs
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .map(StoredRun::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.truncate(limit as usize);
        Ok(summaries)
    }

    async fn append_attempt(
        &self,
        run_id: Uuid,
        attempt: &SubstepAttempt,
    ) -> Result<(), StoreError> {
        if !self.runs.read().await.contains_key(&run_id) {
            return Err(StoreError::NotFound);
        }
        self.attempts
            .write()
            .await
            .entry(run_id)
            .or_default()
            .push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<SubstepAttempt>, StoreError> {
        Ok(self
            .attempts
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}
