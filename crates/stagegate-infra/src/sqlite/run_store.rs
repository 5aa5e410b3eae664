//! SQLite run store implementation.
//!
//! Implements `RunStore` from `stagegate-core` using sqlx with split
//! read/write pools. Workflow definitions and execution contexts are
//! stored as JSON blobs; the attempt log is a plain append-only table
//! so correction history can be queried directly.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use stagegate_core::store::{RunStore, StoredRun};
use stagegate_types::error::StoreError;
use stagegate_types::run::{QualityScore, RunStatus, RunSummary, SubstepAttempt, TokenUsage};
use stagegate_types::workflow::WorkflowDefinition;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunStore`.
pub struct SqliteRunStore {
    pool: DatabasePool,
}

impl SqliteRunStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    definition: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, StoreError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| StoreError::Serialization(format!("invalid workflow definition JSON: {e}")))
    }
}

struct RunRow {
    run_id: String,
    workflow_id: String,
    workflow_name: String,
    status: String,
    context: String,
    error: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            error: row.try_get("error")?,
            prompt_tokens: row.try_get("prompt_tokens")?,
            completion_tokens: row.try_get("completion_tokens")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self) -> Result<StoredRun, StoreError> {
        let run_id = parse_uuid(&self.run_id)?;
        let status = parse_status(&self.status)?;

        let context = serde_json::from_str(&self.context)
            .map_err(|e| StoreError::Serialization(format!("invalid context JSON: {e}")))?;

        let created_at = parse_datetime(&self.created_at)?;
        let updated_at = parse_datetime(&self.updated_at)?;

        Ok(StoredRun {
            run_id,
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name,
            status,
            context,
            usage: TokenUsage::new(self.prompt_tokens as u64, self.completion_tokens as u64),
            error: self.error,
            created_at,
            updated_at,
        })
    }
}

struct AttemptRow {
    id: String,
    step_id: String,
    step_attempt: i64,
    substep_id: String,
    attempt: i64,
    rendered_input: String,
    retrieval_context: Option<String>,
    output: Option<String>,
    score: Option<f64>,
    checks: Option<String>,
    accepted: bool,
    error: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    latency_ms: i64,
    recorded_at: String,
}

impl AttemptRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            step_id: row.try_get("step_id")?,
            step_attempt: row.try_get("step_attempt")?,
            substep_id: row.try_get("substep_id")?,
            attempt: row.try_get("attempt")?,
            rendered_input: row.try_get("rendered_input")?,
            retrieval_context: row.try_get("retrieval_context")?,
            output: row.try_get("output")?,
            score: row.try_get("score")?,
            checks: row.try_get("checks")?,
            accepted: row.try_get("accepted")?,
            error: row.try_get("error")?,
            prompt_tokens: row.try_get("prompt_tokens")?,
            completion_tokens: row.try_get("completion_tokens")?,
            latency_ms: row.try_get("latency_ms")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_attempt(self) -> Result<SubstepAttempt, StoreError> {
        let id = parse_uuid(&self.id)?;
        let recorded_at = parse_datetime(&self.recorded_at)?;

        let score = match self.score {
            Some(value) => {
                let checks = match self.checks.as_deref() {
                    Some(raw) => serde_json::from_str(raw)
                        .map_err(|e| StoreError::Serialization(format!("invalid checks JSON: {e}")))?,
                    None => Vec::new(),
                };
                Some(QualityScore { value, checks })
            }
            None => None,
        };

        Ok(SubstepAttempt {
            id,
            step_id: self.step_id,
            step_attempt: self.step_attempt as u32,
            substep_id: self.substep_id,
            attempt: self.attempt as u32,
            rendered_input: self.rendered_input,
            retrieval_context: self.retrieval_context,
            output: self.output,
            score,
            accepted: self.accepted,
            error: self.error,
            usage: TokenUsage::new(self.prompt_tokens as u64, self.completion_tokens as u64),
            latency_ms: self.latency_ms as u64,
            recorded_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    s.parse::<Uuid>()
        .map_err(|e| StoreError::Query(format!("invalid UUID: {e}")))
}

fn parse_status(s: &str) -> Result<RunStatus, StoreError> {
    s.parse::<RunStatus>().map_err(StoreError::Query)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Map a write error, turning foreign-key violations into `NotFound`.
fn map_write_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db)
            if matches!(db.kind(), sqlx::error::ErrorKind::ForeignKeyViolation) =>
        {
            StoreError::NotFound
        }
        _ => StoreError::Query(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// RunStore impl
// ---------------------------------------------------------------------------

impl RunStore for SqliteRunStore {
    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let definition_json = serde_json::to_string(definition)
            .map_err(|e| StoreError::Serialization(format!("serialize definition: {e}")))?;

        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, name, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&definition.id)
        .bind(&definition.name)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_definition(&self, workflow_id: &str) -> Result<WorkflowDefinition, StoreError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row)
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                r.into_definition()
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn save_run(&self, run: &StoredRun) -> Result<(), StoreError> {
        let context_json = serde_json::to_string(&run.context)
            .map_err(|e| StoreError::Serialization(format!("serialize context: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (run_id, workflow_id, workflow_name, status, context, error,
                prompt_tokens, completion_tokens, total_tokens, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                 status = excluded.status,
                 context = excluded.context,
                 error = excluded.error,
                 prompt_tokens = excluded.prompt_tokens,
                 completion_tokens = excluded.completion_tokens,
                 total_tokens = excluded.total_tokens,
                 updated_at = excluded.updated_at"#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.workflow_id)
        .bind(&run.workflow_name)
        .bind(run.status.as_str())
        .bind(&context_json)
        .bind(&run.error)
        .bind(run.usage.prompt_tokens as i64)
        .bind(run.usage.completion_tokens as i64)
        .bind(run.usage.total_tokens as i64)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<StoredRun, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(|e| StoreError::Query(e.to_string()))?;
                r.into_run()
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<RunSummary>, StoreError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM workflow_runs WHERE status = ? ORDER BY updated_at DESC LIMIT ?",
                )
                .bind(s.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_runs ORDER BY updated_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(|e| StoreError::Query(e.to_string()))?;
            summaries.push(r.into_run()?.summary());
        }
        Ok(summaries)
    }

    async fn append_attempt(
        &self,
        run_id: Uuid,
        attempt: &SubstepAttempt,
    ) -> Result<(), StoreError> {
        let checks_json = attempt
            .score
            .as_ref()
            .map(|s| serde_json::to_string(&s.checks))
            .transpose()
            .map_err(|e| StoreError::Serialization(format!("serialize checks: {e}")))?;

        sqlx::query(
            r#"INSERT INTO attempt_log
               (id, run_id, step_id, step_attempt, substep_id, attempt,
                rendered_input, retrieval_context, output, score, checks, accepted,
                error, prompt_tokens, completion_tokens, latency_ms, recorded_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(attempt.id.to_string())
        .bind(run_id.to_string())
        .bind(&attempt.step_id)
        .bind(attempt.step_attempt as i64)
        .bind(&attempt.substep_id)
        .bind(attempt.attempt as i64)
        .bind(&attempt.rendered_input)
        .bind(&attempt.retrieval_context)
        .bind(&attempt.output)
        .bind(attempt.score.as_ref().map(|s| s.value))
        .bind(&checks_json)
        .bind(attempt.accepted)
        .bind(&attempt.error)
        .bind(attempt.usage.prompt_tokens as i64)
        .bind(attempt.usage.completion_tokens as i64)
        .bind(attempt.latency_ms as i64)
        .bind(format_datetime(&attempt.recorded_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        Ok(())
    }

    async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<SubstepAttempt>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM attempt_log WHERE run_id = ? ORDER BY recorded_at ASC, id ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut attempts = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = AttemptRow::from_row(row).map_err(|e| StoreError::Query(e.to_string()))?;
            attempts.push(r.into_attempt()?);
        }
        Ok(attempts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
