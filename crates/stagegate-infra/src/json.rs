//! JSON-file run store implementation.
//!
//! One `{run_id}.json` file per run (checkpoint state plus its attempt
//! log) and a shared `definitions.json`, all under a single directory.
//! Every write lands in a `.tmp` sibling first and is renamed into
//! place, so an interrupted write never truncates a checkpoint.
//!
//! Rewriting a whole file per checkpoint is too slow for per-substep
//! granularity, so this backend opts out of fine-grained checkpoints;
//! the engine then checkpoints at step boundaries only.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use stagegate_core::store::{RunStore, StoredRun};
use stagegate_types::error::StoreError;
use stagegate_types::run::{RunStatus, RunSummary, SubstepAttempt};
use stagegate_types::workflow::WorkflowDefinition;

const DEFINITIONS_FILE: &str = "definitions.json";

/// JSON-file-backed implementation of `RunStore`.
pub struct JsonRunStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on the files.
    write_lock: Mutex<()>,
}

/// On-disk shape of one run file.
#[derive(Serialize, Deserialize)]
struct RunFile {
    run: StoredRun,
    #[serde(default)]
    attempts: Vec<SubstepAttempt>,
}

impl JsonRunStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error(&root, e))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join(format!("{run_id}.json"))
    }

    fn definitions_path(&self) -> PathBuf {
        self.root.join(DEFINITIONS_FILE)
    }

    async fn read_definitions(
        &self,
    ) -> Result<BTreeMap<String, WorkflowDefinition>, StoreError> {
        match read_json(&self.definitions_path()).await? {
            Some(definitions) => Ok(definitions),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn read_run_file(&self, run_id: Uuid) -> Result<RunFile, StoreError> {
        read_json(&self.run_path(run_id))
            .await?
            .ok_or(StoreError::NotFound)
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

/// Read and parse a JSON file, `None` when it does not exist.
async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| json_error(path, e))
}

/// Write a JSON file through a `.tmp` sibling and an atomic rename.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let body = serde_json::to_vec_pretty(value).map_err(|e| json_error(path, e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &body)
        .await
        .map_err(|e| io_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {e}", path.display()))
}

fn json_error(path: &Path, e: serde_json::Error) -> StoreError {
    StoreError::Serialization(format!("{}: {e}", path.display()))
}

// ---------------------------------------------------------------------------
// RunStore impl
// ---------------------------------------------------------------------------

impl RunStore for JsonRunStore {
    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut definitions = self.read_definitions().await?;
        definitions.insert(definition.id.clone(), definition.clone());
        write_json(&self.definitions_path(), &definitions).await
    }

    async fn get_definition(&self, workflow_id: &str) -> Result<WorkflowDefinition, StoreError> {
        self.read_definitions()
            .await?
            .remove(workflow_id)
            .ok_or(StoreError::NotFound)
    }

    async fn save_run(&self, run: &StoredRun) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let attempts = match read_json::<RunFile>(&self.run_path(run.run_id)).await? {
            Some(existing) => existing.attempts,
            None => Vec::new(),
        };
        let file = RunFile {
            run: run.clone(),
            attempts,
        };
        write_json(&self.run_path(run.run_id), &file).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<StoredRun, StoreError> {
        Ok(self.read_run_file(run_id).await?.run)
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<RunSummary>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.root, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if path.file_name().and_then(|name| name.to_str()) == Some(DEFINITIONS_FILE) {
                continue;
            }
            let Some(file) = read_json::<RunFile>(&path).await? else {
                continue;
            };
            if status.is_none_or(|s| file.run.status == s) {
                summaries.push(file.run.summary());
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.truncate(limit as usize);
        Ok(summaries)
    }

    async fn append_attempt(
        &self,
        run_id: Uuid,
        attempt: &SubstepAttempt,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read_run_file(run_id).await?;
        file.attempts.push(attempt.clone());
        write_json(&self.run_path(run_id), &file).await
    }

    async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<SubstepAttempt>, StoreError> {
        match read_json::<RunFile>(&self.run_path(run_id)).await? {
            Some(file) => Ok(file.attempts),
            None => Ok(Vec::new()),
        }
    }

    fn supports_fine_grained_checkpoints(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stagegate_core::workflow::ExecutionContext;
    use stagegate_types::run::{QualityScore, TokenUsage};
    use stagegate_types::workflow::{
        StepDefinition, SubstepDefinition, SuccessCriteria, TaskSpec,
    };

    fn sample_definition(id: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            name: "Sample".to_string(),
            steps: vec![StepDefinition {
                id: "only".to_string(),
                substeps: vec![SubstepDefinition {
                    id: "sub".to_string(),
                    task: TaskSpec::Prompt {
                        template: "Do {input}".to_string(),
                        use_retrieval: false,
                    },
                    criteria: SuccessCriteria::default(),
                }],
                criteria: SuccessCriteria::default(),
                max_retries: None,
                aggregation: Default::default(),
            }],
        }
    }

    fn sample_run(workflow_id: &str) -> StoredRun {
        let now = Utc::now();
        StoredRun {
            run_id: Uuid::now_v7(),
            workflow_id: workflow_id.to_string(),
            workflow_name: "Sample".to_string(),
            status: RunStatus::Pending,
            context: ExecutionContext::new("hello"),
            usage: TokenUsage::default(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_attempt(attempt: u32) -> SubstepAttempt {
        SubstepAttempt {
            id: Uuid::now_v7(),
            step_id: "only".to_string(),
            step_attempt: 1,
            substep_id: "sub".to_string(),
            attempt,
            rendered_input: "Do hello".to_string(),
            retrieval_context: None,
            output: Some("done".to_string()),
            score: Some(QualityScore::auto_pass()),
            accepted: true,
            error: None,
            usage: TokenUsage::new(3, 5),
            latency_ms: 10,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_run_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::open(dir.path()).await.unwrap();

        let run = sample_run("wf");
        store.save_run(&run).await.unwrap();

        let loaded = store.get_run(run.run_id).await.unwrap();
        assert_eq!(loaded, run);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let run = sample_run("wf");
        {
            let store = JsonRunStore::open(dir.path()).await.unwrap();
            store.put_definition(&sample_definition("wf")).await.unwrap();
            store.save_run(&run).await.unwrap();
            store
                .append_attempt(run.run_id, &sample_attempt(1))
                .await
                .unwrap();
        }

        let reopened = JsonRunStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get_definition("wf").await.unwrap().name, "Sample");
        assert_eq!(reopened.get_run(run.run_id).await.unwrap(), run);
        assert_eq!(reopened.list_attempts(run.run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_run_preserves_attempt_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::open(dir.path()).await.unwrap();

        let mut run = sample_run("wf");
        store.save_run(&run).await.unwrap();
        store
            .append_attempt(run.run_id, &sample_attempt(1))
            .await
            .unwrap();

        run.status = RunStatus::Completed;
        store.save_run(&run).await.unwrap();

        assert_eq!(store.get_run(run.run_id).await.unwrap().status, RunStatus::Completed);
        assert_eq!(store.list_attempts(run.run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_records_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::open(dir.path()).await.unwrap();

        assert!(matches!(
            store.get_run(Uuid::now_v7()).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.get_definition("ghost").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.append_attempt(Uuid::now_v7(), &sample_attempt(1)).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_attempts_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::open(dir.path()).await.unwrap();

        let run = sample_run("wf");
        store.save_run(&run).await.unwrap();
        store
            .append_attempt(run.run_id, &sample_attempt(1))
            .await
            .unwrap();
        store
            .append_attempt(run.run_id, &sample_attempt(2))
            .await
            .unwrap();

        let log = store.list_attempts(run.run_id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].attempt, 1);
        assert_eq!(log[1].attempt, 2);
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::open(dir.path()).await.unwrap();

        let mut first = sample_run("wf");
        store.save_run(&first).await.unwrap();

        let mut second = sample_run("wf");
        second.status = RunStatus::Failed;
        second.updated_at = first.updated_at + chrono::Duration::seconds(5);
        store.save_run(&second).await.unwrap();

        first.updated_at += chrono::Duration::seconds(10);
        store.save_run(&first).await.unwrap();

        let all = store.list_runs(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].run_id, first.run_id);

        let failed = store.list_runs(Some(RunStatus::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].run_id, second.run_id);
    }

    #[tokio::test]
    async fn fine_grained_checkpoints_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::open(dir.path()).await.unwrap();
        assert!(!store.supports_fine_grained_checkpoints());
    }

    #[tokio::test]
    async fn test_no_tmp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::open(dir.path()).await.unwrap();

        let run = sample_run("wf");
        store.save_run(&run).await.unwrap();
        store
            .append_attempt(run.run_id, &sample_attempt(1))
            .await
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
