//! Application state wiring configuration to concrete backends.
//!
//! `AppState` resolves the data directory, loads `config.toml`, and
//! opens the configured run store. The engine itself is built lazily
//! by the commands that execute workflows, so read-only commands
//! (`list`, `dashboard`) never touch provider credentials.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use stagegate_core::store::BoxRunStore;
use stagegate_core::workflow::orchestrator::Orchestrator;
use stagegate_core::{BoxHttpCaller, BoxRetriever};
use stagegate_infra::config::{load_engine_config, resolve_data_dir};
use stagegate_infra::llm::create_generator;
use stagegate_infra::sqlite::pool::DatabasePool;
use stagegate_infra::{JsonRunStore, ReqwestCaller, SqliteRunStore, StaticRetriever};
use stagegate_types::config::{EngineConfig, StorageBackend};

/// Shared CLI state: the configuration and the opened run store.
pub struct AppState {
    pub store: Arc<BoxRunStore>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data directory, load configuration, and open the
    /// configured storage backend.
    pub async fn init(data_dir_override: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir_override.unwrap_or_else(resolve_data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        tracing::debug!(
            data_dir = %data_dir.display(),
            backend = ?config.storage.backend,
            "initialized application state"
        );

        let store = match config.storage.backend {
            StorageBackend::Sqlite => {
                let db_path = config
                    .storage
                    .path
                    .clone()
                    .unwrap_or_else(|| data_dir.join("stagegate.db"));
                let pool = DatabasePool::open(&db_path)
                    .await
                    .with_context(|| format!("cannot open database {}", db_path.display()))?;
                BoxRunStore::new(SqliteRunStore::new(pool))
            }
            StorageBackend::Json => {
                let root = config
                    .storage
                    .path
                    .clone()
                    .unwrap_or_else(|| data_dir.join("runs"));
                let store = JsonRunStore::open(&root)
                    .await
                    .with_context(|| format!("cannot open run store at {}", root.display()))?;
                BoxRunStore::new(store)
            }
        };

        Ok(Self {
            store: Arc::new(store),
            config,
            data_dir,
        })
    }

    /// Build the engine for an attached run. `max_attempts_override`
    /// comes from `--max-retries` and replaces the configured substep
    /// attempt budget for this invocation only.
    pub async fn build_engine(
        &self,
        max_attempts_override: Option<u32>,
    ) -> anyhow::Result<Orchestrator<BoxRunStore>> {
        let generator =
            create_generator(&self.config.provider).context("cannot build model provider")?;

        let mut limits = self.config.limits.clone();
        if let Some(attempts) = max_attempts_override {
            limits.max_attempts = attempts.max(1);
        }

        let mut engine = Orchestrator::new(self.store.clone(), generator)
            .with_http(BoxHttpCaller::new(ReqwestCaller::new()))
            .with_limits(limits);

        if let Some(corpus) = &self.config.retrieval.corpus_file {
            let path = if corpus.is_absolute() {
                corpus.clone()
            } else {
                self.data_dir.join(corpus)
            };
            let retriever = StaticRetriever::load(&path)
                .await
                .with_context(|| format!("cannot load retrieval corpus {}", path.display()))?;
            engine = engine
                .with_retriever(BoxRetriever::new(retriever), self.config.retrieval.top_k);
        }

        Ok(engine)
    }
}
