//! Engine configuration.
//!
//! Deserialized from `config.toml` in the data directory; every section
//! and field is optional and falls back to defaults, so a missing or
//! partial file still yields a working configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::llm::ProviderKind;

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub provider: ProviderSettings,
    pub retrieval: RetrievalSettings,
    pub storage: StorageSettings,
    pub limits: LimitSettings,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Which model endpoint serves generation and judge calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    /// Override the provider's default endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key. OpenAI defaults to
    /// `OPENAI_API_KEY`; Ollama needs none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Ollama,
            model: default_model(),
            base_url: None,
            api_key_env: None,
            temperature: None,
        }
    }
}

/// Corpus-backed retrieval for prompt tasks that opt in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Plain-text corpus file, split into paragraph chunks. Retrieval
    /// is disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_file: Option<PathBuf>,
    /// Chunks returned per query.
    pub top_k: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            corpus_file: None,
            top_k: default_top_k(),
        }
    }
}

/// Where run state is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Override the default location inside the data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// SQLite database with per-step checkpoints and the attempt log.
    #[default]
    Sqlite,
    /// One JSON file per run, checkpointed at step boundaries only.
    Json,
}

/// Retry budgets and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitSettings {
    /// Attempts per substep before the run fails.
    pub max_attempts: u32,
    /// Whole-step re-runs after a step gate failure, for steps that do
    /// not declare their own `max_retries`.
    pub step_retries: u32,
    /// Timeout applied to each provider, task, and retrieval call.
    pub request_timeout_secs: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            step_retries: 0,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_top_k() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_request_timeout_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let config = EngineConfig::default();
        assert_eq!(config.provider.kind, ProviderKind::Ollama);
        assert_eq!(config.provider.model, "llama3.2");
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.limits.max_attempts, 3);
        assert_eq!(config.limits.step_retries, 0);
        assert_eq!(config.limits.request_timeout_secs, 60);
        assert_eq!(config.retrieval.top_k, 4);
        assert!(config.retrieval.corpus_file.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
[provider]
kind = "openai"
model = "gpt-4o-mini"
"#,
        )
        .unwrap();
        assert_eq!(config.provider.kind, ProviderKind::OpenAi);
        assert_eq!(config.provider.model, "gpt-4o-mini");
        assert_eq!(config.limits.max_attempts, 3);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    }

    #[test]
    fn test_full_toml_parses() {
        let config: EngineConfig = toml::from_str(
            r#"
[provider]
kind = "ollama"
model = "qwen2.5"
base_url = "http://localhost:11434/v1"
temperature = 0.3

[retrieval]
corpus_file = "notes.txt"
top_k = 2

[storage]
backend = "json"

[limits]
max_attempts = 5
step_retries = 1
request_timeout_secs = 120
"#,
        )
        .unwrap();
        assert_eq!(config.provider.base_url.as_deref(), Some("http://localhost:11434/v1"));
        assert_eq!(config.retrieval.top_k, 2);
        assert_eq!(config.storage.backend, StorageBackend::Json);
        assert_eq!(config.limits.max_attempts, 5);
        assert_eq!(config.limits.step_retries, 1);
        assert_eq!(config.limits.request_timeout_secs, 120);
    }

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
