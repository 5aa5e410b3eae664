//! Infrastructure implementations for Stagegate.
//!
//! Concrete adapters behind the seams `stagegate-core` defines: SQLite
//! and JSON-file run stores, the OpenAI-compatible generator, the
//! reqwest HTTP task caller, the corpus-file retriever, and the
//! `config.toml` loader.

pub mod config;
pub mod http_task;
pub mod json;
pub mod llm;
pub mod retrieval;
pub mod sqlite;

pub use config::{load_engine_config, resolve_data_dir};
pub use http_task::ReqwestCaller;
pub use json::JsonRunStore;
pub use llm::create_generator;
pub use retrieval::StaticRetriever;
pub use sqlite::pool::DatabasePool;
pub use sqlite::run_store::SqliteRunStore;
