//! Stagegate core engine.
//!
//! Pure orchestration logic: the workflow state machine, quality gates,
//! retry loops, and checkpointing. Everything with an outside edge is a
//! trait here ([`llm::TextGenerator`], [`task::NativeFunction`],
//! [`task::HttpCaller`], [`retrieval::ContextRetriever`],
//! [`store::RunStore`]); concrete adapters live in the infra crate.

pub mod llm;
pub mod retrieval;
pub mod store;
pub mod task;
pub mod workflow;

pub use llm::{BoxTextGenerator, TextGenerator};
pub use retrieval::{BoxRetriever, ContextRetriever, RetrievedChunk};
pub use store::{BoxRunStore, MemoryRunStore, RunStore, StoredRun};
pub use task::{BoxHttpCaller, FunctionRegistry, HttpCaller, NativeFunction};
pub use workflow::orchestrator::{Orchestrator, RunOutcome, WorkflowEngine};
pub use workflow::EngineError;
