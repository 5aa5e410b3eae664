//! Shared domain types for Stagegate.
//!
//! Everything that crosses a crate boundary lives here: workflow
//! definitions, run state, model I/O shapes, configuration, and the
//! error taxonomy. This crate stays free of I/O and async so that the
//! core engine and every adapter can depend on it without pulling in a
//! runtime.

pub mod config;
pub mod error;
pub mod llm;
pub mod run;
pub mod workflow;

pub use config::{
    EngineConfig, LimitSettings, ProviderSettings, RetrievalSettings, StorageBackend,
    StorageSettings,
};
pub use error::{RetrievalError, StoreError, TaskError};
pub use llm::{GenerationRequest, GenerationResponse, ProviderError, ProviderKind};
pub use run::{CheckOutcome, QualityScore, RunStatus, RunSummary, SubstepAttempt, TokenUsage};
pub use workflow::{
    AggregationPolicy, DefinitionError, OutputFormat, StepDefinition, SubstepDefinition,
    SuccessCriteria, TaskSpec, WorkflowDefinition,
};
