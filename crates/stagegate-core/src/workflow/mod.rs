//! The workflow engine: context, evaluation, feedback, and the
//! step/substep execution loops under the orchestrator.

pub mod context;
pub mod evaluate;
pub mod feedback;
pub mod orchestrator;

mod state;
mod step;
mod substep;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{ContextError, ExecutionContext};
pub use evaluate::{CriteriaEvaluator, Evaluation};
pub use feedback::FeedbackComposer;

use uuid::Uuid;

use stagegate_types::error::StoreError;
use stagegate_types::workflow::DefinitionError;

/// Infrastructure-level engine failures.
///
/// A run that fails its quality gates is not an error; that outcome
/// comes back as a normal result with `RunStatus::Failed`. This enum is
/// for the cases where the engine cannot make progress at all.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("workflow '{0}' not found in store")]
    WorkflowNotFound(String),

    #[error("invalid workflow definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("no function registered under '{handler}' (substep '{substep_id}')")]
    HandlerNotRegistered { substep_id: String, handler: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
