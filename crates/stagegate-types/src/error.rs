//! Errors shared by storage, task, and retrieval adapters.
//!
//! Provider errors live in [`crate::llm`]; engine-level errors live in
//! the core crate next to the code that raises them.

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Failures from a run store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage connection failed: {0}")]
    Connection(String),

    #[error("storage i/o failed: {0}")]
    Io(String),

    #[error("storage query failed: {0}")]
    Query(String),

    #[error("failed to serialize stored data: {0}")]
    Serialization(String),

    #[error("record not found")]
    NotFound,
}

// ---------------------------------------------------------------------------
// Native and HTTP tasks
// ---------------------------------------------------------------------------

/// Failures from function and API-call tasks.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("no function registered under '{0}'")]
    NotRegistered(String),

    #[error("task failed: {0}")]
    Failed(String),

    #[error("endpoint returned status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("task timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("network error: {0}")]
    Network(String),
}

impl TaskError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::NotRegistered(_) | Self::Failed(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// Failures from a retrieval backend.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("retrieval backend failed: {0}")]
    Backend(String),

    #[error("retrieval timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl RetrievalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
