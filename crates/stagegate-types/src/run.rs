//! Run state and attempt records.
//!
//! A run is one execution of a workflow definition. Its durable state is
//! the status, the mutable context, the cursor, accumulated token usage,
//! and the append-only log of [`SubstepAttempt`] records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, nothing executed yet.
    Pending,
    /// Currently executing.
    Running,
    /// Stopped at a step boundary; resumable.
    Paused,
    /// All steps passed their gates.
    Completed,
    /// A step exhausted its attempt budget or hit a fatal error.
    Failed,
}

impl RunStatus {
    /// Stable string form used in storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed runs never execute again as-is.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `resume` will pick this run up.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Token accounting
// ---------------------------------------------------------------------------

/// Token counts accumulated over a run, judge calls included.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Fold another usage record into this one. Counts only grow.
    pub fn absorb(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

// ---------------------------------------------------------------------------
// Quality scores
// ---------------------------------------------------------------------------

/// Result of one declared check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckOutcome {
    /// Check name, e.g. `required_keywords` or `rubric`.
    pub name: String,
    pub passed: bool,
    /// What failed, phrased for the self-correction prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckOutcome {
    pub fn passed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: None,
        }
    }

    pub fn failed(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

/// Aggregate evaluation of one output against one set of criteria.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityScore {
    /// Combined score in `[0.0, 1.0]`.
    pub value: f64,
    /// Per-check outcomes in evaluation order.
    pub checks: Vec<CheckOutcome>,
}

impl QualityScore {
    /// Score for criteria with nothing to check.
    pub fn auto_pass() -> Self {
        Self {
            value: 1.0,
            checks: Vec::new(),
        }
    }

    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

// ---------------------------------------------------------------------------
// Attempt records
// ---------------------------------------------------------------------------

/// One attempt at one substep, as persisted to the attempt log.
///
/// Records are append-only; retries add new records rather than mutating
/// old ones, so the full correction history of a run stays auditable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubstepAttempt {
    pub id: Uuid,
    pub step_id: String,
    /// Which whole-step attempt this belongs to, starting at 1.
    pub step_attempt: u32,
    pub substep_id: String,
    /// Attempt number within the substep, starting at 1.
    pub attempt: u32,
    /// Exact input sent to the task, feedback included.
    pub rendered_input: String,
    /// Retrieved context prepended to the prompt, when retrieval ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_context: Option<String>,
    /// Task output; absent when the task itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Evaluation result; absent when the task failed before evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<QualityScore>,
    pub accepted: bool,
    /// Task or provider error message for failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Tokens consumed by this attempt, judge call included.
    #[serde(default)]
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// Listing row for a stored run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
