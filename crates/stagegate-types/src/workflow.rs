//! Workflow definition types.
//!
//! A workflow is an ordered list of steps; each step is an ordered list
//! of substeps. Substeps carry the task to perform and the criteria its
//! output must satisfy, steps gate on the combined output of their
//! substeps. Definitions are authored as YAML (or JSON) documents:
//!
//! ```yaml
//! id: content_pipeline
//! name: Content Pipeline
//! steps:
//!   - id: research
//!     substeps:
//!       - id: gather
//!         task:
//!           type: prompt
//!           template: "Research the topic: {input}"
//!           use_retrieval: true
//!         criteria:
//!           required_keywords: ["source", "summary"]
//!   - id: draft
//!     max_retries: 2
//!     substeps:
//!       - id: write
//!         task:
//!           type: prompt
//!           template: "Write an article based on: {research}"
//!         criteria:
//!           min_quality_score: 0.75
//!           rubric: "Judge clarity, structure, and factual grounding."
//! ```

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A complete, immutable workflow definition.
///
/// Identifiers are author-chosen strings; [`WorkflowDefinition::validate`]
/// enforces that they are non-empty and unique within their scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// Stable identifier, e.g. `content_pipeline`.
    pub id: String,
    /// Human-readable name shown in listings.
    pub name: String,
    /// Steps in execution order.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Parse a definition from YAML and validate it.
    pub fn from_yaml(input: &str) -> Result<Self, DefinitionError> {
        let definition: Self =
            serde_yaml_ng::from_str(input).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parse a definition from JSON and validate it.
    pub fn from_json(input: &str) -> Result<Self, DefinitionError> {
        let definition: Self =
            serde_json::from_str(input).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Check structural invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::EmptyIdentifier {
                scope: "workflow".to_string(),
            });
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.id.clone()));
        }

        let mut step_ids = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(DefinitionError::EmptyIdentifier {
                    scope: "step".to_string(),
                });
            }
            if !step_ids.insert(step.id.as_str()) {
                return Err(DefinitionError::DuplicateStepId(step.id.clone()));
            }
            step.validate()?;
        }
        Ok(())
    }

    /// Look up a step by identifier.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

// ---------------------------------------------------------------------------
// Steps and substeps
// ---------------------------------------------------------------------------

/// One stage of a workflow. The step passes only when its aggregated
/// substep output satisfies `criteria`; on failure the whole step may be
/// retried up to `max_retries` additional times.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    pub id: String,
    /// Substeps in execution order.
    pub substeps: Vec<SubstepDefinition>,
    /// Gate applied to the aggregated step output. Empty criteria pass
    /// automatically.
    #[serde(default)]
    pub criteria: SuccessCriteria,
    /// Extra whole-step attempts after a gate failure. `None` means the
    /// step is not retried as a unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// How substep outputs combine into the step output.
    #[serde(default)]
    pub aggregation: AggregationPolicy,
}

impl StepDefinition {
    fn validate(&self) -> Result<(), DefinitionError> {
        if self.substeps.is_empty() {
            return Err(DefinitionError::NoSubsteps(self.id.clone()));
        }
        let mut substep_ids = std::collections::HashSet::new();
        for substep in &self.substeps {
            if substep.id.trim().is_empty() {
                return Err(DefinitionError::EmptyIdentifier {
                    scope: "substep".to_string(),
                });
            }
            if !substep_ids.insert(substep.id.as_str()) {
                return Err(DefinitionError::DuplicateSubstepId {
                    step_id: self.id.clone(),
                    substep_id: substep.id.clone(),
                });
            }
            substep.criteria.validate()?;
        }
        self.criteria.validate()?;
        Ok(())
    }
}

/// The smallest unit of work. Each substep runs one task and gates its
/// own output before the step-level gate sees anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubstepDefinition {
    pub id: String,
    pub task: TaskSpec,
    #[serde(default)]
    pub criteria: SuccessCriteria,
}

/// How substep outputs are combined into the step output.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Join outputs with blank lines, in substep order.
    #[default]
    Concat,
    /// Parse each output as a JSON object and merge keys; later substeps
    /// win on conflict. Falls back to concatenation when an output is not
    /// an object.
    JsonMerge,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// The work a substep performs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSpec {
    /// Render `template` against the run context and send it to the
    /// configured model.
    Prompt {
        template: String,
        /// Prepend retrieved context to the rendered prompt.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        use_retrieval: bool,
    },
    /// Invoke a registered native function by name.
    Function { handler: String },
    /// Call an HTTP endpoint with the rendered payload.
    ApiCall {
        endpoint: String,
        #[serde(default = "default_method")]
        method: String,
    },
}

fn default_method() -> String {
    "POST".to_string()
}

// ---------------------------------------------------------------------------
// Success criteria
// ---------------------------------------------------------------------------

/// Declarative quality gate. Every field is optional; criteria with no
/// fields set pass any output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SuccessCriteria {
    /// Keywords that must each appear in the output (case-insensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_keywords: Option<Vec<String>>,
    /// Structural requirement on the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    /// Maximum output length in characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Minimum rubric score in `[0.0, 1.0]`. Setting this makes the
    /// score a hard gate; a rubric without it is informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quality_score: Option<f64>,
    /// Instructions for the judge model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric: Option<String>,
}

impl SuccessCriteria {
    /// True when no field is set, i.e. any output passes.
    pub fn is_empty(&self) -> bool {
        self.required_keywords.is_none()
            && self.output_format.is_none()
            && self.max_length.is_none()
            && self.min_quality_score.is_none()
            && self.rubric.is_none()
    }

    /// True when evaluation needs a judge model call.
    pub fn needs_judge(&self) -> bool {
        self.rubric.is_some()
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        if let Some(score) = self.min_quality_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(DefinitionError::ScoreOutOfRange(score));
            }
        }
        if let Some(keywords) = &self.required_keywords {
            if keywords.iter().any(|k| k.trim().is_empty()) {
                return Err(DefinitionError::EmptyIdentifier {
                    scope: "required keyword".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Structural output requirements.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// No structural requirement.
    FreeText,
    /// Output must parse as JSON.
    Json,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Raised when a definition fails to parse or violates an invariant.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to parse workflow definition: {0}")]
    Parse(String),

    #[error("workflow '{0}' has no steps")]
    NoSteps(String),

    #[error("step '{0}' has no substeps")]
    NoSubsteps(String),

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("duplicate substep id '{substep_id}' in step '{step_id}'")]
    DuplicateSubstepId { step_id: String, substep_id: String },

    #[error("{scope} identifier must not be empty")]
    EmptyIdentifier { scope: String },

    #[error("min_quality_score {0} is outside [0.0, 1.0]")]
    ScoreOutOfRange(f64),
}
