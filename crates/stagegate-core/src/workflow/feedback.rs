//! Deterministic self-correction feedback.
//!
//! When an attempt fails its quality gate, the next attempt gets the
//! original input plus a revision block built purely from the recorded
//! check outcomes. No model call is involved, so the feedback for a
//! given failure is always the same. Transient failures get no
//! feedback at all; the retry repeats the identical input.

use stagegate_types::run::QualityScore;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// First line of every revision block. Attempt records for transient
/// retries never contain it.
pub const CORRECTION_HEADER: &str = "## Revision Notes";

/// Longest previous-output excerpt quoted back in the feedback.
const EXCERPT_LIMIT: usize = 2_000;

// ---------------------------------------------------------------------------
// FeedbackComposer
// ---------------------------------------------------------------------------

/// Stateless feedback builder. All logic is in associated functions
/// that take the failed attempt's data as parameters.
pub struct FeedbackComposer;

impl FeedbackComposer {
    /// Whether another attempt is allowed. `attempt` is 1-based; with a
    /// budget of 3, attempts 1 and 2 may retry and 3 may not.
    pub fn should_retry(max_attempts: u32, attempt: u32) -> bool {
        attempt < max_attempts
    }

    /// Build the full input for the next attempt: the original input
    /// followed by the revision block.
    pub fn compose(
        base_input: &str,
        previous_output: &str,
        score: &QualityScore,
        attempt: u32,
        max_attempts: u32,
    ) -> String {
        format!(
            "{base_input}\n\n{}",
            Self::revision_notes(previous_output, score, attempt, max_attempts)
        )
    }

    /// The revision block alone, for tasks that take feedback as a
    /// payload field instead of inline prompt text.
    pub fn revision_notes(
        previous_output: &str,
        score: &QualityScore,
        attempt: u32,
        max_attempts: u32,
    ) -> String {
        let remaining = max_attempts.saturating_sub(attempt + 1);
        let mut unmet = String::new();
        for check in score.failed_checks() {
            match &check.detail {
                Some(detail) => unmet.push_str(&format!("- {}: {detail}\n", check.name)),
                None => unmet.push_str(&format!("- {}\n", check.name)),
            }
        }
        if unmet.is_empty() {
            unmet.push_str("- overall quality below the required score\n");
        }

        format!(
            "{CORRECTION_HEADER} (attempt {attempt_display} of {max_attempts}, {remaining} remaining)\n\
             \n\
             Your previous response did not meet the requirements.\n\
             \n\
             **Previous response (excerpt):**\n\
             ```\n\
             {excerpt}\n\
             ```\n\
             \n\
             **Unmet requirements:**\n\
             {unmet}\
             \n\
             Revise your response to satisfy every requirement above. \
             Reply with the revised content only.",
            attempt_display = attempt + 1,
            excerpt = excerpt(previous_output),
        )
    }
}

fn excerpt(output: &str) -> &str {
    if output.chars().count() <= EXCERPT_LIMIT {
        return output;
    }
    match output.char_indices().nth(EXCERPT_LIMIT) {
        Some((idx, _)) => &output[..idx],
        None => output,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
