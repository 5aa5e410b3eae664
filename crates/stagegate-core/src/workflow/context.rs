//! Run execution context with output bindings and template rendering.
//!
//! `ExecutionContext` is the mutable state that flows through a run. It
//! holds the run input, the output of every passed step keyed by step
//! id, and the cursor marking the next step to execute, with size
//! limits to prevent unbounded growth. The whole context serializes to
//! one JSON document for checkpointing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Reserved binding holding the run input.
pub const INPUT_KEY: &str = "input";

/// Maximum size of a single bound output (1 MB).
pub const MAX_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all bindings (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Appended to outputs cut off at [`MAX_OUTPUT_SIZE`].
const TRUNCATION_MARKER: &str = "\n[output truncated]";

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state carried across a run.
///
/// Bindings are plain strings keyed by step id, plus the reserved
/// `input` key. Templates reference them as `{step_id}`; a placeholder
/// with no binding is a hard error so that typos surface immediately
/// instead of producing a prompt with a literal `{placeholder}` in it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionContext {
    /// Outputs keyed by step id, plus the reserved input key.
    bindings: BTreeMap<String, String>,
    /// Index of the next step to execute.
    cursor: usize,
    /// Accepted substep outputs of the in-flight step, so a resume
    /// against a fine-grained store re-runs at most the substep that
    /// was interrupted. Keyed by substep id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    partial: BTreeMap<String, String>,
    /// Which step and step attempt `partial` belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partial_step: Option<String>,
    #[serde(default)]
    partial_step_attempt: u32,
}

impl ExecutionContext {
    /// Create a fresh context for a run with the given input.
    pub fn new(input: impl Into<String>) -> Self {
        let mut bindings = BTreeMap::new();
        bindings.insert(INPUT_KEY.to_string(), input.into());
        Self {
            bindings,
            cursor: 0,
            partial: BTreeMap::new(),
            partial_step: None,
            partial_step_attempt: 0,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Move the cursor past a completed step.
    pub fn advance(&mut self) {
        self.cursor += 1;
    }

    /// Rewind the cursor for a failed-step re-run.
    pub fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor;
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.bindings.get(key).map(String::as_str)
    }

    pub fn input(&self) -> &str {
        self.get(INPUT_KEY).unwrap_or_default()
    }

    /// Bind a step output under its step id.
    ///
    /// Outputs over [`MAX_OUTPUT_SIZE`] are truncated with a marker; a
    /// total size over [`MAX_CONTEXT_SIZE`] is an error because a
    /// checkpoint that large is no longer safe to round-trip.
    pub fn bind_output(
        &mut self,
        step_id: &str,
        output: impl Into<String>,
    ) -> Result<(), ContextError> {
        let mut output = output.into();
        if output.len() > MAX_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size = output.len(),
                max = MAX_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            let mut cut = MAX_OUTPUT_SIZE;
            while !output.is_char_boundary(cut) {
                cut -= 1;
            }
            output.truncate(cut);
            output.push_str(TRUNCATION_MARKER);
        }
        self.bindings.insert(step_id.to_string(), output);

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::Overflow {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(())
    }

    /// Resolve a key against the in-flight step's partial outputs first,
    /// then the committed bindings. Later substeps of a step reference
    /// their accepted siblings this way before the step commits.
    fn lookup(&self, key: &str) -> Option<&str> {
        self.partial
            .get(key)
            .or_else(|| self.bindings.get(key))
            .map(String::as_str)
    }

    /// Render `{key}` placeholders against the bindings and any partial
    /// substep outputs of the in-flight step.
    ///
    /// A placeholder is `{` followed by an identifier (`[A-Za-z0-9_-]`)
    /// and `}`. Anything else brace-shaped, JSON literals included, is
    /// copied through verbatim.
    pub fn render_template(&self, template: &str) -> Result<String, ContextError> {
        let mut result = String::with_capacity(template.len());
        let bytes = template.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] == b'{' {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && is_placeholder_char(bytes[end]) {
                    end += 1;
                }
                if end > start && end < bytes.len() && bytes[end] == b'}' {
                    let key = &template[start..end];
                    match self.lookup(key) {
                        Some(value) => {
                            result.push_str(value);
                            i = end + 1;
                            continue;
                        }
                        None => {
                            return Err(ContextError::UnboundPlaceholder(key.to_string()));
                        }
                    }
                }
            }
            // Not a placeholder; copy the full UTF-8 character.
            let ch_len = utf8_len(bytes[i]);
            result.push_str(&template[i..i + ch_len]);
            i += ch_len;
        }

        Ok(result)
    }

    /// Build the JSON payload handed to function and API tasks. Partial
    /// sibling outputs overlay the committed bindings.
    pub fn to_payload(&self) -> serde_json::Value {
        let mut map: serde_json::Map<String, serde_json::Value> = self
            .bindings
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        for (k, v) in &self.partial {
            map.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
        serde_json::Value::Object(map)
    }

    /// Total size of all bindings in bytes.
    pub fn total_size(&self) -> usize {
        self.bindings.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Step outputs only, without the reserved input binding.
    pub fn step_outputs(&self) -> BTreeMap<String, String> {
        self.bindings
            .iter()
            .filter(|(k, _)| k.as_str() != INPUT_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Partial substep outputs
    // -----------------------------------------------------------------------

    /// Record an accepted substep output for the in-flight step. Stale
    /// partials from another step or step attempt are discarded.
    pub fn record_partial(
        &mut self,
        step_id: &str,
        step_attempt: u32,
        substep_id: &str,
        output: impl Into<String>,
    ) {
        if self.partial_step.as_deref() != Some(step_id)
            || self.partial_step_attempt != step_attempt
        {
            self.partial.clear();
            self.partial_step = Some(step_id.to_string());
            self.partial_step_attempt = step_attempt;
        }
        self.partial.insert(substep_id.to_string(), output.into());
    }

    /// Output of an already-completed substep of the given step attempt,
    /// if one was checkpointed.
    pub fn partial_output(
        &self,
        step_id: &str,
        step_attempt: u32,
        substep_id: &str,
    ) -> Option<&str> {
        if self.partial_step.as_deref() != Some(step_id)
            || self.partial_step_attempt != step_attempt
        {
            return None;
        }
        self.partial.get(substep_id).map(String::as_str)
    }

    /// The step attempt any checkpointed partials belong to.
    pub fn partial_attempt_for(&self, step_id: &str) -> Option<u32> {
        if self.partial_step.as_deref() == Some(step_id) && !self.partial.is_empty() {
            Some(self.partial_step_attempt)
        } else {
            None
        }
    }

    pub fn clear_partials(&mut self) {
        self.partial.clear();
        self.partial_step = None;
        self.partial_step_attempt = 0;
    }
}

fn is_placeholder_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >> 5 == 0b110 => 2,
        b if b >> 4 == 0b1110 => 3,
        _ => 4,
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("template references unbound key '{0}'")]
    UnboundPlaceholder(String),

    #[error("context size ({size} bytes) exceeds maximum ({max} bytes)")]
    Overflow { size: usize, max: usize },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Basic operations
    // -----------------------------------------------------------------------

    #[test]
    fn test_new_context() {
        let ctx = ExecutionContext::new("write about rust");
        assert_eq!(ctx.input(), "write about rust");
        assert_eq!(ctx.cursor(), 0);
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn test_bind_and_get_output() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.bind_output("research", "five sources").unwrap();
        assert_eq!(ctx.get("research"), Some("five sources"));
    }

    #[test]
    fn test_cursor_movement() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.advance();
        ctx.advance();
        assert_eq!(ctx.cursor(), 2);
        ctx.set_cursor(1);
        assert_eq!(ctx.cursor(), 1);
    }

    // -----------------------------------------------------------------------
    // Template rendering
    // -----------------------------------------------------------------------

    #[test]
    fn test_render_input_placeholder() {
        let ctx = ExecutionContext::new("rust async");
        let out = ctx.render_template("Research the topic: {input}").unwrap();
        assert_eq!(out, "Research the topic: rust async");
    }

    #[test]
    fn test_render_multiple_placeholders() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.bind_output("research", "notes").unwrap();
        ctx.bind_output("draft", "article").unwrap();
        let out = ctx
            .render_template("Combine {research} with {draft} for {input}")
            .unwrap();
        assert_eq!(out, "Combine notes with article for topic");
    }

    #[test]
    fn test_render_unbound_key_is_an_error() {
        let ctx = ExecutionContext::new("topic");
        let err = ctx.render_template("Use {missing} here").unwrap_err();
        assert!(matches!(
            err,
            ContextError::UnboundPlaceholder(key) if key == "missing"
        ));
    }

    #[test]
    fn test_render_leaves_json_braces_alone() {
        let ctx = ExecutionContext::new("topic");
        let template = r#"Respond as {"topic": "{input}", "n": 3} or {}"#;
        let out = ctx.render_template(template).unwrap();
        assert_eq!(out, r#"Respond as {"topic": "topic", "n": 3} or {}"#);
    }

    #[test]
    fn test_render_spaced_double_braces_stay_literal() {
        // Only bare `{key}` interpolates; Jinja-style spaced braces are
        // ordinary text, not unbound placeholders.
        let ctx = ExecutionContext::new("HELLO");
        let out = ctx.render_template("Say: {{ input }} then {input}").unwrap();
        assert_eq!(out, "Say: {{ input }} then HELLO");
    }

    #[test]
    fn test_render_handles_unclosed_brace() {
        let ctx = ExecutionContext::new("topic");
        let out = ctx.render_template("ends with {input").unwrap();
        assert_eq!(out, "ends with {input");
    }

    #[test]
    fn test_render_multibyte_text() {
        let ctx = ExecutionContext::new("täma");
        let out = ctx.render_template("über {input} — fertig").unwrap();
        assert_eq!(out, "über täma — fertig");
    }

    // -----------------------------------------------------------------------
    // Size limits
    // -----------------------------------------------------------------------

    #[test]
    fn test_oversized_output_truncates() {
        let mut ctx = ExecutionContext::new("topic");
        let big = "x".repeat(MAX_OUTPUT_SIZE + 100);
        ctx.bind_output("big", big).unwrap();

        let stored = ctx.get("big").unwrap();
        assert!(stored.len() <= MAX_OUTPUT_SIZE + TRUNCATION_MARKER.len());
        assert!(stored.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn total_size_counts_all_bindings() {
        let mut ctx = ExecutionContext::new("ab");
        let empty = ctx.total_size();
        ctx.bind_output("x", "1234").unwrap();
        assert_eq!(ctx.total_size(), empty + 1 + 4);
    }

    // -----------------------------------------------------------------------
    // Checkpoint round trip
    // -----------------------------------------------------------------------

    #[test]
    fn test_checkpoint_round_trip() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.bind_output("research", "notes").unwrap();
        ctx.advance();

        let json = serde_json::to_string(&ctx).unwrap();
        let restored: ExecutionContext = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, ctx);
        assert_eq!(restored.cursor(), 1);
        assert_eq!(restored.get("research"), Some("notes"));
    }

    // -----------------------------------------------------------------------
    // Task payloads
    // -----------------------------------------------------------------------

    #[test]
    fn test_payload_contains_all_bindings() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.bind_output("research", "notes").unwrap();
        let payload = ctx.to_payload();
        assert_eq!(payload["input"], serde_json::json!("topic"));
        assert_eq!(payload["research"], serde_json::json!("notes"));
    }

    #[test]
    fn test_step_outputs_exclude_input() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.bind_output("research", "notes").unwrap();
        let outputs = ctx.step_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs.get("research").map(String::as_str), Some("notes"));
    }

    // -----------------------------------------------------------------------
    // Partial substep outputs
    // -----------------------------------------------------------------------

    #[test]
    fn test_partials_scoped_to_step_and_attempt() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.record_partial("draft", 1, "write", "text");

        assert_eq!(ctx.partial_output("draft", 1, "write"), Some("text"));
        assert_eq!(ctx.partial_attempt_for("draft"), Some(1));
        // Different attempt or step sees nothing.
        assert_eq!(ctx.partial_output("draft", 2, "write"), None);
        assert_eq!(ctx.partial_output("other", 1, "write"), None);
        assert_eq!(ctx.partial_attempt_for("other"), None);
    }

    #[test]
    fn test_recording_for_new_attempt_discards_stale_partials() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.record_partial("draft", 1, "write", "first try");
        ctx.record_partial("draft", 2, "review", "second try");

        assert_eq!(ctx.partial_output("draft", 2, "write"), None);
        assert_eq!(ctx.partial_output("draft", 2, "review"), Some("second try"));
    }

    #[test]
    fn test_clear_partials() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.record_partial("draft", 1, "write", "text");
        ctx.clear_partials();
        assert_eq!(ctx.partial_output("draft", 1, "write"), None);
        assert_eq!(ctx.partial_attempt_for("draft"), None);
    }

    #[test]
    fn test_partials_survive_checkpoint_round_trip() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.record_partial("draft", 1, "write", "text");
        let json = serde_json::to_string(&ctx).unwrap();
        let restored: ExecutionContext = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.partial_output("draft", 1, "write"), Some("text"));
    }

    #[test]
    fn test_templates_resolve_partial_sibling_outputs() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.record_partial("draft", 1, "outline", "1. intro");

        let rendered = ctx.render_template("Expand {outline} on {input}").unwrap();
        assert_eq!(rendered, "Expand 1. intro on topic");

        let payload = ctx.to_payload();
        assert_eq!(payload["outline"], serde_json::json!("1. intro"));
        assert_eq!(payload["input"], serde_json::json!("topic"));
    }

    #[test]
    fn partial_shadows_committed_binding_with_same_key() {
        let mut ctx = ExecutionContext::new("topic");
        ctx.bind_output("outline", "committed").unwrap();
        ctx.record_partial("draft", 1, "outline", "in flight");
        assert_eq!(ctx.render_template("{outline}").unwrap(), "in flight");
        ctx.clear_partials();
        assert_eq!(ctx.render_template("{outline}").unwrap(), "committed");
    }
}
