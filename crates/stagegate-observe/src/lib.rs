//! Observability wiring for Stagegate.
//!
//! [`tracing_setup`] installs the global subscriber (structured fmt
//! output, `RUST_LOG` filtering, optional OpenTelemetry stdout export);
//! [`genai_attrs`] holds the OTel GenAI semantic-convention field names
//! recorded on generation and judge spans.

pub mod genai_attrs;
pub mod tracing_setup;
