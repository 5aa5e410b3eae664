//! Model provider abstraction.
//!
//! The engine talks to exactly one seam: [`TextGenerator`]. Generation
//! tasks and judge calls both go through it, so a single configured
//! provider serves the whole run.

pub mod box_generator;

pub use box_generator::BoxTextGenerator;

use stagegate_types::llm::{GenerationRequest, GenerationResponse, ProviderError};

/// A text-generation backend.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait TextGenerator: Send + Sync {
    /// Provider name for logs and attempt records.
    fn name(&self) -> &str;

    /// Generate a completion for the given request.
    fn generate(
        &self,
        request: GenerationRequest,
    ) -> impl std::future::Future<Output = Result<GenerationResponse, ProviderError>> + Send;
}
