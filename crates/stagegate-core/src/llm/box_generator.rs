//! BoxTextGenerator -- object-safe dynamic dispatch wrapper for TextGenerator.
//!
//! 1. Define an object-safe `TextGeneratorDyn` trait with boxed futures
//! 2. Blanket-impl `TextGeneratorDyn` for all `T: TextGenerator`
//! 3. `BoxTextGenerator` wraps `Box<dyn TextGeneratorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use stagegate_types::llm::{GenerationRequest, GenerationResponse, ProviderError};

use super::TextGenerator;

/// Object-safe version of [`TextGenerator`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch (`dyn TextGeneratorDyn`).
/// A blanket implementation is provided for all types implementing `TextGenerator`.
pub trait TextGeneratorDyn: Send + Sync {
    fn name(&self) -> &str;

    fn generate_boxed(
        &self,
        request: GenerationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<GenerationResponse, ProviderError>> + Send + '_>>;
}

/// Blanket implementation: any `TextGenerator` automatically implements `TextGeneratorDyn`.
impl<T: TextGenerator> TextGeneratorDyn for T {
    fn name(&self) -> &str {
        TextGenerator::name(self)
    }

    fn generate_boxed(
        &self,
        request: GenerationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<GenerationResponse, ProviderError>> + Send + '_>> {
        Box::pin(self.generate(request))
    }
}

/// Type-erased text generator for runtime provider selection.
///
/// Since `TextGenerator` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxTextGenerator` provides equivalent methods that delegate
/// to the inner `TextGeneratorDyn` trait object.
pub struct BoxTextGenerator {
    inner: Box<dyn TextGeneratorDyn + Send + Sync>,
}

impl BoxTextGenerator {
    /// Wrap a concrete `TextGenerator` in a type-erased box.
    pub fn new<T: TextGenerator + 'static>(generator: T) -> Self {
        Self {
            inner: Box::new(generator),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        self.inner.generate_boxed(request).await
    }
}

impl TextGenerator for BoxTextGenerator {
    fn name(&self) -> &str {
        BoxTextGenerator::name(self)
    }

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        BoxTextGenerator::generate(self, request).await
    }
}
