//! Context retrieval abstraction.
//!
//! Prompt tasks that set `use_retrieval` get relevant chunks prepended
//! to their rendered prompt. The backend is pluggable; the corpus-file
//! implementation lives in the infra crate.

use std::future::Future;
use std::pin::Pin;

use stagegate_types::error::RetrievalError;

/// One retrieved chunk with its relevance score.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub text: String,
    /// Backend-specific relevance, higher is better.
    pub score: f64,
}

/// A retrieval backend.
pub trait ContextRetriever: Send + Sync {
    /// Return up to `top_k` chunks relevant to `query`, best first.
    fn retrieve(
        &self,
        query: &str,
        top_k: usize,
    ) -> impl std::future::Future<Output = Result<Vec<RetrievedChunk>, RetrievalError>> + Send;
}

// ---------------------------------------------------------------------------
// Object-safe wrapper
// ---------------------------------------------------------------------------

/// Object-safe version of [`ContextRetriever`] with boxed futures.
pub trait ContextRetrieverDyn: Send + Sync {
    fn retrieve_boxed<'a>(
        &'a self,
        query: &'a str,
        top_k: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RetrievedChunk>, RetrievalError>> + Send + 'a>>;
}

impl<T: ContextRetriever> ContextRetrieverDyn for T {
    fn retrieve_boxed<'a>(
        &'a self,
        query: &'a str,
        top_k: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RetrievedChunk>, RetrievalError>> + Send + 'a>> {
        Box::pin(self.retrieve(query, top_k))
    }
}

/// Type-erased retriever for runtime backend selection.
pub struct BoxRetriever {
    inner: Box<dyn ContextRetrieverDyn + Send + Sync>,
}

impl BoxRetriever {
    pub fn new<T: ContextRetriever + 'static>(retriever: T) -> Self {
        Self {
            inner: Box::new(retriever),
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        self.inner.retrieve_boxed(query, top_k).await
    }
}

impl ContextRetriever for BoxRetriever {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        BoxRetriever::retrieve(self, query, top_k).await
    }
}
