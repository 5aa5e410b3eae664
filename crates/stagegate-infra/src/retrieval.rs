//! Corpus-file retrieval backend.
//!
//! A deliberately thin stand-in for a vector store: the corpus is one
//! plain-text file split into paragraph chunks at load time, and queries
//! rank chunks by distinct-term overlap. Embedding-backed retrieval can
//! replace this behind the same `ContextRetriever` seam without touching
//! the engine.

use std::collections::HashSet;
use std::path::Path;

use stagegate_core::retrieval::{ContextRetriever, RetrievedChunk};
use stagegate_types::error::RetrievalError;

/// Terms shorter than this carry no signal and are ignored.
const MIN_TERM_LEN: usize = 2;

/// In-memory retriever over a fixed set of text chunks.
#[derive(Debug)]
pub struct StaticRetriever {
    chunks: Vec<Chunk>,
}

#[derive(Debug)]
struct Chunk {
    text: String,
    terms: HashSet<String>,
}

impl StaticRetriever {
    /// Load a corpus file, splitting it into paragraph chunks on blank
    /// lines.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RetrievalError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            RetrievalError::Backend(format!("cannot read corpus {}: {e}", path.display()))
        })?;
        Ok(Self::from_text(&text))
    }

    /// Build a retriever from corpus text already in memory.
    pub fn from_text(text: &str) -> Self {
        let chunks = text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| Chunk {
                text: p.to_string(),
                terms: terms_of(p),
            })
            .collect();
        Self { chunks }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

impl ContextRetriever for StaticRetriever {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let query_terms = terms_of(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f64, &Chunk)> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let overlap = chunk.terms.intersection(&query_terms).count();
                if overlap == 0 {
                    return None;
                }
                let score = overlap as f64 / query_terms.len() as f64;
                Some((score, chunk))
            })
            .collect();

        // Stable sort keeps corpus order among equal scores.
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, chunk)| RetrievedChunk {
                text: chunk.text.clone(),
                score,
            })
            .collect())
    }
}

/// Distinct lowercase alphanumeric terms of a text.
fn terms_of(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= MIN_TERM_LEN)
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORPUS: &str = "\
Rust guarantees memory safety without a garbage collector.

The borrow checker enforces aliasing rules at compile time.

Tokio is an asynchronous runtime for the Rust language.

Paris is the capital of France.";

    #[tokio::test]
    async fn test_splits_corpus_into_paragraphs() {
        let retriever = StaticRetriever::from_text(CORPUS);
        assert_eq!(retriever.chunk_count(), 4);
    }

    #[tokio::test]
    async fn test_ranks_by_term_overlap() {
        let retriever = StaticRetriever::from_text(CORPUS);
        let chunks = retriever.retrieve("rust runtime", 10).await.unwrap();

        // The tokio paragraph matches both terms; two others match one.
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].text.contains("Tokio"));
        assert!(chunks[0].score > chunks[1].score);
    }

    #[tokio::test]
    async fn test_unrelated_chunks_are_excluded() {
        let retriever = StaticRetriever::from_text(CORPUS);
        let chunks = retriever.retrieve("garbage collector", 10).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("memory safety"));
    }

    #[tokio::test]
    async fn test_top_k_limits_results() {
        let retriever = StaticRetriever::from_text(CORPUS);
        let chunks = retriever.retrieve("rust", 1).await.unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_query_returns_nothing() {
        let retriever = StaticRetriever::from_text(CORPUS);
        assert!(retriever.retrieve("", 5).await.unwrap().is_empty());
        assert!(retriever.retrieve("a !", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_matching_is_case_insensitive() {
        let retriever = StaticRetriever::from_text(CORPUS);
        let chunks = retriever.retrieve("PARIS", 5).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("capital of France"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.txt");
        tokio::fs::write(&path, CORPUS).await.unwrap();

        let retriever = StaticRetriever::load(&path).await.unwrap();
        assert_eq!(retriever.chunk_count(), 4);
    }

    #[tokio::test]
    async fn test_missing_corpus_is_backend_error() {
        let err = StaticRetriever::load("/nonexistent/corpus.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Backend(_)));
        assert!(!err.is_transient());
    }
}
