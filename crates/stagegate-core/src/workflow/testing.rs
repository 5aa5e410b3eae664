//! Shared test doubles for the engine tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use stagegate_types::llm::{GenerationRequest, GenerationResponse, ProviderError};
use stagegate_types::run::TokenUsage;

use crate::llm::TextGenerator;

/// Generator that replays a fixed script of responses in order and
/// records every prompt it was asked for. Clones share the script, so
/// tests can keep a handle for inspection after boxing one. Panics when
/// the script runs dry so unexpected extra calls fail loudly.
#[derive(Clone)]
pub(crate) struct ScriptedGenerator {
    inner: Arc<ScriptState>,
}

struct ScriptState {
    script: Mutex<VecDeque<Result<GenerationResponse, ProviderError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Result<GenerationResponse, ProviderError>>) -> Self {
        Self {
            inner: Arc::new(ScriptState {
                script: Mutex::new(script.into()),
                prompts: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn response(text: &str, prompt_tokens: u64, completion_tokens: u64) -> GenerationResponse {
        GenerationResponse {
            text: text.to_string(),
            model: "scripted".to_string(),
            usage: TokenUsage::new(prompt_tokens, completion_tokens),
        }
    }

    /// Prompts seen so far, in call order.
    pub fn recorded_prompts(&self) -> Vec<String> {
        self.inner.prompts.lock().unwrap().clone()
    }

    pub fn calls_made(&self) -> usize {
        self.inner.prompts.lock().unwrap().len()
    }
}

impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        self.inner.prompts.lock().unwrap().push(request.prompt.clone());
        self.inner
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("generation script exhausted, prompt: {}", request.prompt))
    }
}

/// Retriever returning a fixed set of chunks, with optional one-shot
/// scripted failures consumed before the chunks.
#[derive(Clone)]
pub(crate) struct StubRetriever {
    chunks: Arc<Vec<String>>,
    failures: Arc<Mutex<VecDeque<stagegate_types::error::RetrievalError>>>,
}

impl StubRetriever {
    pub fn with_chunks(chunks: Vec<&str>) -> Self {
        Self {
            chunks: Arc::new(chunks.into_iter().map(str::to_string).collect()),
            failures: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn fail_next(&self, error: stagegate_types::error::RetrievalError) {
        self.failures.lock().unwrap().push_back(error);
    }
}

impl crate::retrieval::ContextRetriever for StubRetriever {
    async fn retrieve(
        &self,
        _query: &str,
        top_k: usize,
    ) -> Result<Vec<crate::retrieval::RetrievedChunk>, stagegate_types::error::RetrievalError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self
            .chunks
            .iter()
            .take(top_k)
            .map(|text| crate::retrieval::RetrievedChunk {
                text: text.clone(),
                score: 1.0,
            })
            .collect())
    }
}

/// HTTP caller echoing a fixed body and recording what it was sent.
#[derive(Clone)]
pub(crate) struct StubHttp {
    body: Arc<String>,
    requests: Arc<Mutex<Vec<(String, String, serde_json::Value)>>>,
}

impl StubHttp {
    pub fn returning(body: &str) -> Self {
        Self {
            body: Arc::new(body.to_string()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn recorded_requests(&self) -> Vec<(String, String, serde_json::Value)> {
        self.requests.lock().unwrap().clone()
    }
}

impl crate::task::HttpCaller for StubHttp {
    async fn call(
        &self,
        method: &str,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<String, stagegate_types::error::TaskError> {
        self.requests
            .lock()
            .unwrap()
            .push((method.to_string(), endpoint.to_string(), payload.clone()));
        Ok(self.body.as_str().to_string())
    }
}
