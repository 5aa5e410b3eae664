//! OpenAI-compatible text generation backend.
//!
//! A single [`OpenAiCompatibleGenerator`] serves both hosted OpenAI and
//! local Ollama (which exposes the same chat completions protocol),
//! selected via configurable base URLs and factory functions.
//!
//! Uses [`async_openai`] for type-safe request/response handling.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
};
use secrecy::{ExposeSecret, SecretString};
use tracing::Instrument;

use stagegate_core::llm::TextGenerator;
use stagegate_observe::genai_attrs as genai;
use stagegate_types::llm::{GenerationRequest, GenerationResponse, ProviderError};
use stagegate_types::run::TokenUsage;

/// Default OpenAI endpoint.
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Ollama's OpenAI-compatible endpoint on a default local install.
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// Unified generator for any OpenAI-compatible API.
///
/// # API Key Security
///
/// Does NOT derive Debug to prevent accidental exposure of the API key
/// stored inside the `async_openai::Client`.
pub struct OpenAiCompatibleGenerator {
    client: Client<OpenAIConfig>,
    name: String,
    model: String,
    /// Default sampling temperature; per-request values win.
    temperature: Option<f64>,
}

impl OpenAiCompatibleGenerator {
    /// Create a generator against an arbitrary OpenAI-compatible endpoint.
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: &SecretString,
        model: impl Into<String>,
    ) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key.expose_secret())
            .with_api_base(base_url);

        Self {
            client: Client::with_config(config),
            name: name.into(),
            model: model.into(),
            temperature: None,
        }
    }

    /// Create an OpenAI generator against `https://api.openai.com/v1`.
    pub fn openai(api_key: &SecretString, model: &str) -> Self {
        Self::new("openai", OPENAI_BASE_URL, api_key, model)
    }

    /// Create an Ollama generator against a default local install.
    ///
    /// Ollama accepts any API key; a placeholder is sent.
    pub fn ollama(model: &str) -> Self {
        Self::new("ollama", OLLAMA_BASE_URL, &SecretString::from("ollama"), model)
    }

    /// Set the default sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Build a [`CreateChatCompletionRequest`] from a [`GenerationRequest`].
    fn build_request(&self, request: &GenerationRequest) -> CreateChatCompletionRequest {
        let messages = vec![ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(request.prompt.clone()),
                name: None,
            },
        )];

        // Use the model from the request if set, otherwise fall back to config default
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.model.clone());

        let temperature = request
            .temperature
            .or(self.temperature)
            .map(|t| t as f32);

        CreateChatCompletionRequest {
            model,
            messages,
            max_completion_tokens: request.max_tokens,
            temperature,
            ..Default::default()
        }
    }
}

impl TextGenerator for OpenAiCompatibleGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let oai_request = self.build_request(&request);

        // GenAI semantic-convention span; usage fields filled in after
        // the response arrives.
        let span = tracing::info_span!(
            "chat",
            gen_ai.operation.name = genai::OP_CHAT,
            gen_ai.provider.name = self.name.as_str(),
            gen_ai.request.model = oai_request.model.as_str(),
            gen_ai.request.temperature = oai_request.temperature.map(f64::from),
            gen_ai.response.model = tracing::field::Empty,
            gen_ai.usage.input_tokens = tracing::field::Empty,
            gen_ai.usage.output_tokens = tracing::field::Empty,
        );

        async {
            let response = self
                .client
                .chat()
                .create(oai_request)
                .await
                .map_err(map_openai_error)?;

            let text = response
                .choices
                .first()
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default();

            let usage = response
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
                .unwrap_or_default();

            let span = tracing::Span::current();
            span.record(genai::GEN_AI_RESPONSE_MODEL, response.model.as_str());
            span.record(genai::GEN_AI_USAGE_INPUT_TOKENS, usage.prompt_tokens);
            span.record(genai::GEN_AI_USAGE_OUTPUT_TOKENS, usage.completion_tokens);

            Ok(GenerationResponse {
                text,
                model: response.model,
                usage,
            })
        }
        .instrument(span)
        .await
    }
}

/// Map an `async_openai::error::OpenAIError` to a [`ProviderError`].
fn map_openai_error(err: async_openai::error::OpenAIError) -> ProviderError {
    use async_openai::error::OpenAIError;

    match &err {
        OpenAIError::ApiError(api_err) => {
            let code = api_err.code.as_deref().unwrap_or("");
            let error_type = api_err.r#type.as_deref().unwrap_or("");

            if code == "authentication_error"
                || error_type == "authentication_error"
                || api_err.message.contains("Incorrect API key")
                || api_err.message.contains("Invalid API key")
            {
                ProviderError::AuthenticationFailed(api_err.message.clone())
            } else if code == "rate_limit_exceeded" || error_type == "rate_limit_error" {
                ProviderError::RateLimited {
                    retry_after_ms: None,
                }
            } else if code == "server_error" || error_type == "overloaded_error" {
                ProviderError::Overloaded(api_err.message.clone())
            } else {
                ProviderError::Provider(err.to_string())
            }
        }
        OpenAIError::Reqwest(reqwest_err) => {
            if let Some(status) = reqwest_err.status() {
                match status.as_u16() {
                    401 => ProviderError::AuthenticationFailed(err.to_string()),
                    429 => ProviderError::RateLimited {
                        retry_after_ms: None,
                    },
                    500..=599 => ProviderError::Overloaded(err.to_string()),
                    _ => ProviderError::Provider(err.to_string()),
                }
            } else {
                ProviderError::Network(err.to_string())
            }
        }
        OpenAIError::JSONDeserialize(_, content) => {
            ProviderError::Deserialization(format!("failed to parse response: {content}"))
        }
        OpenAIError::InvalidArgument(msg) => ProviderError::InvalidRequest(msg.clone()),
        _ => ProviderError::Provider(err.to_string()),
    }
}
