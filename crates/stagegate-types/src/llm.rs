//! Model provider I/O shapes and error classification.

use serde::{Deserialize, Serialize};

use crate::run::TokenUsage;

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// A single text-generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Override the configured model for this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A completed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    /// Model that actually served the request.
    pub model: String,
    pub usage: TokenUsage,
}

// ---------------------------------------------------------------------------
// Provider identity
// ---------------------------------------------------------------------------

/// Known provider families.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Provider failures, split into transient and fatal classes.
///
/// Transient errors consume a retry slot and the attempt is repeated
/// with the same input; fatal errors abort the run immediately.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited {
        /// Server-suggested backoff when present.
        retry_after_ms: Option<u64>,
    },

    #[error("provider overloaded: {0}")]
    Overloaded(String),

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to decode provider response: {0}")]
    Deserialization(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Overloaded(_) | Self::Timeout { .. } | Self::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_provider_kind_round_trip() {
        for kind in [ProviderKind::OpenAi, ProviderKind::Ollama] {
            assert_eq!(ProviderKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert_eq!(ProviderKind::from_str("OpenAI").unwrap(), ProviderKind::OpenAi);
        assert!(ProviderKind::from_str("bedrock").is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after_ms: None }.is_transient());
        assert!(ProviderError::Overloaded("busy".to_string()).is_transient());
        assert!(ProviderError::Timeout { timeout_ms: 60_000 }.is_transient());
        assert!(ProviderError::Network("reset".to_string()).is_transient());

        assert!(!ProviderError::AuthenticationFailed("bad key".to_string()).is_transient());
        assert!(!ProviderError::InvalidRequest("no model".to_string()).is_transient());
        assert!(!ProviderError::Deserialization("truncated".to_string()).is_transient());
        assert!(!ProviderError::Provider("unknown".to_string()).is_transient());
    }

    #[test]
    fn test_request_builder() {
        let request = GenerationRequest::new("hello").with_temperature(0.2);
        assert_eq!(request.prompt, "hello");
        assert_eq!(request.temperature, Some(0.2));
        assert!(request.model.is_none());
    }
}
