//! Model provider implementations.
//!
//! Contains concrete implementations of the [`TextGenerator`] trait
//! defined in `stagegate-core`, and a provider factory
//! ([`create_generator`]) that constructs the right backend from
//! [`ProviderSettings`].

pub mod openai_compat;

use secrecy::SecretString;

use stagegate_core::llm::BoxTextGenerator;
use stagegate_types::config::ProviderSettings;
use stagegate_types::llm::{ProviderError, ProviderKind};

use self::openai_compat::OpenAiCompatibleGenerator;

/// Create a [`BoxTextGenerator`] from [`ProviderSettings`].
///
/// OpenAI resolves its API key from the environment variable named by
/// `api_key_env` (default `OPENAI_API_KEY`). Ollama needs no key on a
/// local install; `api_key_env` is honored when a custom `base_url`
/// points at an authenticated endpoint.
///
/// # Errors
///
/// Returns [`ProviderError::AuthenticationFailed`] when a required API
/// key environment variable is not set.
pub fn create_generator(settings: &ProviderSettings) -> Result<BoxTextGenerator, ProviderError> {
    let generator = match settings.kind {
        ProviderKind::OpenAi => {
            let env_var = settings.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
            let api_key = resolve_api_key(env_var)?;
            match settings.base_url.as_deref() {
                Some(base_url) => {
                    OpenAiCompatibleGenerator::new("openai", base_url, &api_key, &settings.model)
                }
                None => OpenAiCompatibleGenerator::openai(&api_key, &settings.model),
            }
        }
        ProviderKind::Ollama => match settings.base_url.as_deref() {
            Some(base_url) => {
                let api_key = match settings.api_key_env.as_deref() {
                    Some(env_var) => resolve_api_key(env_var)?,
                    None => SecretString::from("ollama"),
                };
                OpenAiCompatibleGenerator::new("ollama", base_url, &api_key, &settings.model)
            }
            None => OpenAiCompatibleGenerator::ollama(&settings.model),
        },
    };

    let generator = match settings.temperature {
        Some(t) => generator.with_temperature(t),
        None => generator,
    };

    Ok(BoxTextGenerator::new(generator))
}

/// Read an API key from the environment into a [`SecretString`].
fn resolve_api_key(env_var: &str) -> Result<SecretString, ProviderError> {
    std::env::var(env_var).map(SecretString::from).map_err(|_| {
        ProviderError::AuthenticationFailed(format!(
            "environment variable {env_var} is not set"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_ollama_generator_without_key() {
        let settings = ProviderSettings::default();
        let generator = create_generator(&settings).unwrap();
        assert_eq!(generator.name(), "ollama");
    }

    #[test]
    fn test_create_ollama_generator_with_base_url() {
        let settings = ProviderSettings {
            base_url: Some("http://models.internal:11434/v1".to_string()),
            ..ProviderSettings::default()
        };
        let generator = create_generator(&settings).unwrap();
        assert_eq!(generator.name(), "ollama");
    }

    #[test]
    fn test_create_openai_generator_requires_key() {
        let settings = ProviderSettings {
            kind: ProviderKind::OpenAi,
            model: "gpt-4o-mini".to_string(),
            api_key_env: Some("STAGEGATE_NO_SUCH_KEY_VAR".to_string()),
            ..ProviderSettings::default()
        };
        let result = create_generator(&settings);
        match result {
            Err(ProviderError::AuthenticationFailed(message)) => {
                assert!(message.contains("STAGEGATE_NO_SUCH_KEY_VAR"));
            }
            Err(other) => panic!("expected AuthenticationFailed, got: {other}"),
            Ok(_) => panic!("expected error but got Ok"),
        }
    }
}
