//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.stagegate/` by
//! default) and deserializes it into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed, so a fresh install
//! works without any configuration.

use std::path::{Path, PathBuf};

use stagegate_types::config::EngineConfig;

/// Resolve the data directory.
///
/// Priority: `STAGEGATE_DATA_DIR`, then `~/.stagegate`, then a
/// `.stagegate` directory relative to the working directory.
pub fn resolve_data_dir() -> PathBuf {
    resolve_data_dir_from(std::env::var("STAGEGATE_DATA_DIR").ok())
}

fn resolve_data_dir_from(env_override: Option<String>) -> PathBuf {
    if let Some(dir) = env_override {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stagegate");
    }

    PathBuf::from(".stagegate")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and
///   returns the default.
/// - Otherwise returns the parsed config (missing sections filled with
///   defaults by serde).
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                "no config.toml found at {}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(
                "failed to read {}: {err}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}
