//! Server configuration loading.
//!
//! The bridge configuration is the core [`sonant_core::Config`] tree,
//! loaded from a YAML file with environment variable overrides on top.
//! CLI flags (handled in `main.rs`) take final precedence.

use std::path::Path;

use anyhow::{Context, Result};

/// Loads configuration from a YAML file, then applies environment
/// overrides.
pub fn load(path: Option<&Path>) -> Result<sonant_core::Config> {
    let mut config = if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        sonant_core::Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Applies environment variable overrides to the configuration.
fn apply_env_overrides(config: &mut sonant_core::Config) {
    if let Ok(val) = std::env::var("SONANT_SERVER_PORT") {
        if let Ok(port) = val.parse() {
            config.server.port = port;
        }
    }

    if let Ok(val) = std::env::var("SONANT_TWILIO_AUTH_TOKEN") {
        config.twilio.auth_token = val;
    }

    if let Ok(val) = std::env::var("SONANT_BEDROCK_REGION") {
        config.bedrock.region = val;
    }

    if let Ok(val) = std::env::var("SONANT_BEDROCK_MODEL_ID") {
        config.bedrock.model_id = val;
    }

    if let Ok(val) = std::env::var("SONANT_LOG_LEVEL") {
        config.logging.level = val;
    }
}
