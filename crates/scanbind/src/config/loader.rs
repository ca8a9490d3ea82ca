use std::path::Path;

use log::{debug, info};

use crate::config::schema::{Config, CONFIG_VERSION};
use crate::error::ConfigError;
use crate::quota::PeriodClock;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

/// Loads `path`, or the defaults when the file does not exist.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        info!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    debug!("Loading config from {}", path.display());
    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != CONFIG_VERSION {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.credentials.monthly_cap < 1 {
        return Err(ConfigError::Validation {
            message: format!(
                "monthly_cap must be at least 1, got {}",
                config.credentials.monthly_cap
            ),
        });
    }

    PeriodClock::from_name(&config.credentials.timezone)?;

    if config.ocr.endpoint.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "ocr.endpoint must not be empty".to_string(),
        });
    }

    Ok(())
}
