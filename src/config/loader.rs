//! Configuration loading

use std::path::Path;

use tracing::debug;

use super::types::DeviceConfig;
use crate::error::ConfigError;

/// Load a device configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<DeviceConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: DeviceConfig = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    Ok(config)
}

/// Load a device configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<DeviceConfig, ConfigError> {
    let config: DeviceConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = load_config_str("{}").unwrap();
        assert_eq!(config.listen_port, 0);
        assert!(config.encryption_workers >= 1);
    }

    #[test]
    fn test_partial_override() {
        let config = load_config_str(
            r#"{
                "listen_port": 51820,
                "encryption_workers": 2,
                "queue": { "encryption_depth": 64 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.listen_port, 51820);
        assert_eq!(config.encryption_workers, 2);
        assert_eq!(config.queue.encryption_depth, 64);
        // untouched fields keep their defaults
        assert_eq!(config.queue.nonce_depth, 1024);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(load_config_str(r#"{"encryption_workers": 0}"#).is_err());
        assert!(load_config_str("not json").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load_config("/nonexistent/rust-tunnel.json").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
