//! Pure pre-flight checks performed before any network action.

use crate::config::ConnectionConfig;
use crate::error::{Result, StreamError};

/// Validates the context required to set up a measurement stream.
///
/// Side-effect free; returns the first failure found.
pub fn validate_stream_setup(config: &ConnectionConfig, study_id: &str) -> Result<()> {
    if study_id.is_empty() {
        return Err(StreamError::validation("study_id is empty"));
    }
    if config.host.is_empty() {
        return Err(StreamError::validation("config.host is empty"));
    }
    if config.device_token.is_empty() {
        return Err(StreamError::validation("config.device_token is empty"));
    }
    if config.auth_token.is_empty() {
        return Err(StreamError::validation("config.auth_token is empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ConnectionConfig {
        ConnectionConfig {
            host: "measure.example.com:9443".to_string(),
            auth_token: "auth".to_string(),
            device_token: "device".to_string(),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn test_valid_setup_passes() {
        assert!(validate_stream_setup(&valid_config(), "study-1").is_ok());
    }

    #[test]
    fn test_empty_study_rejected() {
        let err = validate_stream_setup(&valid_config(), "").unwrap_err();
        assert!(matches!(err, StreamError::Validation { .. }));
    }

    #[test]
    fn test_missing_tokens_rejected() {
        let mut config = valid_config();
        config.auth_token.clear();
        assert!(validate_stream_setup(&config, "study-1").is_err());

        let mut config = valid_config();
        config.device_token.clear();
        assert!(validate_stream_setup(&config, "study-1").is_err());
    }
}
