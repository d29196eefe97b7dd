//! Connection configuration supplied opaquely to `open`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Read-only connection context: endpoint, credentials, and the single
/// per-operation timeout applied uniformly across transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server host, e.g. `measure.example.com:9443`.
    pub host: String,
    /// Bearer token identifying the authenticated user.
    pub auth_token: String,
    /// Token identifying the registered device.
    pub device_token: String,
    /// Per-operation timeout in milliseconds.
    pub timeout_ms: u64,
    /// Optional PEM root certificate for TLS-enabled channels.
    pub root_ca_pem: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            auth_token: String::new(),
            device_token: String::new(),
            timeout_ms: 10_000,
            root_ca_pem: None,
        }
    }
}

impl ConnectionConfig {
    /// The per-operation timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout() {
        let config = ConnectionConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(10_000));
        assert!(config.host.is_empty());
    }

    #[test]
    fn test_serde_round_trip_fields() {
        let config = ConnectionConfig {
            host: "measure.example.com:9443".to_string(),
            auth_token: "user-token".to_string(),
            device_token: "device-token".to_string(),
            timeout_ms: 2_500,
            root_ca_pem: None,
        };
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: ConnectionConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.timeout_ms, 2_500);
        assert_eq!(decoded.host, config.host);
        assert_eq!(decoded.auth_token, config.auth_token);
        assert_eq!(decoded.device_token, config.device_token);
        assert_eq!(decoded.root_ca_pem, None);
    }
}
