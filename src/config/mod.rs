//! Configuration management

use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration asks for something this build cannot do
    #[error("{0}")]
    Unsupported(String),
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Proxy endpoint configuration
    pub proxy: ProxyConfig,
    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// Configuration for a plain-TCP proxy at `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            proxy: ProxyConfig {
                address: address.into(),
                tls: None,
            },
            transport: TransportConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Proxy endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy server address, e.g. "proxy.example.com:8090"
    pub address: String,
    /// TLS settings; plain TCP when absent
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// TLS settings for the proxy connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Server name for SNI and certificate verification
    pub server_name: String,
    /// ALPN protocols to offer, if any
    #[serde(default)]
    pub alpn: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            address = "127.0.0.1:8090"
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.address, "127.0.0.1:8090");
        assert!(config.proxy.tls.is_none());
        assert_eq!(config.transport.connect_timeout, 30);
    }

    #[test]
    fn test_parse_tls() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            address = "proxy.example.com:443"

            [proxy.tls]
            server_name = "proxy.example.com"
            alpn = ["h2"]

            [transport]
            connect_timeout = 5
            "#,
        )
        .unwrap();

        let tls = config.proxy.tls.unwrap();
        assert_eq!(tls.server_name, "proxy.example.com");
        assert_eq!(tls.alpn, vec!["h2"]);
        assert_eq!(config.transport.connect_timeout, 5);
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::new("127.0.0.1:8090");
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.proxy.address, config.proxy.address);
    }
}
