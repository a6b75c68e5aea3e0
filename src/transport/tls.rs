//! TLS 1.3 transport (rustls)
//!
//! Wraps the proxy connection in TLS. Server certificates are verified
//! against the webpki root store; the server name for SNI and verification
//! comes from [`TlsConfig`](crate::config::TlsConfig).

use super::{Transport, TransportConfig, TransportError, TransportStream};
use crate::config::TlsConfig;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// TLS transport
pub struct TlsTransport {
    config: TransportConfig,
    tls_config: Arc<rustls::ClientConfig>,
    server_name: String,
}

impl TlsTransport {
    /// Create a new TLS transport
    pub fn new(config: TransportConfig, tls: &TlsConfig) -> Result<Self, TransportError> {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let mut tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if !tls.alpn.is_empty() {
            tls_config.alpn_protocols =
                tls.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        }

        Ok(Self {
            config,
            tls_config: Arc::new(tls_config),
            server_name: tls.server_name.clone(),
        })
    }

    /// Get the server name used for SNI and certificate verification
    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn connect(&self, addr: &str) -> Result<TransportStream, TransportError> {
        let timeout = std::time::Duration::from_secs(self.config.connect_timeout);

        let tcp_stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)?;

        if self.config.nodelay {
            tcp_stream.set_nodelay(true).ok();
        }

        let connector = TlsConnector::from(self.tls_config.clone());

        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|e| TransportError::Tls(format!("invalid server name: {}", e)))?;

        let tls_stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Box::new(tls_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_transport() {
        let tls = TlsConfig {
            server_name: "proxy.example.com".to_string(),
            alpn: vec![],
        };
        let transport = TlsTransport::new(TransportConfig::default(), &tls).unwrap();
        assert_eq!(transport.server_name(), "proxy.example.com");
    }

    #[test]
    fn test_alpn_carried_into_config() {
        let tls = TlsConfig {
            server_name: "proxy.example.com".to_string(),
            alpn: vec!["h2".to_string()],
        };
        let transport = TlsTransport::new(TransportConfig::default(), &tls).unwrap();
        assert!(transport
            .tls_config
            .alpn_protocols
            .contains(&b"h2".to_vec()));
    }
}
