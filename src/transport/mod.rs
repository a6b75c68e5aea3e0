//! Transport layer implementations
//!
//! Provides pluggable transport backends for the stream the tunnel runs
//! over:
//! - TCP (raw, for testing and internal networks)
//! - TLS 1.3 (rustls)

mod tcp;

#[cfg(feature = "tls")]
mod tls;

pub use tcp::TcpTransport;

#[cfg(feature = "tls")]
pub use tls::TlsTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Byte stream a tunnel runs over
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamConn for T {}

/// An established transport stream, ready to be split into read and write
/// halves
pub type TransportStream = Box<dyn StreamConn>;

/// Trait for transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote endpoint and hand back the byte stream
    async fn connect(&self, addr: &str) -> Result<TransportStream, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            nodelay: true,
        }
    }
}
