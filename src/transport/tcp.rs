//! Raw TCP transport (for testing and internal networks)

use super::{Transport, TransportConfig, TransportError, TransportStream};
use async_trait::async_trait;
use tokio::net::TcpStream;

/// Raw TCP transport
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &str) -> Result<TransportStream, TransportError> {
        let timeout = std::time::Duration::from_secs(self.config.connect_timeout);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)?;

        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_transport() {
        // Start a simple echo server
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        // Connect client
        let transport = TcpTransport::new_default();
        let mut stream = transport.connect(&addr.to_string()).await.unwrap();

        // Send and receive
        let msg = b"Hello, TCP!";
        stream.write_all(msg).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], msg);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::new_default();
        assert!(transport.connect("127.0.0.1:1").await.is_err());
    }
}
