//! # Proxy Tunnel
//!
//! A client library for reaching arbitrary backend addresses through a
//! proxy server, multiplexing virtual TCP-like connections over a single
//! framed stream.
//!
//! A caller connects a [`Tunnel`] to the proxy, then dials logical
//! destinations through it. Each dial runs a nonce-correlated
//! request/response handshake and yields a [`TunnelConn`]: a byte-oriented
//! duplex connection whose traffic is framed and multiplexed over the
//! shared stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Caller tasks                      │
//! │           (dial / read / write / close)              │
//! ├─────────────────────────────────────────────────────┤
//! │                 Tunnel multiplexer                   │
//! │   (pending dials, live connections, serve loop)      │
//! ├─────────────────────────────────────────────────────┤
//! │                   Frame codec                        │
//! │      (DIAL_REQ/RSP, DATA, CLOSE_REQ/RSP)             │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport layer                     │
//! │                  (TCP, TLS 1.3)                      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Tunnels are single-use by intent: production callers dial once per
//! tunnel. Multiple dials work but are unsupported. There is no
//! reconnection; when the stream fails the tunnel is terminal and every
//! outstanding operation resolves with the cause.
//!
//! ## Example
//!
//! ```no_run
//! use proxy_tunnel::{Config, Tunnel};
//!
//! # async fn run() -> proxy_tunnel::Result<()> {
//! let tunnel = Tunnel::connect(&Config::new("127.0.0.1:8090")).await?;
//! let conn = tunnel.dial("tcp", "10.0.0.5:80").await?;
//!
//! conn.write(b"GET / HTTP/1.0\r\n\r\n").await?;
//! let mut buf = [0u8; 4096];
//! let n = conn.read(&mut buf).await?;
//! # let _ = n;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use tunnel::{Tunnel, TunnelConn, TunnelError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
