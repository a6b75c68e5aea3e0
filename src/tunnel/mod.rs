//! Tunnel layer - multiplexed virtual connections over one framed stream
//!
//! Provides:
//! - Frame encoding/decoding
//! - The framed packet stream contract ([`PacketSink`] / [`PacketSource`])
//! - The tunnel multiplexer and its serve loop
//! - Virtual connection endpoints

mod conn;
mod frame;
mod multiplexer;
mod stream;

pub use conn::TunnelConn;
pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_DATA_SIZE, MAX_PAYLOAD_SIZE};
pub use multiplexer::Tunnel;
pub use stream::{FramedReader, FramedWriter, PacketSink, PacketSource};

use std::time::Duration;
use thiserror::Error;

/// How long a close waits for CLOSE_RSP before giving up
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunnel layer errors
///
/// Cloneable because tunnel teardown fans the terminal cause out to every
/// outstanding waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// Operation on a tunnel whose serve loop has exited
    #[error("tunnel closed")]
    TunnelClosed,

    /// The proxy refused the dial
    #[error("dial rejected by proxy: {0}")]
    DialRejected(String),

    /// Read or write on a locally closed connection
    #[error("connection closed")]
    ConnectionClosed,

    /// No CLOSE_RSP within the close deadline
    #[error("timeout waiting for close response")]
    CloseTimeout,

    /// The proxy reported an error closing the connection
    #[error("close failed: {0}")]
    CloseFailed(String),

    /// Malformed or unexpected frame; fatal to the tunnel
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying stream failed
    #[error("stream error: {0}")]
    Stream(String),

    /// A single write may not exceed one frame
    #[error("frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),
}
