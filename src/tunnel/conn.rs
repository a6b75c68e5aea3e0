//! Virtual connection endpoint
//!
//! A [`TunnelConn`] is one logical TCP-like byte stream multiplexed over the
//! tunnel, identified by a proxy-assigned connection id. Reads drain the
//! inbound queue the serve loop fills; writes become DATA frames on the
//! shared stream; close runs the CLOSE_REQ/CLOSE_RSP handshake.

use super::frame::{Frame, MAX_DATA_SIZE};
use super::multiplexer::TunnelShared;
use super::{TunnelError, CLOSE_TIMEOUT};
use bytes::{Buf, Bytes};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// One virtual connection through the tunnel.
///
/// All methods take `&self`; the connection can be shared across tasks
/// (e.g. behind an `Arc`) with concurrent reads, writes, and close.
/// Dropping an open connection closes it implicitly: the connection is
/// deregistered and a best-effort CLOSE_REQ is sent so the proxy does not
/// leak its upstream dial.
impl std::fmt::Debug for TunnelConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConn")
            .field("connect_id", &self.connect_id)
            .finish()
    }
}

pub struct TunnelConn {
    connect_id: u64,
    shared: Arc<TunnelShared>,
    reader: tokio::sync::Mutex<ConnReader>,
    close_rx: std::sync::Mutex<Option<oneshot::Receiver<Result<(), TunnelError>>>>,
    closed: AtomicBool,
}

/// Inbound queue state: the live receiver plus the unread tail of the most
/// recently dequeued chunk.
struct ConnReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    partial: Bytes,
}

impl TunnelConn {
    pub(crate) fn new(
        connect_id: u64,
        shared: Arc<TunnelShared>,
        data_rx: mpsc::UnboundedReceiver<Bytes>,
        close_rx: oneshot::Receiver<Result<(), TunnelError>>,
    ) -> Self {
        Self {
            connect_id,
            shared,
            reader: tokio::sync::Mutex::new(ConnReader {
                rx: data_rx,
                partial: Bytes::new(),
            }),
            close_rx: std::sync::Mutex::new(Some(close_rx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the proxy-assigned connection id
    pub fn connect_id(&self) -> u64 {
        self.connect_id
    }

    /// Read bytes into `buf`, blocking until data arrives.
    ///
    /// Returns `Ok(0)` at end-of-stream: after the connection is closed or
    /// the tunnel has failed, once already-queued bytes are drained. A read
    /// may return fewer bytes than one DATA frame carried; the remainder is
    /// handed out by subsequent reads.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut reader = self.reader.lock().await;
        loop {
            if !reader.partial.is_empty() {
                let n = reader.partial.len().min(buf.len());
                buf[..n].copy_from_slice(&reader.partial[..n]);
                reader.partial.advance(n);
                return Ok(n);
            }

            match reader.rx.recv().await {
                Some(chunk) => reader.partial = chunk,
                // All senders gone: closed or torn down, queue drained
                None => return Ok(0),
            }
        }
    }

    /// Write `buf` as a single DATA frame.
    ///
    /// On success every byte was handed to the stream; partial writes are
    /// never produced. One call maps to exactly one frame, so writes larger
    /// than [`MAX_DATA_SIZE`] are rejected.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, TunnelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::ConnectionClosed);
        }
        if self.shared.is_done() {
            return Err(TunnelError::TunnelClosed);
        }
        if buf.len() > MAX_DATA_SIZE {
            return Err(TunnelError::FrameTooLarge(buf.len(), MAX_DATA_SIZE));
        }

        self.shared
            .send_frame(Frame::Data {
                connect_id: self.connect_id,
                data: Bytes::copy_from_slice(buf),
            })
            .await?;

        Ok(buf.len())
    }

    /// Close the connection.
    ///
    /// Idempotent: the first call sends CLOSE_REQ and waits for CLOSE_RSP up
    /// to [`CLOSE_TIMEOUT`]; later calls return `Ok(())` immediately. On
    /// timeout the connection is deregistered (concurrent readers observe
    /// end-of-stream) and [`TunnelError::CloseTimeout`] is returned.
    pub async fn close(&self) -> Result<(), TunnelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.shared.is_done() {
            return Err(TunnelError::TunnelClosed);
        }

        let close_rx = self.close_rx.lock().unwrap().take();

        debug!(connect_id = self.connect_id, "closing connection");
        self.shared
            .send_frame(Frame::CloseRequest {
                connect_id: self.connect_id,
            })
            .await?;

        let Some(close_rx) = close_rx else {
            return Ok(());
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, close_rx).await {
            Ok(Ok(result)) => result,
            // Serve loop tore down before CLOSE_RSP arrived
            Ok(Err(_)) => Err(self
                .shared
                .cause()
                .unwrap_or(TunnelError::TunnelClosed)),
            Err(_) => {
                debug!(connect_id = self.connect_id, "close response timed out");
                // Unblock readers with end-of-stream
                self.shared.remove_conn(self.connect_id);
                Err(TunnelError::CloseTimeout)
            }
        }
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shared.is_done() {
            return;
        }

        debug!(connect_id = self.connect_id, "dropping open connection");
        self.shared.remove_conn(self.connect_id);

        let shared = Arc::clone(&self.shared);
        let connect_id = self.connect_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = shared
                    .send_frame(Frame::CloseRequest { connect_id })
                    .await;
            });
        }
    }
}
