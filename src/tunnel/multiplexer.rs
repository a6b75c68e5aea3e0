//! Tunnel multiplexer
//!
//! Owns the single framed stream to the proxy and multiplexes virtual
//! connections over it. One spawned serve task is the sole reader of the
//! stream; dialers and connections send through a shared, locked sink.
//!
//! The dial handshake is correlated by a random nonce: the completion slot
//! is registered *before* DIAL_REQ is sent, so the serve task always finds
//! it no matter how quickly DIAL_RSP comes back, and the caller's await is
//! a pure pickup.

use super::conn::TunnelConn;
use super::frame::Frame;
use super::stream::{FramedReader, FramedWriter, PacketSink, PacketSource};
use super::TunnelError;
use crate::config::Config;
#[cfg(feature = "tls")]
use crate::transport::TlsTransport;
use crate::transport::{TcpTransport, Transport, TransportError};
use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

/// A tunnel to the proxy server.
///
/// Intended for a single [`dial`](Tunnel::dial) per tunnel in production
/// use; further dials on the same tunnel work but are unsupported. A tunnel
/// is terminal once its stream fails, the peer hangs up, or
/// [`shutdown`](Tunnel::shutdown) is called; there is no reconnection.
///
/// Dropping the tunnel shuts it down; virtual connections obtained from it
/// then read end-of-stream.
pub struct Tunnel {
    shared: Arc<TunnelShared>,
}

/// State shared between the tunnel facade, its connections, and the serve
/// task.
pub(crate) struct TunnelShared {
    /// Outbound half of the stream. One frame per lock hold; never touched
    /// by the serve task directly.
    writer: tokio::sync::Mutex<Box<dyn PacketSink>>,
    /// In-flight dials awaiting DIAL_RSP, keyed by nonce.
    pending_dials: std::sync::Mutex<HashMap<u64, DialSlot>>,
    /// Live virtual connections, keyed by proxy-assigned id.
    conns: std::sync::Mutex<HashMap<u64, ConnEntry>>,
    done: AtomicBool,
    done_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    cause: std::sync::Mutex<Option<TunnelError>>,
}

type DialSlot = oneshot::Sender<Result<TunnelConn, TunnelError>>;

struct ConnEntry {
    /// Inbound byte queue; dropping the sender is the end-of-stream signal.
    data_tx: mpsc::UnboundedSender<Bytes>,
    close_tx: oneshot::Sender<Result<(), TunnelError>>,
}

impl Tunnel {
    /// Connect to the proxy and establish a tunnel.
    ///
    /// Transport setup (TCP connect plus TLS handshake if configured) is
    /// bounded by `config.transport.connect_timeout`. On any failure before
    /// the serve task starts, nothing is left running.
    pub async fn connect(config: &Config) -> crate::Result<Self> {
        let setup_timeout = Duration::from_secs(config.transport.connect_timeout);
        Self::connect_with_timeout(setup_timeout, config).await
    }

    /// Connect with an explicit bound on transport setup.
    ///
    /// `setup_timeout` covers transport setup only; the tunnel's lifetime
    /// afterwards is bounded by stream failure or [`shutdown`](Self::shutdown).
    pub async fn connect_with_timeout(
        setup_timeout: Duration,
        config: &Config,
    ) -> crate::Result<Self> {
        let transport = build_transport(config)?;

        let stream = tokio::time::timeout(
            setup_timeout,
            transport.connect(&config.proxy.address),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        debug!(address = %config.proxy.address, "tunnel stream established");

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self::new(
            FramedWriter::new(write_half),
            FramedReader::new(read_half),
        ))
    }

    /// Build a tunnel over an already-established packet stream and spawn
    /// its serve task. Must be called within a tokio runtime.
    pub fn new(sink: impl PacketSink + 'static, source: impl PacketSource + 'static) -> Self {
        let (done_tx, _) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(TunnelShared {
            writer: tokio::sync::Mutex::new(Box::new(sink)),
            pending_dials: std::sync::Mutex::new(HashMap::new()),
            conns: std::sync::Mutex::new(HashMap::new()),
            done: AtomicBool::new(false),
            done_tx,
            shutdown_tx,
            cause: std::sync::Mutex::new(None),
        });

        tokio::spawn(serve(Arc::clone(&shared), Box::new(source), shutdown_rx));

        Self { shared }
    }

    /// Dial `address` through the proxy.
    ///
    /// `protocol` is passed through opaquely (normally `"tcp"`). Blocks
    /// until the proxy answers, the tunnel dies, or the returned future is
    /// dropped; dropping the future cancels the dial and closes any
    /// connection a racing response may already have delivered.
    pub async fn dial(&self, protocol: &str, address: &str) -> Result<TunnelConn, TunnelError> {
        if self.is_done() {
            return Err(self.shared.cause().unwrap_or(TunnelError::TunnelClosed));
        }

        // Register the completion slot before sending, with a nonce unique
        // among live pending dials.
        let (slot_tx, slot_rx) = oneshot::channel();
        let random = {
            let mut pending = self.shared.pending_dials.lock().unwrap();
            loop {
                let nonce: u64 = rand::random();
                if let Entry::Vacant(vacant) = pending.entry(nonce) {
                    vacant.insert(slot_tx);
                    break nonce;
                }
            }
        };

        let mut guard = DialGuard {
            shared: Arc::clone(&self.shared),
            random,
            rx: slot_rx,
            armed: true,
        };

        debug!(random, protocol, address, "dialing");
        self.shared
            .send_frame(Frame::DialRequest {
                protocol: protocol.to_string(),
                address: address.to_string(),
                random,
            })
            .await?;

        let mut done_rx = self.shared.done_tx.subscribe();
        let outcome = tokio::select! {
            outcome = &mut guard.rx => outcome,
            _ = done_rx.wait_for(|done| *done) => {
                // Guard cleanup retires the slot and closes any connection
                // a racing response delivered.
                return Err(self.shared.cause().unwrap_or(TunnelError::TunnelClosed));
            }
        };
        guard.armed = false;

        match outcome {
            Ok(result) => result,
            // Slot dropped without resolution: serve task is gone
            Err(_) => Err(self.shared.cause().unwrap_or(TunnelError::TunnelClosed)),
        }
    }

    /// Resolves once the serve task has exited and all waiters have been
    /// resolved.
    pub async fn done(&self) {
        let mut done_rx = self.shared.done_tx.subscribe();
        let _ = done_rx.wait_for(|done| *done).await;
    }

    /// Whether the tunnel has terminated.
    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// The error that terminated the tunnel, once done.
    pub fn cause(&self) -> Option<TunnelError> {
        self.shared.cause()
    }

    /// Tear the tunnel down. Idempotent; resolves once teardown has
    /// completed. All subsequent operations fail with
    /// [`TunnelError::TunnelClosed`].
    pub async fn shutdown(&self) {
        self.shared.shutdown_tx.send_replace(true);
        self.done().await;
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shared.shutdown_tx.send_replace(true);
    }
}

impl TunnelShared {
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn cause(&self) -> Option<TunnelError> {
        self.cause.lock().unwrap().clone()
    }

    /// Send one frame on the shared stream. Senders serialize on the writer
    /// lock; the lock is held for exactly one frame.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), TunnelError> {
        if self.is_done() {
            return Err(self.cause().unwrap_or(TunnelError::TunnelClosed));
        }
        let mut writer = self.writer.lock().await;
        writer.send(frame).await
    }

    pub(crate) fn remove_conn(&self, connect_id: u64) {
        self.conns.lock().unwrap().remove(&connect_id);
    }

    fn spawn_close_request(self: &Arc<Self>, connect_id: u64) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = shared.send_frame(Frame::CloseRequest { connect_id }).await {
                debug!(connect_id, %err, "failed to send close request");
            }
        });
    }

    /// Handle one inbound frame. An error is fatal to the tunnel.
    fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<(), TunnelError> {
        match frame {
            Frame::DialResponse {
                random,
                connect_id,
                error,
            } => {
                self.handle_dial_response(random, connect_id, error);
                Ok(())
            }
            Frame::Data { connect_id, data } => {
                let conns = self.conns.lock().unwrap();
                match conns.get(&connect_id) {
                    Some(entry) => {
                        if entry.data_tx.send(data).is_err() {
                            debug!(connect_id, "data for connection with no reader");
                        }
                    }
                    // Already closed; late data is dropped
                    None => debug!(connect_id, "data for unknown connection"),
                }
                Ok(())
            }
            Frame::CloseResponse { connect_id, error } => {
                let entry = self.conns.lock().unwrap().remove(&connect_id);
                match entry {
                    Some(entry) => {
                        trace!(connect_id, "connection closed");
                        let result = if error.is_empty() {
                            Ok(())
                        } else {
                            Err(TunnelError::CloseFailed(error))
                        };
                        let _ = entry.close_tx.send(result);
                    }
                    None => debug!(connect_id, "close response for unknown connection"),
                }
                Ok(())
            }
            Frame::DialRequest { .. } | Frame::CloseRequest { .. } => {
                Err(TunnelError::Protocol(format!(
                    "unsolicited {:?} frame from proxy",
                    frame.frame_type()
                )))
            }
        }
    }

    fn handle_dial_response(self: &Arc<Self>, random: u64, connect_id: u64, error: String) {
        let slot = self.pending_dials.lock().unwrap().remove(&random);

        let Some(slot) = slot else {
            // Caller abandoned the dial. Close the connection the proxy
            // spawned so it does not leak its upstream dial.
            debug!(random, connect_id, "dial response with no pending dial");
            if error.is_empty() {
                self.spawn_close_request(connect_id);
            }
            return;
        };

        if !error.is_empty() {
            debug!(random, %error, "dial rejected by proxy");
            let _ = slot.send(Err(TunnelError::DialRejected(error)));
            return;
        }

        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();

        {
            let mut conns = self.conns.lock().unwrap();
            if conns.contains_key(&connect_id) {
                // Protocol violation; the existing connection wins. No
                // CLOSE_REQ either way: the id is ambiguous.
                warn!(connect_id, "duplicate connection id from proxy");
                let _ = slot.send(Err(TunnelError::Protocol(format!(
                    "duplicate connection id {}",
                    connect_id
                ))));
                return;
            }
            conns.insert(connect_id, ConnEntry { data_tx, close_tx });
        }

        let conn = TunnelConn::new(connect_id, Arc::clone(self), data_rx, close_rx);
        debug!(random, connect_id, "dial succeeded");

        if slot.send(Ok(conn)).is_err() {
            // Caller went away after we removed the slot. The returned
            // connection drops here, which deregisters it and issues
            // CLOSE_REQ.
            debug!(connect_id, "dial completed after caller went away");
        }
    }

    /// Resolve every outstanding waiter with `cause` and clear both
    /// registries. Runs exactly once, on serve task exit.
    fn teardown(&self, cause: TunnelError) {
        debug!(%cause, "tunnel terminated");
        *self.cause.lock().unwrap() = Some(cause.clone());
        self.done.store(true, Ordering::Release);

        let pending: Vec<_> = {
            let mut pending = self.pending_dials.lock().unwrap();
            pending.drain().collect()
        };
        for (_, slot) in pending {
            let _ = slot.send(Err(cause.clone()));
        }

        let conns: Vec<_> = {
            let mut conns = self.conns.lock().unwrap();
            conns.drain().collect()
        };
        for (_, entry) in conns {
            // Dropping data_tx unblocks readers with end-of-stream once
            // they drain what was already queued
            let _ = entry.close_tx.send(Err(cause.clone()));
        }

        self.done_tx.send_replace(true);
    }
}

/// Retires the pending-dial slot if the dial future is dropped before
/// resolution.
struct DialGuard {
    shared: Arc<TunnelShared>,
    random: u64,
    rx: oneshot::Receiver<Result<TunnelConn, TunnelError>>,
    armed: bool,
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.shared.pending_dials.lock().unwrap().remove(&self.random);

        // A racing DIAL_RSP may have deposited a connection between the
        // serve task removing the slot and this cleanup; dropping the
        // connection closes it.
        if let Ok(Ok(conn)) = self.rx.try_recv() {
            drop(conn);
        }
    }
}

/// The serve loop: sole reader of the stream, dispatching frames until the
/// stream fails, the peer hangs up, or shutdown is requested.
async fn serve(
    shared: Arc<TunnelShared>,
    mut source: Box<dyn PacketSource>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let cause = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("tunnel shutdown requested");
                break TunnelError::TunnelClosed;
            }
            frame = source.recv() => match frame {
                Ok(Some(frame)) => {
                    trace!(frame_type = ?frame.frame_type(), "frame received");
                    if let Err(err) = shared.dispatch(frame) {
                        warn!(%err, "fatal protocol error");
                        break err;
                    }
                }
                Ok(None) => {
                    debug!("stream closed by peer");
                    break TunnelError::Stream("stream closed by peer".to_string());
                }
                Err(err) => {
                    debug!(%err, "stream receive failed");
                    break err;
                }
            }
        }
    };

    shared.teardown(cause);
}

fn build_transport(config: &Config) -> crate::Result<Box<dyn Transport>> {
    if let Some(tls) = &config.proxy.tls {
        #[cfg(feature = "tls")]
        {
            let transport = TlsTransport::new(config.transport.clone(), tls)?;
            return Ok(Box::new(transport));
        }
        #[cfg(not(feature = "tls"))]
        {
            let _ = tls;
            return Err(crate::config::ConfigError::Unsupported(
                "proxy.tls is set but the tls feature is not enabled".to_string(),
            )
            .into());
        }
    }
    Ok(Box::new(TcpTransport::new(config.transport.clone())))
}
