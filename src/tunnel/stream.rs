//! Framed packet stream over a byte transport
//!
//! The tunnel talks to the wire through the [`PacketSink`] and
//! [`PacketSource`] traits: one whole frame per `send` call, one whole frame
//! per `recv` call. [`FramedWriter`] and [`FramedReader`] implement them over
//! the two halves of a byte stream using the frame codec.
//!
//! Frame atomicity is not assumed from the transport; the tunnel serializes
//! senders on a lock around its `PacketSink`, and the sink writes each frame
//! with a single `write_all`.

use super::{Frame, TunnelError};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Outbound half of the tunnel's wire: sends one frame per call.
#[async_trait]
pub trait PacketSink: Send {
    /// Send a single frame. The frame is fully transmitted (or the call
    /// fails); partial frames are never left on the wire.
    async fn send(&mut self, frame: Frame) -> Result<(), TunnelError>;
}

/// Inbound half of the tunnel's wire: receives one frame per call.
#[async_trait]
pub trait PacketSource: Send {
    /// Receive the next frame. `Ok(None)` means the peer closed the stream
    /// cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TunnelError>;
}

/// [`PacketSink`] over the write half of a byte stream.
pub struct FramedWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Send + Unpin> FramedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> PacketSink for FramedWriter<W> {
    async fn send(&mut self, frame: Frame) -> Result<(), TunnelError> {
        let buf = frame.encode();
        self.writer
            .write_all(&buf)
            .await
            .map_err(|e| TunnelError::Stream(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| TunnelError::Stream(e.to_string()))?;
        Ok(())
    }
}

/// [`PacketSource`] over the read half of a byte stream.
pub struct FramedReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Send + Unpin> FramedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> PacketSource for FramedReader<R> {
    async fn recv(&mut self) -> Result<Option<Frame>, TunnelError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf)? {
                return Ok(Some(frame));
            }

            let n = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| TunnelError::Stream(e.to_string()))?;

            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TunnelError::Protocol(
                    "stream ended mid-frame".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_framed_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut writer = FramedWriter::new(client_write);
        let mut reader = FramedReader::new(server_read);

        let frames = vec![
            Frame::DialRequest {
                protocol: "tcp".to_string(),
                address: "127.0.0.1:80".to_string(),
                random: 7,
            },
            Frame::Data {
                connect_id: 100,
                data: Bytes::from_static(b"hello"),
            },
            Frame::CloseRequest { connect_id: 100 },
        ];

        for frame in &frames {
            writer.send(frame.clone()).await.unwrap();
        }

        for frame in &frames {
            let got = reader.recv().await.unwrap().unwrap();
            assert_eq!(&got, frame);
        }
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _server_write) = tokio::io::split(server);

        let mut reader = FramedReader::new(server_read);
        drop(client);

        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        let encoded = Frame::CloseRequest { connect_id: 1 }.encode();
        client_write.write_all(&encoded[..3]).await.unwrap();
        drop(client_write);
        drop(_client_read);

        let mut reader = FramedReader::new(server_read);
        assert!(matches!(
            reader.recv().await,
            Err(TunnelError::Protocol(_))
        ));
    }
}
