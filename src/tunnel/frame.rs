//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |          Length (4B)              |
//! +--------+--------+--------+--------+--------+
//! |              Payload                       |
//! +--------------------------------------------+
//! ```
//!
//! The payload layout depends on the frame type. Integers are big-endian;
//! strings are length-prefixed with a 2-byte length.

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 5;

/// Maximum payload size (64 KB - header)
pub const MAX_PAYLOAD_SIZE: usize = 65535 - FRAME_HEADER_SIZE;

/// Maximum data carried by a single DATA frame (payload minus connection id)
pub const MAX_DATA_SIZE: usize = MAX_PAYLOAD_SIZE - 8;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Dial request (client to proxy)
    DialRequest = 0x01,
    /// Dial response (proxy to client)
    DialResponse = 0x02,
    /// Data frame (both directions)
    Data = 0x03,
    /// Close request (client to proxy)
    CloseRequest = 0x04,
    /// Close response (proxy to client)
    CloseResponse = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::DialRequest),
            0x02 => Ok(FrameType::DialResponse),
            0x03 => Ok(FrameType::Data),
            0x04 => Ok(FrameType::CloseRequest),
            0x05 => Ok(FrameType::CloseResponse),
            _ => Err(TunnelError::Protocol(format!(
                "unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
///
/// An empty `error` string in a response means success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Ask the proxy to dial `address` on our behalf. `random` correlates
    /// the eventual response; the proxy echoes it back verbatim.
    DialRequest {
        protocol: String,
        address: String,
        random: u64,
    },
    /// The proxy's answer to a dial. `connect_id` identifies the new
    /// connection on success.
    DialResponse {
        random: u64,
        connect_id: u64,
        error: String,
    },
    /// Bytes for an established connection.
    Data { connect_id: u64, data: Bytes },
    /// Ask the proxy to close a connection.
    CloseRequest { connect_id: u64 },
    /// The proxy's answer to a close request.
    CloseResponse { connect_id: u64, error: String },
}

impl Frame {
    /// Get the type tag for this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::DialRequest { .. } => FrameType::DialRequest,
            Frame::DialResponse { .. } => FrameType::DialResponse,
            Frame::Data { .. } => FrameType::Data,
            Frame::CloseRequest { .. } => FrameType::CloseRequest,
            Frame::CloseResponse { .. } => FrameType::CloseResponse,
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut payload = BytesMut::new();

        match self {
            Frame::DialRequest {
                protocol,
                address,
                random,
            } => {
                payload.put_u64(*random);
                put_string(&mut payload, protocol);
                put_string(&mut payload, address);
            }
            Frame::DialResponse {
                random,
                connect_id,
                error,
            } => {
                payload.put_u64(*random);
                payload.put_u64(*connect_id);
                put_string(&mut payload, error);
            }
            Frame::Data { connect_id, data } => {
                payload.put_u64(*connect_id);
                payload.extend_from_slice(data);
            }
            Frame::CloseRequest { connect_id } => {
                payload.put_u64(*connect_id);
            }
            Frame::CloseResponse { connect_id, error } => {
                payload.put_u64(*connect_id);
                put_string(&mut payload, error);
            }
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u8(self.frame_type() as u8);
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        buf
    }

    /// Decode a frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete frame.
    /// A malformed header or payload is fatal to the tunnel.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(buf[0])?;
        let payload_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::Protocol(format!(
                "frame too large: {} > {}",
                payload_len, MAX_PAYLOAD_SIZE
            )));
        }

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let mut payload = buf.split_to(payload_len);

        let frame = match frame_type {
            FrameType::DialRequest => {
                let random = take_u64(&mut payload, frame_type)?;
                let protocol = take_string(&mut payload, frame_type)?;
                let address = take_string(&mut payload, frame_type)?;
                Frame::DialRequest {
                    protocol,
                    address,
                    random,
                }
            }
            FrameType::DialResponse => {
                let random = take_u64(&mut payload, frame_type)?;
                let connect_id = take_u64(&mut payload, frame_type)?;
                let error = take_string(&mut payload, frame_type)?;
                Frame::DialResponse {
                    random,
                    connect_id,
                    error,
                }
            }
            FrameType::Data => {
                let connect_id = take_u64(&mut payload, frame_type)?;
                return Ok(Some(Frame::Data {
                    connect_id,
                    data: payload.freeze(),
                }));
            }
            FrameType::CloseRequest => {
                let connect_id = take_u64(&mut payload, frame_type)?;
                Frame::CloseRequest { connect_id }
            }
            FrameType::CloseResponse => {
                let connect_id = take_u64(&mut payload, frame_type)?;
                let error = take_string(&mut payload, frame_type)?;
                Frame::CloseResponse { connect_id, error }
            }
        };

        if !payload.is_empty() {
            return Err(TunnelError::Protocol(format!(
                "{} trailing bytes in {:?} frame",
                payload.len(),
                frame_type
            )));
        }

        Ok(Some(frame))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        self.encode().len()
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

fn take_u64(payload: &mut BytesMut, frame_type: FrameType) -> Result<u64, TunnelError> {
    if payload.remaining() < 8 {
        return Err(TunnelError::Protocol(format!(
            "truncated {:?} frame",
            frame_type
        )));
    }
    Ok(payload.get_u64())
}

fn take_string(payload: &mut BytesMut, frame_type: FrameType) -> Result<String, TunnelError> {
    if payload.remaining() < 2 {
        return Err(TunnelError::Protocol(format!(
            "truncated {:?} frame",
            frame_type
        )));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(TunnelError::Protocol(format!(
            "truncated {:?} frame",
            frame_type
        )));
    }
    let raw = payload.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| TunnelError::Protocol(format!("invalid utf-8 in {:?} frame", frame_type)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut encoded = frame.encode();
        Frame::decode(&mut encoded).unwrap().unwrap()
    }

    #[test]
    fn test_dial_request_roundtrip() {
        let frame = Frame::DialRequest {
            protocol: "tcp".to_string(),
            address: "127.0.0.1:80".to_string(),
            random: 0xDEAD_BEEF_CAFE_F00D,
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_data_roundtrip() {
        let frame = Frame::Data {
            connect_id: 100,
            data: Bytes::from_static(b"Hello, World!"),
        };
        let mut encoded = frame.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 8 + 13);

        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_empty_data_roundtrip() {
        let frame = Frame::Data {
            connect_id: 7,
            data: Bytes::new(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_response_roundtrips() {
        let frame = Frame::DialResponse {
            random: 42,
            connect_id: 100,
            error: String::new(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);

        let frame = Frame::CloseResponse {
            connect_id: 100,
            error: "connection reset".to_string(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_partial_frame() {
        let frame = Frame::CloseRequest { connect_id: 100 };
        let encoded = frame.encode();

        // Header alone is not enough
        let mut partial = BytesMut::from(&encoded[..FRAME_HEADER_SIZE]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());

        // Feeding the rest completes the frame
        partial.extend_from_slice(&encoded[FRAME_HEADER_SIZE..]);
        assert_eq!(Frame::decode(&mut partial).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_two_frames_in_buffer() {
        let first = Frame::CloseRequest { connect_id: 1 };
        let second = Frame::Data {
            connect_id: 1,
            data: Bytes::from_static(b"x"),
        };

        let mut buf = first.encode();
        buf.extend_from_slice(&second.encode());

        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap(), second);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7F);
        buf.put_u32(0);

        assert!(matches!(
            Frame::decode(&mut buf),
            Err(TunnelError::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_payload() {
        // CloseRequest with a 4-byte payload instead of 8
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::CloseRequest as u8);
        buf.put_u32(4);
        buf.put_u32(100);

        assert!(matches!(
            Frame::decode(&mut buf),
            Err(TunnelError::Protocol(_))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::Data as u8);
        buf.put_u32((MAX_PAYLOAD_SIZE + 1) as u32);

        assert!(matches!(
            Frame::decode(&mut buf),
            Err(TunnelError::Protocol(_))
        ));
    }
}
