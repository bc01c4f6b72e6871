//! Tokio codec for framed protocol messages

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, FrameType, MAX_PAYLOAD_SIZE};
use crate::message::{GoAwayCode, Hello, HelloAck, ResetCode};
use crate::stream_id::StreamId;

/// A complete protocol frame.
///
/// Stream-scoped variants carry a non-zero `stream_id`; the remaining
/// variants travel on [`StreamId::SESSION`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Open a stream
    Open { stream_id: StreamId },
    /// Acknowledge an open
    OpenAck { stream_id: StreamId },
    /// Stream payload
    Data { stream_id: StreamId, payload: Bytes },
    /// Grant `increment` more bytes of receive window
    WindowUpdate { stream_id: StreamId, increment: u32 },
    /// Half-close the sender's direction
    Close { stream_id: StreamId },
    /// Abort the stream
    Reset { stream_id: StreamId, code: ResetCode },
    /// Keepalive ping
    Ping { nonce: u64 },
    /// Keepalive response echoing the ping nonce
    Pong { nonce: u64 },
    /// Graceful session termination
    GoAway { code: GoAwayCode },
    /// Handshake request
    Hello(Hello),
    /// Handshake response
    HelloAck(HelloAck),
}

impl Frame {
    /// Get the frame type for this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Open { .. } => FrameType::Open,
            Frame::OpenAck { .. } => FrameType::OpenAck,
            Frame::Data { .. } => FrameType::Data,
            Frame::WindowUpdate { .. } => FrameType::WindowUpdate,
            Frame::Close { .. } => FrameType::Close,
            Frame::Reset { .. } => FrameType::Reset,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::GoAway { .. } => FrameType::GoAway,
            Frame::Hello(_) => FrameType::Hello,
            Frame::HelloAck(_) => FrameType::HelloAck,
        }
    }

    /// Stream this frame is addressed to
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Open { stream_id }
            | Frame::OpenAck { stream_id }
            | Frame::Data { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Close { stream_id }
            | Frame::Reset { stream_id, .. } => *stream_id,
            Frame::Ping { .. }
            | Frame::Pong { .. }
            | Frame::GoAway { .. }
            | Frame::Hello(_)
            | Frame::HelloAck(_) => StreamId::SESSION,
        }
    }

    fn parse(header: FrameHeader, mut payload: Bytes) -> Result<Self, ProtocolError> {
        let stream_id = header.stream_id;
        let frame_type = header.frame_type;
        let expect = |expected: usize, payload: &Bytes| {
            if payload.len() == expected {
                Ok(())
            } else {
                Err(ProtocolError::InvalidPayloadLength {
                    frame_type,
                    expected,
                    actual: payload.len(),
                })
            }
        };

        let frame = match frame_type {
            FrameType::Open => {
                expect(0, &payload)?;
                Frame::Open { stream_id }
            }
            FrameType::OpenAck => {
                expect(0, &payload)?;
                Frame::OpenAck { stream_id }
            }
            FrameType::Data => Frame::Data { stream_id, payload },
            FrameType::WindowUpdate => {
                expect(4, &payload)?;
                Frame::WindowUpdate {
                    stream_id,
                    increment: payload.get_u32(),
                }
            }
            FrameType::Close => {
                expect(0, &payload)?;
                Frame::Close { stream_id }
            }
            FrameType::Reset => {
                expect(2, &payload)?;
                let raw = payload.get_u16();
                let code = ResetCode::from_u16(raw).ok_or(ProtocolError::UnknownCode {
                    kind: "reset",
                    code: raw,
                })?;
                Frame::Reset { stream_id, code }
            }
            FrameType::Ping => {
                expect(8, &payload)?;
                Frame::Ping {
                    nonce: payload.get_u64(),
                }
            }
            FrameType::Pong => {
                expect(8, &payload)?;
                Frame::Pong {
                    nonce: payload.get_u64(),
                }
            }
            FrameType::GoAway => {
                expect(2, &payload)?;
                let raw = payload.get_u16();
                let code = GoAwayCode::from_u16(raw).ok_or(ProtocolError::UnknownCode {
                    kind: "go-away",
                    code: raw,
                })?;
                Frame::GoAway { code }
            }
            FrameType::Hello => Frame::Hello(bincode::deserialize(&payload)?),
            FrameType::HelloAck => Frame::HelloAck(bincode::deserialize(&payload)?),
        };

        Ok(frame)
    }
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
    /// Largest payload accepted in either direction
    max_payload: usize,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Create a codec with a lower payload limit
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            pending_header: None,
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }

        if src.len() < payload_len {
            // Save header and wait for more data
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        Frame::parse(header, payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame_type = frame.frame_type();
        let stream_id = frame.stream_id();

        let payload: Bytes = match frame {
            Frame::Open { .. } | Frame::OpenAck { .. } | Frame::Close { .. } => Bytes::new(),
            Frame::Data { payload, .. } => payload,
            Frame::WindowUpdate { increment, .. } => {
                Bytes::copy_from_slice(&increment.to_be_bytes())
            }
            Frame::Reset { code, .. } => Bytes::copy_from_slice(&code.as_u16().to_be_bytes()),
            Frame::Ping { nonce } | Frame::Pong { nonce } => {
                Bytes::copy_from_slice(&nonce.to_be_bytes())
            }
            Frame::GoAway { code } => Bytes::copy_from_slice(&code.as_u16().to_be_bytes()),
            Frame::Hello(hello) => bincode::serialize(&hello)?.into(),
            Frame::HelloAck(ack) => bincode::serialize(&ack)?.into(),
        };

        let payload_len = payload.len();
        if payload_len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }

        FrameHeader::new(stream_id, frame_type, payload_len as u32).encode(dst);
        dst.reserve(payload_len);
        dst.put_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;
    use crate::message::ClientInfo;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_codec_data_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = encode(Frame::Data {
            stream_id: StreamId::new(42),
            payload: Bytes::from("Hello, world!"),
        });

        assert_eq!(buf.len(), HEADER_SIZE + 13);

        match codec.decode(&mut buf).unwrap().unwrap() {
            Frame::Data { stream_id, payload } => {
                assert_eq!(stream_id, StreamId::new(42));
                assert_eq!(payload.as_ref(), b"Hello, world!");
            }
            other => panic!("Expected Data frame, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_hello_roundtrip() {
        let mut codec = FrameCodec::new();
        let hello = Hello::new("ak_abcd.secret", ClientInfo::local("host-a", "0.1.0"));
        let mut buf = encode(Frame::Hello(hello.clone()));

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Hello(hello)));
    }

    #[test]
    fn test_codec_control_frames() {
        let mut codec = FrameCodec::new();
        let frames = vec![
            Frame::Open { stream_id: StreamId::new(2) },
            Frame::WindowUpdate { stream_id: StreamId::new(2), increment: 65536 },
            Frame::Reset { stream_id: StreamId::new(2), code: ResetCode::Refused },
            Frame::Ping { nonce: u64::MAX },
            Frame::GoAway { code: GoAwayCode::Replaced },
        ];

        let mut buf = BytesMut::new();
        for frame in frames.clone() {
            codec.encode(frame, &mut buf).unwrap();
        }

        for expected in frames {
            assert_eq!(codec.decode(&mut buf).unwrap(), Some(expected));
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();
        let mut full_buf = encode(Frame::Data {
            stream_id: StreamId::new(1),
            payload: Bytes::from_static(b"partial payload"),
        });

        // Header split across reads
        let mut partial = full_buf.split_to(HEADER_SIZE - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Header complete, payload still short
        partial.extend_from_slice(&full_buf.split_to(3));
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);
        match codec.decode(&mut partial).unwrap().unwrap() {
            Frame::Data { payload, .. } => assert_eq!(payload.as_ref(), b"partial payload"),
            other => panic!("Expected Data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_codec_rejects_oversized_payload() {
        let mut codec = FrameCodec::with_max_payload(16);
        let mut buf = BytesMut::new();
        FrameHeader::new(StreamId::new(1), FrameType::Data, 17).encode(&mut buf);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::PayloadTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_codec_rejects_bad_fixed_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        FrameHeader::new(StreamId::new(1), FrameType::WindowUpdate, 2).encode(&mut buf);
        buf.extend_from_slice(&[0, 1]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidPayloadLength { expected: 4, actual: 2, .. })
        ));
    }
}
