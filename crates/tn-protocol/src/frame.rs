//! Frame header encoding/decoding
//!
//! The frame format uses an 8-byte header:
//! - stream_id: 4 bytes (u32, big-endian)
//! - frame_type: 1 byte (u8)
//! - payload_length: 3 bytes (u24, big-endian, max 16MB)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::stream_id::StreamId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (16MB - 1, limited by 24-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Frame type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Open a new stream
    Open = 0x01,
    /// Acknowledge a stream open
    OpenAck = 0x02,
    /// Stream payload bytes
    Data = 0x03,
    /// Grant additional receive window to the peer
    WindowUpdate = 0x04,
    /// Half-close: the sender will write nothing more
    Close = 0x05,
    /// Abort a stream
    Reset = 0x06,
    /// Keepalive ping
    Ping = 0x07,
    /// Keepalive response
    Pong = 0x08,
    /// Graceful session termination
    GoAway = 0x09,
    /// Handshake request (agent -> broker)
    Hello = 0x10,
    /// Handshake response (broker -> agent)
    HelloAck = 0x11,
}

impl FrameType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::OpenAck),
            0x03 => Some(Self::Data),
            0x04 => Some(Self::WindowUpdate),
            0x05 => Some(Self::Close),
            0x06 => Some(Self::Reset),
            0x07 => Some(Self::Ping),
            0x08 => Some(Self::Pong),
            0x09 => Some(Self::GoAway),
            0x10 => Some(Self::Hello),
            0x11 => Some(Self::HelloAck),
            _ => None,
        }
    }

    /// Whether frames of this type address a single stream (non-zero ID)
    pub fn is_stream_scoped(&self) -> bool {
        matches!(
            self,
            Self::Open
                | Self::OpenAck
                | Self::Data
                | Self::WindowUpdate
                | Self::Close
                | Self::Reset
        )
    }
}

/// Frame header containing routing and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stream this frame belongs to
    pub stream_id: StreamId,
    /// Type of frame
    pub frame_type: FrameType,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(stream_id: StreamId, frame_type: FrameType, payload_length: u32) -> Self {
        Self {
            stream_id,
            frame_type,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32(self.stream_id.as_u32());
        dst.put_u8(self.frame_type.as_u8());
        // payload_length: 3 bytes big-endian (24-bit)
        dst.put_u8((self.payload_length >> 16) as u8);
        dst.put_u16(self.payload_length as u16);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the frame type is unknown or the stream ID does not
    /// match the frame type.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate before consuming so a bad header leaves the buffer intact
        let type_byte = src[4];
        let frame_type =
            FrameType::from_u8(type_byte).ok_or(ProtocolError::UnknownFrameType(type_byte))?;

        let raw_id = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if frame_type.is_stream_scoped() == (raw_id == 0) {
            return Err(ProtocolError::InvalidStreamId {
                frame_type,
                stream_id: raw_id,
            });
        }

        let stream_id = StreamId::new(src.get_u32());
        let _ = src.get_u8();
        let len_high = src.get_u8() as u32;
        let len_low = src.get_u16() as u32;
        let payload_length = (len_high << 16) | len_low;

        Ok(Some(Self {
            stream_id,
            frame_type,
            payload_length,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(StreamId::new(42), FrameType::Data, 12345);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_max_payload_length() {
        let header = FrameHeader::new(StreamId::new(1), FrameType::Data, MAX_PAYLOAD_SIZE as u32);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload_length, MAX_PAYLOAD_SIZE as u32);
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[0u8; 4][..]);
        let result = FrameHeader::decode(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut buf = BytesMut::from(&[0, 0, 0, 1, 0xFE, 0, 0, 10][..]);
        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnknownFrameType(0xFE))));
        // Nothing consumed on error
        assert_eq!(buf.len(), HEADER_SIZE);
    }

    #[test]
    fn test_stream_frame_on_session_id_rejected() {
        let mut buf = BytesMut::new();
        FrameHeader::new(StreamId::SESSION, FrameType::Data, 0).encode(&mut buf);
        assert!(matches!(
            FrameHeader::decode(&mut buf),
            Err(ProtocolError::InvalidStreamId {
                frame_type: FrameType::Data,
                stream_id: 0
            })
        ));
    }

    #[test]
    fn test_session_frame_on_stream_id_rejected() {
        let mut buf = BytesMut::new();
        FrameHeader::new(StreamId::new(7), FrameType::Ping, 8).encode(&mut buf);
        assert!(FrameHeader::decode(&mut buf).is_err());
    }
}
