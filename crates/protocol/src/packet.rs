//! Wire packet framing
//!
//! Every transfer on the data endpoint pair is one fixed-size frame:
//!
//! ```text
//! [type tag: u8][zero padding: header_len - 1][payload: payload_len]
//! ```
//!
//! The tag alone decides how the payload is read; the payload never describes
//! itself. Unused payload bytes are zero unless a packet type says otherwise
//! (stream data pads with the idle button pattern).
//!
//! The default layout is a 4-byte header and a 60-byte payload, filling one
//! 64-byte interrupt packet. Both sizes come from [`WireFormat`] so they can be
//! matched to the firmware without a rebuild.

use crate::buttons::ButtonState;
use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Default header length in bytes (type tag plus padding)
pub const DEFAULT_HEADER_LEN: usize = 4;

/// Default payload length in bytes
pub const DEFAULT_PAYLOAD_LEN: usize = 60;

/// Largest frame a layout may describe
pub const MAX_PACKET_LEN: usize = 4096;

/// Packet type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Host -> device: replace the emulated pad state with the 2-byte register
    FixedState = 0xef,
    /// Host -> device: switch the emulator into streaming mode
    StreamEnable = 0xf0,
    /// Device -> host: the emulator wants more frames
    StreamRequest = 0xf1,
    /// Host -> device: packed two-phase frames
    StreamData = 0xf2,
    /// Host -> device: no frames left
    StreamEnd = 0xf3,
}

impl PacketType {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0xef => Ok(PacketType::FixedState),
            0xf0 => Ok(PacketType::StreamEnable),
            0xf1 => Ok(PacketType::StreamRequest),
            0xf2 => Ok(PacketType::StreamData),
            0xf3 => Ok(PacketType::StreamEnd),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// Byte layout of a wire packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFormat {
    /// Header bytes, the first of which is the type tag
    #[serde(default = "WireFormat::default_header_len")]
    pub header_len: usize,
    /// Payload bytes following the header
    #[serde(default = "WireFormat::default_payload_len")]
    pub payload_len: usize,
}

impl Default for WireFormat {
    fn default() -> Self {
        Self {
            header_len: DEFAULT_HEADER_LEN,
            payload_len: DEFAULT_PAYLOAD_LEN,
        }
    }
}

impl WireFormat {
    fn default_header_len() -> usize {
        DEFAULT_HEADER_LEN
    }

    fn default_payload_len() -> usize {
        DEFAULT_PAYLOAD_LEN
    }

    /// Total frame size on the wire
    pub fn packet_len(&self) -> usize {
        self.header_len + self.payload_len
    }

    /// Number of movie frames one stream data packet carries
    pub fn frames_per_packet(&self) -> usize {
        self.payload_len / 2
    }

    /// Check that the layout can carry every packet type
    pub fn validate(&self) -> Result<()> {
        if self.header_len == 0 {
            return Err(ProtocolError::InvalidFormat(
                "header must have room for the type tag".to_string(),
            ));
        }
        if self.payload_len < ButtonState::LEN {
            return Err(ProtocolError::InvalidFormat(format!(
                "payload of {} bytes cannot hold the {}-byte button state",
                self.payload_len,
                ButtonState::LEN
            )));
        }
        match self.header_len.checked_add(self.payload_len) {
            Some(len) if len <= MAX_PACKET_LEN => Ok(()),
            _ => Err(ProtocolError::InvalidFormat(format!(
                "packet larger than {} bytes",
                MAX_PACKET_LEN
            ))),
        }
    }
}

/// A decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    pub kind: PacketType,
    pub payload: Bytes,
}

impl WirePacket {
    pub fn new(kind: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn stream_request() -> Self {
        Self::new(PacketType::StreamRequest, Bytes::new())
    }

    pub fn stream_enable() -> Self {
        Self::new(PacketType::StreamEnable, Bytes::new())
    }

    pub fn stream_end() -> Self {
        Self::new(PacketType::StreamEnd, Bytes::new())
    }

    pub fn stream_data(payload: impl Into<Bytes>) -> Self {
        Self::new(PacketType::StreamData, payload)
    }

    pub fn fixed_state(state: ButtonState) -> Self {
        Self::new(
            PacketType::FixedState,
            Bytes::copy_from_slice(&state.to_bytes()),
        )
    }

    /// Encode into a full-size frame
    pub fn encode(&self, format: &WireFormat) -> Result<Bytes> {
        if self.payload.len() > format.payload_len {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: format.payload_len,
            });
        }

        let mut frame = BytesMut::with_capacity(format.packet_len());
        frame.put_u8(self.kind.tag());
        frame.put_bytes(0, format.header_len - 1);
        frame.put_slice(&self.payload);
        frame.put_bytes(0, format.payload_len - self.payload.len());

        Ok(frame.freeze())
    }

    /// Decode a received frame
    ///
    /// Short frames are accepted as long as the tag is present; the payload
    /// is whatever follows the header, capped at the format's payload length.
    pub fn decode(frame: &[u8], format: &WireFormat) -> Result<Self> {
        let tag = *frame.first().ok_or(ProtocolError::BufferTooSmall {
            needed: 1,
            available: 0,
        })?;
        let kind = PacketType::try_from(tag)?;

        let start = format.header_len.min(frame.len());
        let end = (format.header_len + format.payload_len).min(frame.len());

        Ok(Self {
            kind,
            payload: Bytes::copy_from_slice(&frame[start..end]),
        })
    }
}
