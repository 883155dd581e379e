//! Packet encoding/decoding
//!
//! Packet format:
//! - 2 bytes: start marker `0x55 0xFF`
//! - 1 byte: message type
//! - N bytes: payload, every `0x55` escaped as `0x55 0xFE`
//! - 2 bytes: end marker `0x55 0x00`

use super::{
    FramingError, ProtocolError, END_BYTE, END_MARKER, ESCAPE_BYTE, MARKER, MIN_PACKET_SIZE,
    START_BYTE, START_MARKER,
};

/// A protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Message type byte, used to route the packet to its handlers
    pub message_type: u8,
    /// Unescaped payload
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a new packet with the given type and payload
    pub fn new(message_type: u8, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    /// Decode a packet from a complete wire span (start marker through end marker)
    pub fn from_bytes(data: &[u8]) -> Result<Self, FramingError> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(FramingError::PacketTooShort { len: data.len() });
        }
        if data[..2] != START_MARKER {
            return Err(FramingError::BadStart);
        }
        if data[data.len() - 2..] != END_MARKER {
            return Err(FramingError::BadEnd);
        }

        let message_type = data[2];
        let payload = unescape(&data[3..data.len() - 2])?;

        Ok(Self {
            message_type,
            payload,
        })
    }

    /// Encode the packet to raw bytes.
    ///
    /// The payload is escaped here; callers must not pre-escape it.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.message_type == MARKER {
            return Err(ProtocolError::ReservedMessageType(self.message_type));
        }

        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.extend_from_slice(&START_MARKER);
        bytes.push(self.message_type);
        escape_into(&self.payload, &mut bytes);
        bytes.extend_from_slice(&END_MARKER);
        Ok(bytes)
    }

    /// Get the total encoded size, escapes included
    pub fn encoded_size(&self) -> usize {
        let escapes = self.payload.iter().filter(|&&b| b == MARKER).count();
        MIN_PACKET_SIZE + self.payload.len() + escapes
    }
}

/// Builder for constructing packets
pub struct PacketBuilder {
    message_type: u8,
    payload: Vec<u8>,
}

impl PacketBuilder {
    /// Create a new packet builder for the given message type
    pub fn new(message_type: u8) -> Self {
        Self {
            message_type,
            payload: Vec::new(),
        }
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (big-endian)
    pub fn u16_be(mut self, value: u16) -> Self {
        self.payload.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Build the packet
    pub fn build(self) -> Packet {
        Packet::new(self.message_type, self.payload)
    }
}

/// Escape a payload so that no bare `0x55` remains
pub fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    escape_into(payload, &mut out);
    out
}

fn escape_into(payload: &[u8], out: &mut Vec<u8>) {
    for &b in payload {
        out.push(b);
        if b == MARKER {
            out.push(ESCAPE_BYTE);
        }
    }
}

/// Reverse [`escape`]. Any `0x55` not followed by `0xFE` is rejected.
pub fn unescape(body: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();

    while let Some(b) = iter.next() {
        if b != MARKER {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(ESCAPE_BYTE) => out.push(MARKER),
            Some(found @ (START_BYTE | END_BYTE)) => {
                return Err(FramingError::UnescapedMarker { following: found })
            }
            Some(found) => return Err(FramingError::InvalidEscape { found }),
            // A trailing lone marker cannot be a complete escape
            None => return Err(FramingError::InvalidEscape { found: END_BYTE }),
        }
    }

    Ok(out)
}
