//! LightShow message types
//!
//! Defines the messages exchanged between the host and the LED controller
//! once a connection is established.

use serde::{Deserialize, Serialize};

/// Application messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Host greets the device after connecting (no payload)
    Ack,

    /// Device answers [`MessageType::Ack`]
    AckResponse,

    /// Device asks for the next frame; payload byte 0 is the LED count
    FrameRequest,

    /// Host frame data, two RGB565 bytes per LED
    FrameResponse,
}

impl MessageType {
    /// Get the message type byte
    pub fn byte(&self) -> u8 {
        match self {
            MessageType::Ack => 0x00,
            MessageType::AckResponse => 0x01,
            MessageType::FrameRequest => 0x02,
            MessageType::FrameResponse => 0x03,
        }
    }

    /// Look up a message type by its byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(MessageType::Ack),
            0x01 => Some(MessageType::AckResponse),
            0x02 => Some(MessageType::FrameRequest),
            0x03 => Some(MessageType::FrameResponse),
            _ => None,
        }
    }
}

impl From<MessageType> for u8 {
    fn from(message: MessageType) -> Self {
        message.byte()
    }
}

/// Pack an RGB colour into the two bytes the controller expects per LED.
///
/// First byte: top five green bits, top three red bits. Second byte: the next
/// three red bits, top five blue bits.
pub fn rgb565(r: u8, g: u8, b: u8) -> [u8; 2] {
    [(g & 0xF8) | (r >> 5), ((r & 0xFC) << 3) | (b >> 3)]
}

/// Build a frame payload with every one of `count` LEDs set to one colour
pub fn solid_frame(count: u8, r: u8, g: u8, b: u8) -> Vec<u8> {
    let led = rgb565(r, g, b);
    led.iter().copied().cycle().take(count as usize * 2).collect()
}
