//! Protocol errors

use thiserror::Error;

/// Errors that can occur during link communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Not connected to device")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("No LightShow device answered on any serial port")]
    NoDeviceFound,

    #[error("Message type {0:#04x} is reserved for framing")]
    ReservedMessageType(u8),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Violations of the packet framing rules.
///
/// These are reported through error callbacks; the byte stream resynchronises
/// at the next start marker and the connection stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Received unescaped 0x55 followed by {following:#04x} in input stream")]
    UnescapedMarker { following: u8 },

    #[error("Incorrect escape after 0x55: expected 0xfe, got {found:#04x}")]
    InvalidEscape { found: u8 },

    #[error("Packet truncated: new start marker before end of previous packet")]
    TruncatedPacket,

    #[error("Illegal packet size {len}: expected at least one byte between start and end")]
    PacketTooShort { len: usize },

    #[error("Packet exceeds {max} bytes without an end marker")]
    PacketTooLong { max: usize },

    #[error("Illegal start for packet: expected 0x55 0xff")]
    BadStart,

    #[error("Illegal end for packet: expected 0x55 0x00")]
    BadEnd,

    #[error("Unknown message type {0:#04x} received on input stream")]
    UnknownMessageType(u8),
}
