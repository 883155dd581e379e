//! Serial Protocol Communication
//!
//! Implements the LightShow byte-stuffed packet protocol.
//!
//! Every packet is framed as `0x55 0xFF <type> <payload> 0x55 0x00`. The
//! marker byte `0x55` never appears bare inside a payload: it is sent as
//! `0x55 0xFE` and restored on receive.

mod dispatch;
mod error;
mod framer;
pub mod messages;
mod packet;
pub mod serial;
pub mod stream;

pub use dispatch::{Dispatcher, ErrorCallback, MessageCallback, MessageHandler};
pub use error::{FramingError, ProtocolError};
pub use framer::{FrameEvent, FramerStats, PacketFramer};
pub use messages::{rgb565, solid_frame, MessageType};
pub use packet::{escape, unescape, Packet, PacketBuilder};
pub use serial::{list_ports, open_async_stream, open_channel, PortInfo};
pub use stream::{ByteChannel, SerialChannel};

/// Marker byte that introduces every control sequence on the wire
pub const MARKER: u8 = 0x55;

/// Second byte of the start-of-packet marker (`0x55 0xFF`)
pub const START_BYTE: u8 = 0xFF;

/// Second byte of the end-of-packet marker (`0x55 0x00`)
pub const END_BYTE: u8 = 0x00;

/// Second byte of an escaped literal `0x55` (`0x55 0xFE`)
pub const ESCAPE_BYTE: u8 = 0xFE;

/// Start-of-packet marker
pub const START_MARKER: [u8; 2] = [MARKER, START_BYTE];

/// End-of-packet marker
pub const END_MARKER: [u8; 2] = [MARKER, END_BYTE];

/// Smallest valid packet on the wire: start marker, type byte, end marker
pub const MIN_PACKET_SIZE: usize = 5;

/// Body a not-yet-connected device repeats while waiting for a host
pub const DISCOVERY_ACK: [u8; 4] = [0x01, 0xFF, 0x0F, 0xF0];

/// Body the host sends back once it has selected the device's port
pub const DISCOVERY_ACK_RESPONSE: [u8; 4] = [0x02, 0x0F, 0xF0, 0xFF];

/// Default application baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Baud rate used while probing ports during discovery
pub const DISCOVERY_BAUD_RATE: u32 = 9600;

/// Default per-call read timeout for the blocking transport, in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Default discovery timeout for the whole batch of ports, in milliseconds
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 10_000;

/// Upper bound on bytes held by a framer while waiting for an end marker
pub const MAX_PACKET_SIZE: usize = 8192;
