//! Where discovery gets its ports from

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialStream;

use crate::protocol::{self, ByteChannel, ProtocolError};

/// Enumerates and opens candidate ports.
///
/// Production code uses [`SerialPortProvider`]; tests plug in in-memory
/// streams.
pub trait PortProvider: Send + Sync + 'static {
    /// Stream type returned by [`open`](Self::open)
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Names of every port worth probing, in probe order
    fn list_ports(&self) -> Vec<String>;

    /// Open one port at `baud_rate`
    fn open(&self, name: &str, baud_rate: u32) -> Result<Self::Stream, ProtocolError>;

    /// Open a port by name for the blocking transport
    fn open_blocking(
        &self,
        name: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn ByteChannel>, ProtocolError> {
        protocol::open_channel(name, baud_rate, read_timeout)
    }
}

/// The machine's real serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortProvider;

impl PortProvider for SerialPortProvider {
    type Stream = SerialStream;

    fn list_ports(&self) -> Vec<String> {
        protocol::list_ports().into_iter().map(|p| p.name).collect()
    }

    fn open(&self, name: &str, baud_rate: u32) -> Result<Self::Stream, ProtocolError> {
        protocol::open_async_stream(name, baud_rate)
    }
}
