//! Byte channel abstraction over serial handles

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

/// Byte channel driven by the blocking transport.
///
/// The transport clones the channel once: the clone is read by the reader
/// thread while the original takes writes, so reads and writes never wait
/// on each other.
pub trait ByteChannel: Read + Write + Send {
    /// Set timeout for read operations
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard bytes received but not yet read
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Try to clone the channel
    fn try_clone(&self) -> io::Result<Box<dyn ByteChannel>>;
}

/// Serial port wrapper implementing ByteChannel
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an open port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl ByteChannel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::other)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteChannel>> {
        let port_clone = self.port.try_clone().map_err(io::Error::other)?;
        Ok(Box::new(SerialChannel::new(port_clone)))
    }
}
