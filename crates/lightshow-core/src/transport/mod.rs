//! Byte transports
//!
//! Ways of moving raw bytes over a serial handle:
//! - [`BlockingTransport`]: dedicated reader thread, used for connections
//!   opened by name
//! - [`AsyncTransport`]: cancellable chain of async reads, used while probing
//!   ports during discovery
//! - [`PromotedTransport`]: the async transport of a discovered port, kept
//!   open as the long-lived connection

mod blocking;
mod cancellable;
mod promoted;

use tokio::io::{AsyncRead, AsyncWrite};

pub use blocking::{BlockingTransport, ByteSubscriber, DEFAULT_READ_BUFFER_SIZE};
pub use cancellable::{AsyncTransport, ReadHandler};
pub use promoted::PromotedTransport;

/// Any async byte stream a port provider can hand out
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased stream, so one link can hold the port of any provider
pub type BoxedStream = Box<dyn AsyncStream>;
