//! # LightShow Core Library
//!
//! Host-side serial link for the LightShow addressable LED controller.
//!
//! This library provides:
//! - Byte-stuffed packet framing and per-type message dispatch
//! - A blocking serial transport with a dedicated reader thread
//! - A cancellable async transport used while probing ports
//! - Multi-port device discovery and handshake
//! - [`link::LightLink`], the connection API consumed by UI/animation code
//! - A simulated controller for running without hardware ([`demo`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use lightshow_core::prelude::*;
//!
//! let link = LightLink::new(LinkConfig::default());
//! link.on_message(MessageType::FrameRequest.byte(), |payload| println!("frame request: {payload:?}"));
//! link.on_error(|err| eprintln!("framing error: {err}"));
//!
//! // No port hint: probe every serial port for the device
//! let port = link.connect(None).await?;
//! link.send(MessageType::Ack.byte(), &[])?;
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod demo;
pub mod discovery;
pub mod link;
pub mod protocol;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{DiscoveryConfig, LinkConfig};
    pub use crate::discovery::{Candidate, Discovery, PortProvider, SerialPortProvider};
    pub use crate::link::{LightLink, LinkState};
    pub use crate::protocol::{
        rgb565, FramingError, MessageType, Packet, PacketBuilder, ProtocolError,
    };
    pub use crate::transport::{AsyncTransport, BlockingTransport};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
