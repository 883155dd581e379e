//! Connection management
//!
//! [`LightLink`] is what animation and UI code talks to: connect (with or
//! without a port hint), send messages, register message and error handlers.

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::LinkConfig;
use crate::discovery::{Candidate, Discovery, PortProvider, ProbeEcho, SerialPortProvider};
use crate::protocol::{
    ByteChannel, Dispatcher, FramerStats, FramingError, MessageHandler, MessageType, Packet,
    ProtocolError,
};
use crate::transport::{BlockingTransport, PromotedTransport};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Not connected
    Disconnected,
    /// Opening a port or probing for the device
    Connecting,
    /// Connected and ready
    Connected,
}

/// How bytes reach the active port
enum Conduit {
    /// Port opened by name, or an attached channel
    Serial(BlockingTransport),
    /// The handle that answered discovery
    Claimed(PromotedTransport),
}

impl Conduit {
    fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        match self {
            Conduit::Serial(transport) => transport.write(bytes),
            Conduit::Claimed(transport) => transport.write(bytes),
        }
    }

    /// Close without the runtime. Joins the reader thread of a serial port.
    fn close_now(&self) {
        match self {
            Conduit::Serial(transport) => transport.close(),
            Conduit::Claimed(transport) => transport.abort(),
        }
    }
}

/// The open port and its receive pipeline
struct ActiveConnection {
    port_name: String,
    conduit: Conduit,
    handler: Arc<MessageHandler>,
}

struct Slot {
    state: LinkState,
    active: Option<Arc<ActiveConnection>>,
}

/// Host side of the LightShow serial link.
///
/// Holds at most one active connection. Message and error handlers belong to
/// the link, not the connection, so they survive reconnects.
pub struct LightLink {
    config: LinkConfig,
    dispatcher: Arc<Dispatcher>,
    acknowledged: Arc<AtomicBool>,
    /// Serialises connect/attach/disconnect
    transition: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
}

impl LightLink {
    /// Create a disconnected link
    pub fn new(config: LinkConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let acknowledged = Arc::new(AtomicBool::new(false));
        {
            let acknowledged = Arc::clone(&acknowledged);
            dispatcher.register_handler(MessageType::AckResponse.byte(), move |_| {
                if !acknowledged.swap(true, Ordering::AcqRel) {
                    tracing::info!("device acknowledged the connection");
                }
            });
        }

        Self {
            config,
            dispatcher,
            acknowledged,
            transition: tokio::sync::Mutex::new(()),
            slot: Mutex::new(Slot {
                state: LinkState::Disconnected,
                active: None,
            }),
        }
    }

    /// Settings in use
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Connect over the machine's serial ports.
    ///
    /// With a hint the port is opened directly at the application baud rate.
    /// Without one every port is probed, and the handle that answered becomes
    /// the connection. Either way the device is then greeted with
    /// [`MessageType::Ack`]. Returns the port name.
    pub async fn connect(&self, port_hint: Option<&str>) -> Result<String, ProtocolError> {
        self.connect_with_provider(port_hint, SerialPortProvider).await
    }

    /// [`connect`](Self::connect) with a custom source of ports
    pub async fn connect_with_provider<P: PortProvider>(
        &self,
        port_hint: Option<&str>,
        provider: P,
    ) -> Result<String, ProtocolError> {
        let _transition = self.transition.lock().await;
        if self.lock_slot().active.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }
        self.set_state(LinkState::Connecting);

        let discovery = Discovery::new(provider, self.config.discovery.clone());
        let result = match self.open_and_install(port_hint, &discovery).await {
            Ok(port) => self.greet().map(|()| port),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            tracing::warn!("connect failed: {}", e);
            self.set_state(LinkState::Disconnected);
        }
        result
    }

    /// Connect over an already opened channel (simulated devices, tests)
    pub async fn attach(
        &self,
        name: &str,
        channel: Box<dyn ByteChannel>,
    ) -> Result<(), ProtocolError> {
        let _transition = self.transition.lock().await;
        if self.lock_slot().active.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }
        self.install(name, channel)?;
        self.greet()
    }

    /// Close the active connection, if any.
    ///
    /// Returns once no more messages will be dispatched from it.
    pub async fn disconnect(&self) {
        let _transition = self.transition.lock().await;
        let connection = {
            let mut slot = self.lock_slot();
            slot.state = LinkState::Disconnected;
            slot.active.take()
        };
        if let Some(connection) = connection {
            close(connection).await;
        }
    }

    /// Encode and write one message.
    ///
    /// A failed write tears the connection down; reconnecting is up to the
    /// caller. On a discovered port writes are queued, so a failure shows up
    /// on the next send.
    pub fn send(&self, message_type: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let bytes = Packet::new(message_type, payload.to_vec()).to_bytes()?;
        let connection = self
            .lock_slot()
            .active
            .clone()
            .ok_or(ProtocolError::NotConnected)?;

        if let Err(e) = connection.conduit.write(&bytes) {
            tracing::warn!("{}: write failed, closing: {}", connection.port_name, e);
            self.tear_down(&connection);
            return Err(e);
        }
        tracing::debug!(
            "tx message type={:#04x} len={}",
            message_type,
            payload.len()
        );
        Ok(())
    }

    /// Register a handler for one message type
    pub fn on_message<F>(&self, message_type: u8, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.dispatcher.register_handler(message_type, callback);
    }

    /// Register a framing-error handler
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&FramingError) + Send + Sync + 'static,
    {
        self.dispatcher.on_error(callback);
    }

    /// Name of the connected port
    pub fn port_name(&self) -> Option<String> {
        self.lock_slot()
            .active
            .as_ref()
            .map(|c| c.port_name.clone())
    }

    /// Current connection state
    pub fn state(&self) -> LinkState {
        self.lock_slot().state
    }

    /// Whether a connection is active
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Whether the device answered the greeting of the current connection
    pub fn is_acknowledged(&self) -> bool {
        self.is_connected() && self.acknowledged.load(Ordering::Acquire)
    }

    /// Receive counters of the active connection
    pub fn stats(&self) -> Option<FramerStats> {
        self.lock_slot().active.as_ref().map(|c| c.handler.stats())
    }

    async fn open_and_install<P: PortProvider>(
        &self,
        port_hint: Option<&str>,
        discovery: &Discovery<P>,
    ) -> Result<String, ProtocolError> {
        if let Some(port) = port_hint {
            return self.open_by_name(port, discovery.provider()).await;
        }

        let candidate = discovery.find().await.ok_or(ProtocolError::NoDeviceFound)?;
        if self.config.discovery.reopen_at_link_baud {
            let port = candidate.port_name().to_string();
            candidate.dispose().await;
            return self.open_by_name(&port, discovery.provider()).await;
        }
        self.promote(candidate).await
    }

    async fn open_by_name<P: PortProvider>(
        &self,
        port: &str,
        provider: &Arc<P>,
    ) -> Result<String, ProtocolError> {
        let opening = {
            let provider = Arc::clone(provider);
            let port = port.to_string();
            let baud_rate = self.config.baud_rate;
            let read_timeout = self.config.read_timeout();
            tokio::task::spawn_blocking(move || {
                provider.open_blocking(&port, baud_rate, read_timeout)
            })
        };
        let channel = opening.await.map_err(io::Error::other)??;
        self.install(port, channel)?;
        Ok(port.to_string())
    }

    /// Keep the discovered handle as the connection
    async fn promote(&self, candidate: Candidate) -> Result<String, ProtocolError> {
        let (name, transport, trailing) = candidate.into_parts();
        let transport = Arc::new(transport);
        let handler = self.message_handler();
        let connection = self.activate(
            &name,
            Conduit::Claimed(PromotedTransport::new(Arc::clone(&transport))),
            Arc::clone(&handler),
        );

        // Drop the probes the device repeats until it sees our answer
        let mut echo = ProbeEcho::new();
        let mut deliver = move |chunk: Vec<u8>| {
            let bytes = echo.filter(&chunk);
            if !bytes.is_empty() {
                handler.on_raw_bytes(&bytes);
            }
        };
        deliver(trailing);

        if let Err(e) = transport.restart_with(deliver).await {
            self.tear_down(&connection);
            return Err(e);
        }
        Ok(name)
    }

    fn install(&self, name: &str, channel: Box<dyn ByteChannel>) -> Result<(), ProtocolError> {
        let transport = BlockingTransport::with_options(
            self.config.read_buffer_size,
            self.config.read_timeout(),
        );
        let handler = self.message_handler();
        {
            let handler = Arc::clone(&handler);
            transport.subscribe(move |chunk| handler.on_raw_bytes(chunk));
        }
        transport.attach(name, channel)?;
        self.activate(name, Conduit::Serial(transport), handler);
        Ok(())
    }

    fn message_handler(&self) -> Arc<MessageHandler> {
        Arc::new(MessageHandler::with_max_packet_size(
            Arc::clone(&self.dispatcher),
            self.config.max_packet_size,
        ))
    }

    fn activate(
        &self,
        name: &str,
        conduit: Conduit,
        handler: Arc<MessageHandler>,
    ) -> Arc<ActiveConnection> {
        let connection = Arc::new(ActiveConnection {
            port_name: name.to_string(),
            conduit,
            handler,
        });
        let mut slot = self.lock_slot();
        slot.active = Some(Arc::clone(&connection));
        slot.state = LinkState::Connected;
        tracing::info!("{}: connected", name);
        connection
    }

    /// First message on a new connection; the device answers with AckResponse
    fn greet(&self) -> Result<(), ProtocolError> {
        self.acknowledged.store(false, Ordering::Release);
        self.send(MessageType::Ack.byte(), &[])
    }

    /// Drop `connection` from the slot if it is still the active one
    fn tear_down(&self, connection: &Arc<ActiveConnection>) {
        {
            let mut slot = self.lock_slot();
            let current = slot
                .active
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, connection));
            if !current {
                return;
            }
            slot.active = None;
            slot.state = LinkState::Disconnected;
        }
        connection.conduit.close_now();
    }

    fn set_state(&self, state: LinkState) {
        self.lock_slot().state = state;
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Close a connection taken out of the slot, off the async worker threads
async fn close(connection: Arc<ActiveConnection>) {
    match &connection.conduit {
        Conduit::Claimed(transport) => transport.close().await,
        Conduit::Serial(_) => {
            let closing = Arc::clone(&connection);
            let closed = tokio::task::spawn_blocking(move || closing.conduit.close_now()).await;
            if let Err(e) = closed {
                tracing::warn!("{}: close failed: {}", connection.port_name, e);
            }
        }
    }
    tracing::info!("{}: disconnected", connection.port_name);
}

impl Drop for LightLink {
    fn drop(&mut self) {
        if let Some(connection) = self.lock_slot().active.take() {
            connection.conduit.close_now();
        }
    }
}
