//! Message dispatch
//!
//! Routes decoded packets to callbacks registered per message type and
//! reports framing problems to error listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::{FrameEvent, FramerStats, FramingError, Packet, PacketFramer};

/// Callback invoked with the unescaped payload of a message
pub type MessageCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked for every framing error
pub type ErrorCallback = Arc<dyn Fn(&FramingError) + Send + Sync>;

/// Handler table plus error listeners.
///
/// Callbacks are invoked synchronously, in registration order. The registry
/// lock is released before any callback runs, so a callback may register
/// further handlers or send messages.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<u8, Vec<MessageCallback>>>,
    error_handlers: RwLock<Vec<ErrorCallback>>,
}

impl Dispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `message_type`; earlier handlers for the type stay registered
    pub fn register_handler<F>(&self, message_type: u8, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(message_type)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Add a framing-error listener
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&FramingError) + Send + Sync + 'static,
    {
        let mut listeners = self
            .error_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        listeners.push(Arc::new(callback));
    }

    /// Number of handlers registered for a type
    pub fn handler_count(&self, message_type: u8) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message_type)
            .map_or(0, Vec::len)
    }

    /// Deliver a packet to every handler for its type.
    ///
    /// A type with no handlers is reported as [`FramingError::UnknownMessageType`].
    pub fn dispatch(&self, packet: &Packet) {
        let callbacks = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&packet.message_type)
            .cloned()
            .unwrap_or_default();

        if callbacks.is_empty() {
            self.raise(&FramingError::UnknownMessageType(packet.message_type));
            return;
        }

        for callback in callbacks {
            callback(&packet.payload);
        }
    }

    /// Report a framing error to every listener
    pub fn raise(&self, error: &FramingError) {
        tracing::debug!("framing error: {}", error);
        let listeners = self
            .error_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener(error);
        }
    }
}

/// A framer bound to a dispatcher: the receive side of one connection.
///
/// Each connection owns its own framer state; the dispatcher is usually
/// shared so handlers survive reconnects.
pub struct MessageHandler {
    framer: Mutex<PacketFramer>,
    dispatcher: Arc<Dispatcher>,
}

impl MessageHandler {
    /// Create a receive pipeline feeding `dispatcher`
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            framer: Mutex::new(PacketFramer::new()),
            dispatcher,
        }
    }

    /// Create a receive pipeline with a custom packet size limit
    pub fn with_max_packet_size(dispatcher: Arc<Dispatcher>, max_packet_size: usize) -> Self {
        Self {
            framer: Mutex::new(PacketFramer::with_max_packet_size(max_packet_size)),
            dispatcher,
        }
    }

    /// Feed raw bytes from a transport.
    ///
    /// Packets dispatch in the order their end markers were observed. The
    /// framer lock is dropped before dispatch.
    pub fn on_raw_bytes(&self, chunk: &[u8]) {
        let events = {
            let mut framer = self.framer.lock().unwrap_or_else(|e| e.into_inner());
            framer.push(chunk)
        };

        for event in events {
            match event {
                FrameEvent::Packet(packet) => {
                    tracing::debug!(
                        "rx message type={:#04x} len={}",
                        packet.message_type,
                        packet.payload.len()
                    );
                    self.dispatcher.dispatch(&packet);
                }
                FrameEvent::Error(e) => self.dispatcher.raise(&e),
            }
        }
    }

    /// Receive counters of the underlying framer
    pub fn stats(&self) -> FramerStats {
        self.framer.lock().unwrap_or_else(|e| e.into_inner()).stats()
    }

    /// The dispatcher packets are routed to
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_handlers_fire_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let log = Arc::clone(&log);
            dispatcher.register_handler(0x02, move |payload| {
                log.lock().unwrap().push((id, payload.to_vec()));
            });
        }

        dispatcher.dispatch(&Packet::new(0x02, vec![9]));
        assert_eq!(
            *log.lock().unwrap(),
            vec![(0, vec![9]), (1, vec![9]), (2, vec![9])]
        );
        assert_eq!(dispatcher.handler_count(0x02), 3);
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.on_error(move |e| sink.lock().unwrap().push(e.clone()));

        dispatcher.dispatch(&Packet::new(0x07, Vec::new()));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![FramingError::UnknownMessageType(0x07)]
        );
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let dispatcher = Arc::new(Dispatcher::new());
        let inner = Arc::clone(&dispatcher);
        dispatcher.register_handler(0x01, move |_| {
            inner.register_handler(0x02, |_| {});
        });

        dispatcher.dispatch(&Packet::new(0x01, Vec::new()));
        assert_eq!(dispatcher.handler_count(0x02), 1);
    }

    #[test]
    fn test_message_handler_partial_delivery() {
        let dispatcher = Arc::new(Dispatcher::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        dispatcher.register_handler(0x03, move |p| sink.lock().unwrap().push(p.to_vec()));

        let handler = MessageHandler::new(Arc::clone(&dispatcher));
        let wire = Packet::new(0x03, vec![1, 0x55, 2]).to_bytes().unwrap();
        handler.on_raw_bytes(&wire[..4]);
        assert!(received.lock().unwrap().is_empty());
        handler.on_raw_bytes(&wire[4..]);

        assert_eq!(*received.lock().unwrap(), vec![vec![1, 0x55, 2]]);
        assert_eq!(handler.stats().packets_decoded, 1);
    }

    #[test]
    fn test_message_handler_resync_reports_once() {
        let dispatcher = Arc::new(Dispatcher::new());
        let errors = Arc::new(Mutex::new(0usize));
        let dispatched = Arc::new(Mutex::new(0usize));
        {
            let errors = Arc::clone(&errors);
            dispatcher.on_error(move |_| *errors.lock().unwrap() += 1);
            let dispatched = Arc::clone(&dispatched);
            dispatcher.register_handler(0x01, move |_| *dispatched.lock().unwrap() += 1);
        }

        let handler = MessageHandler::new(dispatcher);
        handler.on_raw_bytes(&[0x55, 0xFF, 0x01, 0x55, 0xAA, 0x55, 0x00]);

        assert_eq!(*errors.lock().unwrap(), 1);
        assert_eq!(*dispatched.lock().unwrap(), 0);
    }
}
