//! Discovered port kept open as the long-lived connection
//!
//! Discovery hands over an [`AsyncTransport`] whose reads are paused. Closing
//! and reopening that port would lose whatever the device sent right after
//! the handshake, and on many boards dropping DTR resets the device. This
//! wrapper keeps the same handle and lets synchronous code write to it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{AsyncTransport, BoxedStream};
use crate::protocol::ProtocolError;

/// Async transport driven from synchronous callers.
///
/// Writes are queued and performed in order by a writer task. A write that
/// fails in the background is reported by the next call to
/// [`write`](Self::write). Must be created from within a Tokio runtime.
pub struct PromotedTransport {
    transport: Arc<AsyncTransport<BoxedStream>>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    failed: Arc<AtomicBool>,
}

impl PromotedTransport {
    /// Take over `transport`; its reads stay as they are
    pub fn new(transport: Arc<AsyncTransport<BoxedStream>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let failed = Arc::new(AtomicBool::new(false));
        let writer = tokio::spawn(write_queue(
            Arc::clone(&transport),
            rx,
            Arc::clone(&failed),
        ));

        Self {
            transport,
            outbox: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            failed,
        }
    }

    /// Name of the underlying port
    pub fn port_name(&self) -> &str {
        self.transport.port_name()
    }

    /// Queue bytes for writing
    pub fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if self.failed.load(Ordering::Acquire) {
            let e = io::Error::new(io::ErrorKind::BrokenPipe, "an earlier write failed");
            return Err(e.into());
        }
        let outbox = lock(&self.outbox);
        let tx = outbox.as_ref().ok_or(ProtocolError::NotConnected)?;
        tx.send(bytes.to_vec()).map_err(|_| ProtocolError::NotConnected)
    }

    /// Stop accepting writes without waiting.
    ///
    /// Queued writes still go out; the handle is released once the last
    /// reference to the transport is gone.
    pub fn abort(&self) {
        lock(&self.outbox).take();
    }

    /// Flush queued writes, stop reading and release the handle
    pub async fn close(&self) {
        self.abort();
        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::warn!("{}: writer ended abnormally: {}", self.port_name(), e);
            }
        }
        self.transport.dispose().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn write_queue(
    transport: Arc<AsyncTransport<BoxedStream>>,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    failed: Arc<AtomicBool>,
) {
    while let Some(bytes) = queue.recv().await {
        if let Err(e) = transport.write(&bytes).await {
            tracing::warn!("{}: write failed: {}", transport.port_name(), e);
            failed.store(true, Ordering::Release);
            break;
        }
    }
}
