//! Blocking serial transport
//!
//! Owns one serial handle. A dedicated reader thread delivers raw chunks to
//! subscribers; writes are synchronous.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::protocol::{open_channel, ByteChannel, ProtocolError, DEFAULT_READ_TIMEOUT_MS};

/// Callback receiving raw chunks, sized however a single read returned them
pub type ByteSubscriber = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Default size of the reader thread's buffer
pub const DEFAULT_READ_BUFFER_SIZE: usize = 256;

/// Pause after a failed or empty read so a dead handle does not spin the CPU
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

struct OpenPort {
    name: String,
    writer: Box<dyn ByteChannel>,
    stop: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// Serial transport with a dedicated reader thread.
///
/// Writes and open/close transitions serialise on one lock. The reader thread
/// reads from its own clone of the handle and never takes that lock, so a
/// close request is never queued behind a read blocked in the OS.
pub struct BlockingTransport {
    state: Mutex<Option<OpenPort>>,
    subscribers: Arc<RwLock<Vec<ByteSubscriber>>>,
    read_buffer_size: usize,
    read_timeout: Duration,
}

impl BlockingTransport {
    /// Create a closed transport with default buffer size and read timeout
    pub fn new() -> Self {
        Self::with_options(
            DEFAULT_READ_BUFFER_SIZE,
            Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        )
    }

    /// Create a closed transport.
    ///
    /// `read_timeout` bounds each read call, and with it how long `close`
    /// may wait for the reader thread.
    pub fn with_options(read_buffer_size: usize, read_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(None),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            read_buffer_size: read_buffer_size.max(1),
            read_timeout,
        }
    }

    /// Open a serial port and start the reader thread.
    ///
    /// Opening an already open transport succeeds without touching the port.
    pub fn open(&self, path: &str, baud_rate: u32) -> Result<(), ProtocolError> {
        if self.is_open() {
            return Ok(());
        }
        let channel = open_channel(path, baud_rate, self.read_timeout)?;
        self.attach(path, channel)
    }

    /// Start the transport over an already opened channel
    pub fn attach(&self, name: &str, mut channel: Box<dyn ByteChannel>) -> Result<(), ProtocolError> {
        let mut state = self.lock_state();
        if state.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        channel.set_timeout(self.read_timeout)?;
        if let Err(e) = channel.clear_input_buffer() {
            tracing::debug!("{}: could not discard input buffer: {}", name, e);
        }
        let reader_channel = channel.try_clone()?;

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = Arc::clone(&stop);
            let subscribers = Arc::clone(&self.subscribers);
            let buffer_size = self.read_buffer_size;
            thread::Builder::new()
                .name(format!("lightshow-reader {}", name))
                .spawn(move || read_loop(reader_channel, stop, subscribers, buffer_size))?
        };

        tracing::info!("opened {}", name);
        *state = Some(OpenPort {
            name: name.to_string(),
            writer: channel,
            stop,
            reader,
        });
        Ok(())
    }

    /// Write all bytes, failing with [`ProtocolError::NotConnected`] when closed
    pub fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut state = self.lock_state();
        let port = state.as_mut().ok_or(ProtocolError::NotConnected)?;
        port.writer.write_all(bytes)?;
        port.writer.flush()?;
        Ok(())
    }

    /// Stop the reader thread and release the handle.
    ///
    /// Returns only after the reader thread has exited, so no subscriber is
    /// invoked after `close` returns. When called from a subscriber (i.e. on
    /// the reader thread itself) the thread exits right after the callback.
    /// Closing a closed transport is a no-op.
    pub fn close(&self) {
        // Taken under the lock, joined outside it: a subscriber blocked in
        // `write` must be able to finish for the reader to exit.
        let Some(port) = self.lock_state().take() else {
            return;
        };

        port.stop.store(true, Ordering::Release);
        drop(port.writer);

        if port.reader.thread().id() == thread::current().id() {
            tracing::debug!("{}: close requested from reader thread", port.name);
        } else if port.reader.join().is_err() {
            tracing::warn!("{}: reader thread panicked", port.name);
        }
        tracing::info!("closed {}", port.name);
    }

    /// Register a raw-chunk subscriber
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    /// Whether a port is currently open
    pub fn is_open(&self) -> bool {
        self.lock_state().is_some()
    }

    /// Name of the open port
    pub fn port_name(&self) -> Option<String> {
        self.lock_state().as_ref().map(|p| p.name.clone())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Option<OpenPort>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for BlockingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlockingTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(
    mut channel: Box<dyn ByteChannel>,
    stop: Arc<AtomicBool>,
    subscribers: Arc<RwLock<Vec<ByteSubscriber>>>,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];

    while !stop.load(Ordering::Acquire) {
        let read = match channel.read(&mut buffer) {
            Ok(0) => {
                thread::sleep(IDLE_BACKOFF);
                0
            }
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                0
            }
            Err(e) => {
                // Not fatal: the owner decides when to close
                tracing::debug!("read failed: {}", e);
                thread::sleep(IDLE_BACKOFF);
                0
            }
        };

        if stop.load(Ordering::Acquire) {
            break;
        }
        if read == 0 {
            continue;
        }

        let listeners = subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener(&buffer[..read]);
        }
    }
}
