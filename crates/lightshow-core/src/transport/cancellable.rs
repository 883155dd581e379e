//! Cancellable async transport
//!
//! Used while probing ports: many of these can be in flight at once without a
//! thread per port, and each can be stopped promptly.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_serial::SerialStream;
use tokio_util::sync::CancellationToken;

use crate::protocol::{open_async_stream, ProtocolError};

/// Callback receiving an owned copy of every non-empty read
pub type ReadHandler = Box<dyn FnMut(Vec<u8>) + Send>;

/// Decision taken after each link of the read chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStep {
    Continue,
    Stop,
}

/// Everything the read chain needs; handed back when the chain stops so it
/// can be restarted on the same handle.
struct ReadParts<S> {
    reader: ReadHalf<S>,
    handler: ReadHandler,
}

struct Chain<S> {
    idle: Option<ReadParts<S>>,
    running: Option<(CancellationToken, JoinHandle<ReadParts<S>>)>,
}

/// Async transport driving a chain of bounded reads.
///
/// Start, continue and stop transitions go through one lock, so two chains
/// can never read the same handle concurrently. Must be created from within
/// a Tokio runtime.
pub struct AsyncTransport<S> {
    port_name: String,
    buffer_size: usize,
    writer: Mutex<Option<WriteHalf<S>>>,
    chain: Mutex<Chain<S>>,
    disposed: AtomicBool,
}

impl AsyncTransport<SerialStream> {
    /// Open a serial port and start reading into `handler`
    pub fn open<F>(
        path: &str,
        baud_rate: u32,
        buffer_size: usize,
        handler: F,
    ) -> Result<Self, ProtocolError>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let stream = open_async_stream(path, baud_rate)?;
        Ok(Self::from_stream(path, stream, buffer_size, handler))
    }
}

impl<S> AsyncTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Start reading an already open stream
    pub fn from_stream<F>(name: &str, stream: S, buffer_size: usize, handler: F) -> Self
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let buffer_size = buffer_size.max(1);
        let parts = ReadParts {
            reader,
            handler: Box::new(handler),
        };

        Self {
            port_name: name.to_string(),
            buffer_size,
            writer: Mutex::new(Some(writer)),
            chain: Mutex::new(Chain {
                idle: None,
                running: Some(spawn_chain(parts, buffer_size, name.to_string())),
            }),
            disposed: AtomicBool::new(false),
        }
    }

    /// Name of the underlying port
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Write all bytes and flush
    pub async fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ProtocolError::NotConnected)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Stop the read chain.
    ///
    /// Returns once the in-flight read and its handler call have finished, so
    /// the handle can be dropped right after without racing a late callback.
    pub async fn cancel(&self) {
        let mut chain = self.chain.lock().await;
        stop_chain(&mut chain, &self.port_name).await;
    }

    /// Restart the read chain after [`cancel`](Self::cancel)
    pub async fn restart(&self) -> Result<(), ProtocolError> {
        self.resume(None).await
    }

    /// Restart the read chain, delivering reads to a new handler from now on
    pub async fn restart_with<F>(&self, handler: F) -> Result<(), ProtocolError>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        self.resume(Some(Box::new(handler))).await
    }

    async fn resume(&self, handler: Option<ReadHandler>) -> Result<(), ProtocolError> {
        let mut chain = self.chain.lock().await;
        stop_chain(&mut chain, &self.port_name).await;
        if self.disposed.load(Ordering::Acquire) {
            return Err(ProtocolError::NotConnected);
        }
        let mut parts = chain.idle.take().ok_or(ProtocolError::NotConnected)?;
        if let Some(handler) = handler {
            parts.handler = handler;
        }
        chain.running = Some(spawn_chain(parts, self.buffer_size, self.port_name.clone()));
        Ok(())
    }

    /// Cancel reads and release the handle. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut chain = self.chain.lock().await;
        stop_chain(&mut chain, &self.port_name).await;
        chain.idle = None;
        drop(chain);
        self.writer.lock().await.take();
        tracing::debug!("{}: disposed", self.port_name);
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl<S> Drop for AsyncTransport<S> {
    fn drop(&mut self) {
        // Cannot await here; the detached chain exits at its next step
        if let Some((cancel, _)) = &self.chain.get_mut().running {
            cancel.cancel();
        }
    }
}

fn spawn_chain<S>(
    parts: ReadParts<S>,
    buffer_size: usize,
    port_name: String,
) -> (CancellationToken, JoinHandle<ReadParts<S>>)
where
    S: AsyncRead + Send + 'static,
{
    let cancel = CancellationToken::new();
    let task = tokio::spawn(read_chain(parts, cancel.clone(), buffer_size, port_name));
    (cancel, task)
}

async fn stop_chain<S>(chain: &mut Chain<S>, port_name: &str) {
    let Some((cancel, task)) = chain.running.take() else {
        return;
    };
    cancel.cancel();
    match task.await {
        Ok(parts) => chain.idle = Some(parts),
        Err(e) => tracing::warn!("{}: read chain ended abnormally: {}", port_name, e),
    }
}

async fn read_chain<S>(
    mut parts: ReadParts<S>,
    cancel: CancellationToken,
    buffer_size: usize,
    port_name: String,
) -> ReadParts<S>
where
    S: AsyncRead,
{
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = parts.reader.read(&mut buffer) => result,
        };

        let step = match result {
            Ok(0) => {
                tracing::debug!("{}: stream closed", port_name);
                ReadStep::Stop
            }
            Ok(n) => {
                // Owned copy: the buffer is reused by the next read
                (parts.handler)(buffer[..n].to_vec());
                ReadStep::Continue
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                ReadStep::Continue
            }
            Err(e) => {
                tracing::debug!("{}: read failed: {}", port_name, e);
                ReadStep::Stop
            }
        };

        if step == ReadStep::Stop || cancel.is_cancelled() {
            break;
        }
    }

    parts
}
