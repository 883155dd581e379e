//! Demo Mode - Simulated LightShow controller for testing
//!
//! Provides an in-memory byte channel and a simulated LED controller on the
//! far end of it, so the link can be exercised without hardware.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::protocol::{ByteChannel, FrameEvent, MessageType, Packet, PacketFramer, ProtocolError};

#[derive(Default)]
struct Pipe {
    bytes: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

/// One end of an in-memory, full-duplex byte channel.
///
/// Reads block for at most the configured timeout and then fail with
/// [`ErrorKind::TimedOut`], like a serial port with a read timeout.
pub struct MemoryChannel {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    timeout: Duration,
}

impl MemoryChannel {
    /// Create two connected ends: bytes written to one are read from the other
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let a = Arc::new(Pipe::default());
        let b = Arc::new(Pipe::default());
        let timeout = Duration::from_millis(100);
        (
            MemoryChannel {
                incoming: Arc::clone(&a),
                outgoing: Arc::clone(&b),
                timeout,
            },
            MemoryChannel {
                incoming: b,
                outgoing: a,
                timeout,
            },
        )
    }

    /// Take every byte received so far without blocking
    pub fn drain_available(&self) -> Vec<u8> {
        let mut queue = self.incoming.bytes.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    /// Collect received bytes until `len` have arrived or `timeout` elapses
    pub fn wait_for(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        let mut queue = self.incoming.bytes.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let take = queue.len().min(len - out.len());
            out.extend(queue.drain(..take));
            let now = Instant::now();
            if out.len() >= len || now >= deadline {
                return out;
            }
            queue = self
                .incoming
                .ready
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

impl Read for MemoryChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let queue = self.incoming.bytes.lock().unwrap_or_else(|e| e.into_inner());
        let (mut queue, _) = self
            .incoming
            .ready
            .wait_timeout_while(queue, self.timeout, |q| q.is_empty())
            .unwrap_or_else(|e| e.into_inner());

        if queue.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut queue = self.outgoing.bytes.lock().unwrap_or_else(|e| e.into_inner());
        queue.extend(buf.iter().copied());
        self.outgoing.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteChannel for MemoryChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.drain_available();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteChannel>> {
        Ok(Box::new(MemoryChannel {
            incoming: Arc::clone(&self.incoming),
            outgoing: Arc::clone(&self.outgoing),
            timeout: self.timeout,
        }))
    }
}

/// Simulated LED controller.
///
/// Answers [`MessageType::Ack`] with [`MessageType::AckResponse`], records
/// every [`MessageType::FrameResponse`] and can request frames on demand.
pub struct SimulatedDevice {
    channel: MemoryChannel,
    led_count: u8,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedDevice {
    /// Start a device with `led_count` LEDs; returns it with the host's end of the channel
    pub fn start(led_count: u8) -> (Self, MemoryChannel) {
        let (host, device) = MemoryChannel::pair();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let reader = MemoryChannel {
                incoming: Arc::clone(&device.incoming),
                outgoing: Arc::clone(&device.outgoing),
                timeout: Duration::from_millis(20),
            };
            let frames = Arc::clone(&frames);
            let stop = Arc::clone(&stop);
            thread::spawn(move || device_loop(reader, frames, stop))
        };

        (
            Self {
                channel: device,
                led_count,
                frames,
                stop,
                worker: Some(worker),
            },
            host,
        )
    }

    /// Ask the host for the next frame
    pub fn request_frame(&mut self) -> Result<(), ProtocolError> {
        let packet = Packet::new(MessageType::FrameRequest.byte(), vec![self.led_count]);
        self.channel.write_all(&packet.to_bytes()?)?;
        Ok(())
    }

    /// Frames received from the host so far
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of LEDs the device reports in frame requests
    pub fn led_count(&self) -> u8 {
        self.led_count
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn device_loop(mut channel: MemoryChannel, frames: Arc<Mutex<Vec<Vec<u8>>>>, stop: Arc<AtomicBool>) {
    let mut framer = PacketFramer::new();
    let mut buffer = [0u8; 64];

    while !stop.load(Ordering::Acquire) {
        let n = match channel.read(&mut buffer) {
            Ok(n) => n,
            Err(_) => continue,
        };

        for event in framer.push(&buffer[..n]) {
            let FrameEvent::Packet(packet) = event else {
                continue;
            };
            match MessageType::from_byte(packet.message_type) {
                Some(MessageType::Ack) => {
                    let reply = Packet::new(MessageType::AckResponse.byte(), Vec::new());
                    if let Ok(bytes) = reply.to_bytes() {
                        let _ = channel.write_all(&bytes);
                    }
                }
                Some(MessageType::FrameResponse) => {
                    frames
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(packet.payload);
                }
                _ => tracing::debug!(
                    "simulated device ignoring message {:#04x}",
                    packet.message_type
                ),
            }
        }
    }
}
