//! Probe recognition for one discovery candidate

use crate::protocol::{DISCOVERY_ACK, END_BYTE, END_MARKER, ESCAPE_BYTE, MARKER, START_BYTE};

/// Watches one port's byte stream for the device's discovery probe.
///
/// Only bytes that may still belong to a probe are kept between chunks: a
/// trailing lone `0x55`, or a start marker followed by a prefix of the ACK
/// body. Everything before that has been rejected and is dropped, so the cost
/// of each chunk is bounded by the chunk size. Once the probe has been seen,
/// every later byte is kept for whoever takes over the port.
#[derive(Debug, Default)]
pub struct AckScanner {
    buffer: Vec<u8>,
    matched: bool,
}

impl AckScanner {
    /// Create an empty scanner
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns true once the probe has been seen
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        self.buffer.extend_from_slice(chunk);
        if self.matched {
            return true;
        }

        let len = self.buffer.len();
        let mut keep_from = len;
        let mut i = 0;

        while i < len {
            if self.buffer[i] != MARKER {
                i += 1;
                continue;
            }
            let Some(&next) = self.buffer.get(i + 1) else {
                keep_from = i;
                break;
            };

            match next {
                START_BYTE => {
                    let body = i + 2;
                    let available = (len - body).min(DISCOVERY_ACK.len());
                    if self.buffer[body..body + available] != DISCOVERY_ACK[..available] {
                        i += 2;
                    } else if available < DISCOVERY_ACK.len() {
                        keep_from = i;
                        break;
                    } else {
                        self.matched = true;
                        self.buffer.drain(..body + DISCOVERY_ACK.len());
                        return true;
                    }
                }
                END_BYTE | ESCAPE_BYTE => i += 2,
                // Not our protocol, or noise; skip the marker and keep looking
                _ => i += 1,
            }
        }

        self.buffer.drain(..keep_from);
        false
    }

    /// Whether the probe has been seen
    pub fn is_matched(&self) -> bool {
        self.matched
    }

    /// Bytes retained: a possible partial probe, or everything after the probe
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Take the bytes received after the probe body
    pub fn take_trailing(&mut self) -> Vec<u8> {
        if !self.matched {
            return Vec::new();
        }
        std::mem::take(&mut self.buffer)
    }
}

/// Drops the probes a claimed device may still repeat before it sees the
/// host's answer.
///
/// Only leading traffic is filtered: the end marker of the probe that won,
/// then whole probe packets. The first other byte switches the filter to
/// pass-through for good.
#[derive(Debug, Default)]
pub struct ProbeEcho {
    held: Vec<u8>,
    passing: bool,
}

impl ProbeEcho {
    /// Create a filter expecting the tail of the winning probe
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one chunk; returns the bytes that belong to the application
    pub fn filter(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.passing {
            return chunk.to_vec();
        }
        self.held.extend_from_slice(chunk);
        let probe = super::ack_packet();

        loop {
            if self.held.starts_with(&END_MARKER) {
                self.held.drain(..END_MARKER.len());
            } else if self.held.starts_with(&probe) {
                self.held.drain(..probe.len());
            } else if probe.starts_with(&self.held) || END_MARKER.starts_with(&self.held) {
                // Empty, or may still become a probe
                return Vec::new();
            } else {
                self.passing = true;
                return std::mem::take(&mut self.held);
            }
        }
    }
}
