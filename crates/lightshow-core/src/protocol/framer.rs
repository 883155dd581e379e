//! Stream reassembly
//!
//! Turns raw byte chunks (of whatever size the transport delivers) into
//! decoded packets and framing errors.

use super::{
    FramingError, Packet, END_BYTE, ESCAPE_BYTE, MARKER, MAX_PACKET_SIZE, START_BYTE,
};

/// Something the framer found in the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete, decoded packet
    Packet(Packet),
    /// A framing violation; the framer has already resynchronised
    Error(FramingError),
}

/// Receive counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Raw bytes pushed into the framer
    pub bytes_received: u64,
    /// Packets decoded successfully
    pub packets_decoded: u64,
    /// Framing errors reported
    pub framing_errors: u64,
}

/// Incremental packet framer.
///
/// The receive buffer only ever holds bytes from the start of the packet
/// currently being assembled (or a trailing lone `0x55` that may become a
/// marker). Everything before that is discarded after each [`push`].
///
/// [`push`]: PacketFramer::push
#[derive(Debug)]
pub struct PacketFramer {
    buffer: Vec<u8>,
    /// Next index to examine; bytes before it are never re-scanned
    cursor: usize,
    /// Offset of the open packet's start marker, if any
    start: Option<usize>,
    max_packet_size: usize,
    stats: FramerStats,
}

impl PacketFramer {
    /// Create a framer with the default packet size limit
    pub fn new() -> Self {
        Self::with_max_packet_size(MAX_PACKET_SIZE)
    }

    /// Create a framer that gives up on packets longer than `max_packet_size` wire bytes
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cursor: 0,
            start: None,
            max_packet_size,
            stats: FramerStats::default(),
        }
    }

    /// Feed one raw chunk, returning packets and errors in stream order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FrameEvent> {
        self.stats.bytes_received += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut i = self.cursor;

        while i < self.buffer.len() {
            if self.buffer[i] != MARKER {
                i += 1;
                continue;
            }
            // Lone marker at the end: wait for the next delivery to classify it
            let Some(&next) = self.buffer.get(i + 1) else {
                break;
            };

            match next {
                START_BYTE => {
                    if self.start.is_some() {
                        self.report(&mut events, FramingError::TruncatedPacket);
                    }
                    self.start = Some(i);
                    i += 2;
                }
                END_BYTE => {
                    if let Some(start) = self.start.take() {
                        let event = self.decode(start, i + 2);
                        events.push(event);
                    }
                    i += 2;
                }
                ESCAPE_BYTE => i += 2,
                following => {
                    self.report(&mut events, FramingError::UnescapedMarker { following });
                    self.start = None;
                    i += 1;
                }
            }
        }

        self.cursor = i;

        if let Some(start) = self.start {
            if self.cursor - start > self.max_packet_size {
                tracing::debug!(
                    "framer: dropping {} bytes of unterminated packet",
                    self.cursor - start
                );
                self.start = None;
                self.report(
                    &mut events,
                    FramingError::PacketTooLong {
                        max: self.max_packet_size,
                    },
                );
            }
        }

        self.compact();
        events
    }

    /// Bytes currently retained in the receive buffer
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a start marker has been seen without its end marker yet
    pub fn in_packet(&self) -> bool {
        self.start.is_some()
    }

    /// Receive counters since creation
    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    fn decode(&mut self, start: usize, end: usize) -> FrameEvent {
        match Packet::from_bytes(&self.buffer[start..end]) {
            Ok(packet) => {
                self.stats.packets_decoded += 1;
                FrameEvent::Packet(packet)
            }
            Err(e) => {
                self.stats.framing_errors += 1;
                FrameEvent::Error(e)
            }
        }
    }

    fn report(&mut self, events: &mut Vec<FrameEvent>, error: FramingError) {
        self.stats.framing_errors += 1;
        events.push(FrameEvent::Error(error));
    }

    /// Drop everything before the open packet (or before the scan cursor when
    /// no packet is open).
    fn compact(&mut self) {
        let keep_from = self.start.unwrap_or(self.cursor);
        if keep_from == 0 {
            return;
        }
        self.buffer.drain(..keep_from);
        self.cursor -= keep_from;
        self.start = self.start.map(|s| s - keep_from);

        if self.buffer.capacity() > 4 * self.max_packet_size
            && self.buffer.len() < self.max_packet_size
        {
            self.buffer.shrink_to(self.max_packet_size);
        }
    }
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn packets(events: &[FrameEvent]) -> Vec<Packet> {
        events
            .iter()
            .filter_map(|e| match e {
                FrameEvent::Packet(p) => Some(p.clone()),
                FrameEvent::Error(_) => None,
            })
            .collect()
    }

    fn errors(events: &[FrameEvent]) -> Vec<FramingError> {
        events
            .iter()
            .filter_map(|e| match e {
                FrameEvent::Error(err) => Some(err.clone()),
                FrameEvent::Packet(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_single_packet() {
        let mut framer = PacketFramer::new();
        let events = framer.push(&[0x55, 0xFF, 0x02, 0x08, 0x55, 0x00]);
        assert_eq!(
            events,
            vec![FrameEvent::Packet(Packet::new(0x02, vec![0x08]))]
        );
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn test_unescaped_marker_resyncs() {
        let mut framer = PacketFramer::new();
        let events = framer.push(&[0x55, 0xFF, 0x01, 0x55, 0xAA, 0x55, 0x00]);
        assert_eq!(
            errors(&events),
            vec![FramingError::UnescapedMarker { following: 0xAA }]
        );
        assert!(packets(&events).is_empty());

        // The stream recovers at the next start marker
        let events = framer.push(&[0x55, 0xFF, 0x01, 0x07, 0x55, 0x00]);
        assert_eq!(packets(&events), vec![Packet::new(0x01, vec![0x07])]);
        assert!(errors(&events).is_empty());
    }

    #[test]
    fn test_escaped_payload_decodes() {
        let mut framer = PacketFramer::new();
        let events = framer.push(&[0x55, 0xFF, 0x03, 0x55, 0xFE, 0x55, 0xFE, 0x55, 0x00]);
        assert_eq!(packets(&events), vec![Packet::new(0x03, vec![0x55, 0x55])]);
    }

    #[test]
    fn test_split_at_every_offset() {
        let wire = Packet::new(0x03, vec![0x55, 0x01, 0x55, 0x00, 0xFF])
            .to_bytes()
            .unwrap();

        for split in 1..wire.len() {
            let mut framer = PacketFramer::new();
            let mut events = framer.push(&wire[..split]);
            events.extend(framer.push(&wire[split..]));
            assert_eq!(
                events,
                vec![FrameEvent::Packet(Packet::new(
                    0x03,
                    vec![0x55, 0x01, 0x55, 0x00, 0xFF]
                ))],
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_lone_trailing_marker_waits() {
        let mut framer = PacketFramer::new();
        assert!(framer.push(&[0x10, 0x20, 0x55]).is_empty());
        // Garbage before the marker is gone, the marker itself is kept
        assert_eq!(framer.buffered_len(), 1);
        assert!(!framer.in_packet());

        assert!(framer.push(&[0xFF, 0x00]).is_empty());
        assert!(framer.in_packet());
        let events = framer.push(&[0x55, 0x00]);
        assert!(!framer.in_packet());
        assert_eq!(packets(&events), vec![Packet::new(0x00, Vec::new())]);
    }

    #[test]
    fn test_many_packets_in_one_chunk() {
        let mut wire = Vec::new();
        for t in 0..5u8 {
            wire.extend(Packet::new(t, vec![t; 3]).to_bytes().unwrap());
        }
        let mut framer = PacketFramer::new();
        let decoded = packets(&framer.push(&wire));
        assert_eq!(decoded.len(), 5);
        assert_eq!(decoded[4], Packet::new(4, vec![4, 4, 4]));
        assert_eq!(framer.stats().packets_decoded, 5);
    }

    #[test]
    fn test_buffer_bounded_over_many_packets() {
        let wire = Packet::new(0x02, vec![0x55; 16]).to_bytes().unwrap();
        let mut framer = PacketFramer::new();
        let mut peak = 0;
        for n in 0..10_000 {
            // Deliver each packet in two pieces so partial state is exercised
            let (a, b) = wire.split_at(n % wire.len());
            framer.push(a);
            peak = peak.max(framer.buffered_len());
            framer.push(b);
            peak = peak.max(framer.buffered_len());
        }
        assert!(peak <= wire.len());
        assert_eq!(framer.buffered_len(), 0);
        assert_eq!(framer.stats().packets_decoded, 10_000);
    }

    #[test]
    fn test_restart_reports_truncated_packet() {
        let mut framer = PacketFramer::new();
        let events = framer.push(&[0x55, 0xFF, 0x01, 0x02, 0x55, 0xFF, 0x03, 0x04, 0x55, 0x00]);
        assert_eq!(errors(&events), vec![FramingError::TruncatedPacket]);
        assert_eq!(packets(&events), vec![Packet::new(0x03, vec![0x04])]);
    }

    #[test]
    fn test_too_short_packet() {
        let mut framer = PacketFramer::new();
        let events = framer.push(&[0x55, 0xFF, 0x55, 0x00]);
        assert_eq!(
            events,
            vec![FrameEvent::Error(FramingError::PacketTooShort { len: 4 })]
        );
    }

    #[test]
    fn test_stray_end_marker_is_skipped() {
        let mut framer = PacketFramer::new();
        let events = framer.push(&[0x01, 0x55, 0x00, 0x55, 0xFF, 0x09, 0x55, 0x00]);
        assert_eq!(events, vec![FrameEvent::Packet(Packet::new(0x09, Vec::new()))]);
    }

    #[test]
    fn test_unterminated_packet_is_dropped() {
        let mut framer = PacketFramer::with_max_packet_size(16);
        let mut events = framer.push(&[0x55, 0xFF, 0x01]);
        events.extend(framer.push(&[0x00; 32]));
        assert_eq!(errors(&events), vec![FramingError::PacketTooLong { max: 16 }]);
        assert!(!framer.in_packet());
        assert_eq!(framer.buffered_len(), 0);
    }
}
