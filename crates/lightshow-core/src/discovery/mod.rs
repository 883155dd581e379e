//! Device discovery and handshake
//!
//! An unclaimed controller repeats a fixed probe packet at the discovery baud
//! rate. Discovery opens every port at once, waits for the first one that
//! carries the probe, answers on that port and releases all the others. The
//! winning port stays open and is handed to the caller.

mod provider;
mod scanner;

pub use provider::{PortProvider, SerialPortProvider};
pub use scanner::{AckScanner, ProbeEcho};

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::protocol::{DISCOVERY_ACK, DISCOVERY_ACK_RESPONSE, END_MARKER, START_MARKER};
use crate::transport::{AsyncTransport, BoxedStream};

/// Probe packet an unclaimed device repeats
pub fn ack_packet() -> Vec<u8> {
    [&START_MARKER[..], &DISCOVERY_ACK[..], &END_MARKER[..]].concat()
}

/// Packet the host writes to claim the device
pub fn ack_response_packet() -> Vec<u8> {
    [&START_MARKER[..], &DISCOVERY_ACK_RESPONSE[..], &END_MARKER[..]].concat()
}

/// A port that carried the probe.
///
/// Its reads are paused; bytes that arrived after the probe are kept. Either
/// take it over with [`into_parts`](Self::into_parts) or release it with
/// [`dispose`](Self::dispose).
pub struct Candidate {
    name: String,
    transport: AsyncTransport<BoxedStream>,
    trailing: Vec<u8>,
}

impl Candidate {
    /// Name of the port
    pub fn port_name(&self) -> &str {
        &self.name
    }

    /// Bytes read after the probe, before reads were paused
    pub fn trailing(&self) -> &[u8] {
        &self.trailing
    }

    /// Port name, open transport, and the bytes read after the probe
    pub fn into_parts(self) -> (String, AsyncTransport<BoxedStream>, Vec<u8>) {
        (self.name, self.transport, self.trailing)
    }

    /// Close the port
    pub async fn dispose(self) {
        self.transport.dispose().await;
    }
}

/// Probes every port a [`PortProvider`] offers
pub struct Discovery<P> {
    provider: Arc<P>,
    config: DiscoveryConfig,
}

impl<P: PortProvider> Discovery<P> {
    /// Create a discovery run over `provider`
    pub fn new(provider: P, config: DiscoveryConfig) -> Self {
        Self {
            provider: Arc::new(provider),
            config,
        }
    }

    /// Where ports come from
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Settings in use
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Find the port the device is on.
    ///
    /// The first port to carry the probe within the timeout wins and gets
    /// the ACK response; it is returned still open. Every other candidate,
    /// including one that matched after the winner, is disposed before this
    /// returns. Returns `None` when no port answers in time or none could be
    /// opened.
    pub async fn find(&self) -> Option<Candidate> {
        let ports = self.provider.list_ports();
        if ports.is_empty() {
            tracing::info!("discovery: no serial ports to probe");
            return None;
        }
        tracing::info!("discovery: probing {} port(s)", ports.len());

        let cancel = CancellationToken::new();
        // One slot per candidate so a late match never blocks its worker
        let (tx, mut rx) = mpsc::channel(ports.len());
        let workers: Vec<JoinHandle<()>> = ports
            .into_iter()
            .map(|name| {
                tokio::spawn(probe_port(
                    Arc::clone(&self.provider),
                    name,
                    self.config.clone(),
                    cancel.clone(),
                    tx.clone(),
                ))
            })
            .collect();
        drop(tx);

        let first = match tokio::time::timeout(self.config.timeout(), rx.recv()).await {
            Ok(Some(candidate)) => Some(candidate),
            Ok(None) => {
                tracing::info!("discovery: every candidate closed without a probe");
                None
            }
            Err(_) => {
                tracing::info!(
                    "discovery: no device answered within {:?}",
                    self.config.timeout()
                );
                None
            }
        };

        let winner = match first {
            Some(candidate) => claim(candidate).await,
            None => None,
        };

        cancel.cancel();
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("discovery: worker ended abnormally: {}", e);
            }
        }
        while let Ok(late) = rx.try_recv() {
            tracing::debug!("{}: ignoring late probe", late.name);
            late.dispose().await;
        }

        winner
    }
}

/// Answer the winning candidate; a candidate that cannot be answered is closed
async fn claim(candidate: Candidate) -> Option<Candidate> {
    match candidate.transport.write(&ack_response_packet()).await {
        Ok(()) => {
            tracing::info!("{}: device found", candidate.name);
            Some(candidate)
        }
        Err(e) => {
            tracing::warn!("{}: failed to answer probe: {}", candidate.name, e);
            candidate.dispose().await;
            None
        }
    }
}

/// One candidate: open, scan until the probe or the batch is cancelled
async fn probe_port<P: PortProvider>(
    provider: Arc<P>,
    name: String,
    config: DiscoveryConfig,
    cancel: CancellationToken,
    matches: mpsc::Sender<Candidate>,
) {
    let stream: BoxedStream = match provider.open(&name, config.baud_rate) {
        Ok(stream) => Box::new(stream),
        Err(e) => {
            tracing::warn!("{}: skipped, open failed: {}", name, e);
            return;
        }
    };

    let (hit_tx, hit_rx) = oneshot::channel();
    let mut hit_tx = Some(hit_tx);
    let scanner = Arc::new(Mutex::new(AckScanner::new()));
    let transport = {
        let scanner = Arc::clone(&scanner);
        AsyncTransport::from_stream(&name, stream, config.read_buffer_size, move |chunk| {
            let matched = scanner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .feed(&chunk);
            if matched {
                if let Some(tx) = hit_tx.take() {
                    let _ = tx.send(());
                }
            }
        })
    };

    let hit = tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        hit = hit_rx => hit.is_ok(),
    };

    if !hit {
        transport.dispose().await;
        return;
    }

    tracing::debug!("{}: probe seen", name);
    transport.cancel().await;
    let trailing = scanner
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take_trailing();
    let candidate = Candidate {
        name,
        transport,
        trailing,
    };
    if let Err(mpsc::error::SendError(unclaimed)) = matches.send(candidate).await {
        unclaimed.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolError;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::Instant;

    /// Ports backed by in-memory duplex streams; names without a stream fail to open
    struct MockProvider {
        order: Vec<String>,
        streams: Mutex<HashMap<String, DuplexStream>>,
    }

    impl MockProvider {
        /// Returns the provider and the device side of every openable port
        fn new(openable: &[&str], broken: &[&str]) -> (Self, HashMap<String, DuplexStream>) {
            Self::with_capacity(openable, broken, 256)
        }

        fn with_capacity(
            openable: &[&str],
            broken: &[&str],
            capacity: usize,
        ) -> (Self, HashMap<String, DuplexStream>) {
            let mut streams = HashMap::new();
            let mut devices = HashMap::new();
            for name in openable {
                let (host, device) = duplex(capacity);
                streams.insert(name.to_string(), host);
                devices.insert(name.to_string(), device);
            }
            let order = broken
                .iter()
                .chain(openable.iter())
                .map(|s| s.to_string())
                .collect();
            (
                Self {
                    order,
                    streams: Mutex::new(streams),
                },
                devices,
            )
        }
    }

    impl PortProvider for MockProvider {
        type Stream = DuplexStream;

        fn list_ports(&self) -> Vec<String> {
            self.order.clone()
        }

        fn open(&self, name: &str, _baud_rate: u32) -> Result<DuplexStream, ProtocolError> {
            self.streams
                .lock()
                .unwrap()
                .remove(name)
                .ok_or_else(|| ProtocolError::PortNotFound(name.to_string()))
        }
    }

    /// Device that sends the probe after `delay` and hands its end back
    fn announce_after(mut device: DuplexStream, delay: Duration) -> JoinHandle<DuplexStream> {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The host may already have closed this port
            let _ = device.write_all(&ack_packet()).await;
            device
        })
    }

    fn discovery(provider: MockProvider) -> Discovery<MockProvider> {
        Discovery::new(provider, DiscoveryConfig::default())
    }

    /// Run discovery and release the winner, keeping only its name
    async fn find_name(provider: MockProvider) -> Option<String> {
        let candidate = discovery(provider).find().await?;
        let name = candidate.port_name().to_string();
        candidate.dispose().await;
        Some(name)
    }

    #[test]
    fn test_handshake_packets() {
        assert_eq!(ack_packet(), vec![0x55, 0xFF, 0x01, 0xFF, 0x0F, 0xF0, 0x55, 0x00]);
        assert_eq!(
            ack_response_packet(),
            vec![0x55, 0xFF, 0x02, 0x0F, 0xF0, 0xFF, 0x55, 0x00]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_finds_device_and_answers() {
        let (provider, mut devices) = MockProvider::new(&["COM_X", "COM_Y"], &[]);
        let com_x = announce_after(devices.remove("COM_X").unwrap(), Duration::from_millis(1));
        let _com_y = devices.remove("COM_Y").unwrap();

        assert_eq!(find_name(provider).await.as_deref(), Some("COM_X"));

        let mut com_x = com_x.await.unwrap();
        let mut answer = Vec::new();
        com_x.read_to_end(&mut answer).await.unwrap();
        assert_eq!(answer, ack_response_packet());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_probe_wins() {
        let (provider, mut devices) = MockProvider::new(&["A", "B"], &[]);
        let a = announce_after(devices.remove("A").unwrap(), Duration::from_millis(1));
        let b = announce_after(devices.remove("B").unwrap(), Duration::from_millis(5));

        assert_eq!(find_name(provider).await.as_deref(), Some("A"));

        let mut a = a.await.unwrap();
        let mut answer = Vec::new();
        a.read_to_end(&mut answer).await.unwrap();
        assert_eq!(answer, ack_response_packet());

        // The loser got nothing and its handle has been released
        let mut b = b.await.unwrap();
        let mut answer = Vec::new();
        b.read_to_end(&mut answer).await.unwrap();
        assert!(answer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_winner_stays_open() {
        let (provider, mut devices) = MockProvider::new(&["COM_X"], &[]);
        let mut device = devices.remove("COM_X").unwrap();
        let mut burst = ack_packet();
        burst.extend_from_slice(&[0x55, 0xFF, 0x02, 0x07, 0x55, 0x00]);
        device.write_all(&burst).await.unwrap();

        let candidate = discovery(provider).find().await.unwrap();
        assert_eq!(candidate.port_name(), "COM_X");
        assert_eq!(
            candidate.trailing(),
            &[0x55, 0x00, 0x55, 0xFF, 0x02, 0x07, 0x55, 0x00]
        );

        let mut answer = [0u8; 8];
        device.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer.to_vec(), ack_response_packet());

        // Same handle, both directions still usable
        let (_, transport, _) = candidate.into_parts();
        device.write_all(&[0xAA]).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport
            .restart_with(move |bytes| {
                let _ = tx.send(bytes);
            })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![0xAA]);
        transport.write(&[0xBB]).await.unwrap();
        let mut echo = [0u8; 1];
        device.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, [0xBB]);
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_match_is_disposed() {
        // Small buffers: answering A blocks until A's device reads, so B's
        // probe is matched while the winner is still being claimed
        let (provider, mut devices) = MockProvider::with_capacity(&["A", "B"], &[], 4);
        let mut a = devices.remove("A").unwrap();
        let mut b = devices.remove("B").unwrap();
        let finder = discovery(provider);

        let device_side = async {
            a.write_all(&ack_packet()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
            b.write_all(&ack_packet()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut answer = [0u8; 8];
            a.read_exact(&mut answer).await.unwrap();
            answer
        };
        let (winner, answer) = tokio::join!(finder.find(), device_side);

        let winner = winner.unwrap();
        assert_eq!(winner.port_name(), "A");
        assert_eq!(answer.to_vec(), ack_response_packet());

        // B matched too, but got no answer and its handle is gone
        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        winner.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_split_across_reads() {
        let (provider, mut devices) = MockProvider::new(&["COM1"], &[]);
        let mut device = devices.remove("COM1").unwrap();
        let feeder = tokio::spawn(async move {
            let probe = ack_packet();
            device.write_all(&[0x13, 0x55]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(3)).await;
            device.write_all(&probe[1..4]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(3)).await;
            device.write_all(&probe[4..]).await.unwrap();
            device
        });

        assert_eq!(find_name(provider).await.as_deref(), Some("COM1"));
        drop(feeder.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_does_not_abort_scan() {
        let (provider, mut devices) = MockProvider::new(&["GOOD"], &["BAD"]);
        let good = announce_after(devices.remove("GOOD").unwrap(), Duration::from_millis(2));

        assert_eq!(find_name(provider).await.as_deref(), Some("GOOD"));
        drop(good.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_ports_time_out() {
        let (provider, devices) = MockProvider::new(&["COM1", "COM2"], &[]);
        let started = Instant::now();

        assert!(discovery(provider).find().await.is_none());
        assert!(started.elapsed() >= Duration::from_secs(10));
        drop(devices);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_traffic_is_not_a_probe() {
        let (provider, mut devices) = MockProvider::new(&["COM1"], &[]);
        let mut device = devices.remove("COM1").unwrap();
        device
            .write_all(&[0x55, 0xFF, 0x02, 0x10, 0x55, 0x00])
            .await
            .unwrap();

        assert!(discovery(provider).find().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_openable_ports_returns_early() {
        let (provider, _devices) = MockProvider::new(&[], &["BAD1", "BAD2"]);
        let started = Instant::now();

        assert!(discovery(provider).find().await.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_no_ports() {
        let (provider, _devices) = MockProvider::new(&[], &[]);
        assert!(discovery(provider).find().await.is_none());
    }
}
