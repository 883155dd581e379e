//! Serial port enumeration and opening

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{ByteChannel, ProtocolError, SerialChannel};

/// A serial port the controller might be attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// System name, e.g. `/dev/ttyACM0` or `COM3`
    pub name: String,
    /// USB vendor ID, for USB serial adapters
    pub vid: Option<u16>,
    /// USB product ID, for USB serial adapters
    pub pid: Option<u16>,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// USB product string
    pub product: Option<String>,
}

impl PortInfo {
    /// Port known only by name
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let mut port = Self::bare(info.port_name);
        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.manufacturer = usb.manufacturer;
            port.product = usb.product;
        }
        port
    }
}

/// Probe order: Arduino-style ACM ports, then USB adapters, then COM ports,
/// each numerically; anything else last, by name.
const RANKED_PREFIXES: [&str; 3] = ["ttyACM", "ttyUSB", "COM"];

fn port_rank(name: &str) -> (usize, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    RANKED_PREFIXES
        .iter()
        .enumerate()
        .find_map(|(rank, prefix)| {
            let number = basename.strip_prefix(prefix)?.parse().ok()?;
            Some((rank, number, basename.to_string()))
        })
        .unwrap_or((RANKED_PREFIXES.len(), 0, basename.to_string()))
}

/// Every serial port on this machine, in probe order.
///
/// On Linux, ACM and USB device nodes the enumeration API misses are added
/// from `/dev`.
pub fn list_ports() -> Vec<PortInfo> {
    let mut found: BTreeMap<String, PortInfo> = BTreeMap::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for port in ports.into_iter().map(PortInfo::from) {
                found.entry(port.name.clone()).or_insert(port);
            }
        }
        Err(e) => tracing::warn!("serial port enumeration failed: {}", e),
    }

    #[cfg(target_os = "linux")]
    for name in dev_nodes() {
        found
            .entry(name.clone())
            .or_insert_with(|| PortInfo::bare(name));
    }

    let mut ports: Vec<PortInfo> = found.into_values().collect();
    ports.sort_by_key(|p| port_rank(&p.name));
    ports
}

#[cfg(target_os = "linux")]
fn dev_nodes() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("ttyACM") || name.starts_with("ttyUSB"))
        .map(|name| format!("/dev/{}", name))
        .collect()
}

fn open_error(name: &str, e: serialport::Error) -> ProtocolError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(name.to_string()),
        _ => ProtocolError::Serial(e),
    }
}

/// Open a serial port for the blocking transport.
///
/// `read_timeout` bounds every read call so the reader thread can notice a
/// stop request.
pub fn open_channel(
    name: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn ByteChannel>, ProtocolError> {
    let mut port = serialport::new(name, baud_rate)
        .timeout(read_timeout)
        .open()
        .map_err(|e| open_error(name, e))?;

    configure_port(port.as_mut())?;
    port.clear(serialport::ClearBuffer::All)?;
    tracing::debug!("{}: opened at {} baud", name, baud_rate);

    Ok(Box::new(SerialChannel::new(port)))
}

/// Open a serial port as an async stream, for the cancellable transport
pub fn open_async_stream(name: &str, baud_rate: u32) -> Result<SerialStream, ProtocolError> {
    let mut stream = tokio_serial::new(name, baud_rate)
        .open_native_async()
        .map_err(|e| open_error(name, e))?;
    configure_port(&mut stream)?;
    Ok(stream)
}

/// 8N1, no flow control, DTR and RTS held high
fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // Dropping DTR resets most Arduino boards; some adapters refuse the request
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("could not raise DTR: {}", e);
    }
    if let Err(e) = port.write_request_to_send(true) {
        tracing::debug!("could not raise RTS: {}", e);
    }
    Ok(())
}
