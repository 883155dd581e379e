//! Link configuration
//!
//! Stored as JSON. Every field is optional in the file; missing fields take
//! their defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{
    DEFAULT_BAUD_RATE, DEFAULT_DISCOVERY_TIMEOUT_MS, DEFAULT_READ_TIMEOUT_MS, DISCOVERY_BAUD_RATE,
    MAX_PACKET_SIZE,
};
use crate::transport::DEFAULT_READ_BUFFER_SIZE;

/// Settings for the long-lived connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Baud rate of ports opened by name, and of a discovered port when
    /// [`DiscoveryConfig::reopen_at_link_baud`] is set
    pub baud_rate: u32,
    /// Reader thread buffer size in bytes
    pub read_buffer_size: usize,
    /// Per-call read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Largest packet (wire bytes) the framer waits for before giving up
    pub max_packet_size: usize,
    /// Port probing settings
    pub discovery: DiscoveryConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            max_packet_size: MAX_PACKET_SIZE,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Default config file location (in the user config directory)
    pub fn default_path() -> io::Result<PathBuf> {
        let base = dirs::config_dir().or_else(dirs::home_dir).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "Could not find config directory")
        })?;
        Ok(base.join("LightShow").join("link.json"))
    }

    /// Load a config file
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Load a config file, falling back to defaults when it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        match Self::load(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            other => other,
        }
    }

    /// Save to a config file, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }

    /// Read timeout as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Settings for probing ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Baud rate the device listens at before it is claimed
    pub baud_rate: u32,
    /// Size of each probe read
    pub read_buffer_size: usize,
    /// Time allowed for the whole batch of ports, in milliseconds
    pub timeout_ms: u64,
    /// Close the discovered port and reopen it at the link baud rate instead
    /// of keeping the handle that answered the probe
    pub reopen_at_link_baud: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            baud_rate: DISCOVERY_BAUD_RATE,
            read_buffer_size: 50,
            timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            reopen_at_link_baud: false,
        }
    }
}

impl DiscoveryConfig {
    /// Batch timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
