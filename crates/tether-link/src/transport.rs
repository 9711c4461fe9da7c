//! Serial transport seams.
//!
//! Sessions never open ports themselves.  A [`Connector`] produces a fresh
//! [`SerialLink`] on every connect attempt, so the supervisor can drive real
//! hardware through [`SerialConnector`] and tests can hand in in-memory
//! streams instead.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

/// A byte stream to one peripheral.
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {
    /// Discard bytes queued for transmission but not yet sent.
    fn clear_output(&mut self) -> io::Result<()>;
}

impl SerialLink for SerialStream {
    fn clear_output(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Output).map_err(io::Error::from)
    }
}

/// Opens links to one configured port.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The link type produced on a successful connect.
    type Link: SerialLink + 'static;

    /// Port name used in logs, e.g. `"/dev/ttyACM0"`.
    fn port(&self) -> &str;

    /// Open a fresh link.
    async fn connect(&self) -> io::Result<Self::Link>;
}

/// Serial line settings shared by every peripheral port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device paths, one peripheral session each.
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Bound on a single read; expiry counts as "no data", not an error.
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Bound on a single write; expiry is a transport error.
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    115_200
}
fn default_timeout_ms() -> u64 {
    1_000
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// One [`SerialConnector`] per configured port.
    pub fn connectors(&self) -> Vec<SerialConnector> {
        self.ports
            .iter()
            .map(|port| SerialConnector::new(port.clone(), self.baud_rate))
            .collect()
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
        }
    }
}

/// [`Connector`] for a physical serial port.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    type Link = SerialStream;

    fn port(&self) -> &str {
        &self.port
    }

    async fn connect(&self) -> io::Result<SerialStream> {
        tokio_serial::new(self.port.as_str(), self.baud_rate)
            .open_native_async()
            .map_err(io::Error::from)
    }
}

// In-memory links for session and supervisor tests.
#[cfg(test)]
impl SerialLink for tokio::io::DuplexStream {
    fn clear_output(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_config_defaults() {
        let cfg = SerialConfig::default();
        assert_eq!(cfg.baud_rate, 115_200);
        assert_eq!(cfg.read_timeout(), Duration::from_secs(1));
        assert!(cfg.connectors().is_empty());
    }

    #[test]
    fn one_connector_per_port() {
        let cfg = SerialConfig {
            ports: vec!["/dev/ttyACM0".to_string(), "/dev/ttyACM1".to_string()],
            ..SerialConfig::default()
        };
        let connectors = cfg.connectors();
        assert_eq!(connectors.len(), 2);
        assert_eq!(connectors[1].port(), "/dev/ttyACM1");
    }

    #[tokio::test]
    async fn connecting_to_a_missing_port_fails() {
        let connector = SerialConnector::new("/dev/tether-does-not-exist", 9_600);
        assert!(connector.connect().await.is_err());
    }
}
