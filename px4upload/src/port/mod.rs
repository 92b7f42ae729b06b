//! Port abstraction for serial communication with the bootloader.
//!
//! The upload state machine never touches a concrete serial port. It drives a
//! [`Port`], which only needs to read, write, report how many bytes are
//! waiting, and close. Port discovery goes through [`PortEnumerator`], so the
//! watcher can be fed scripted snapshots in tests.
//!
//! ```text
//! +------------------+     +------------------+
//! |     Uploader     |     |   PortWatcher    |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |    Port Trait    |     | PortEnumerator   |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+------------------------+---------+
//! |       serialport (native feature)         |
//! +-------------------------------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use px4upload::port::Port;
//!
//! fn drain<P: Port>(port: &mut P) -> px4upload::Result<Vec<u8>> {
//!     let mut buf = vec![0u8; port.bytes_to_read()?];
//!     port.read_exact(&mut buf)?;
//!     Ok(buf)
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate. USB CDC bootloaders ignore it, but the driver still needs one.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(1000),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the port name.
    #[must_use]
    pub fn with_port_name(mut self, port_name: impl Into<String>) -> Self {
        self.port_name = port_name.into();
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port info carrying only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

/// Byte-stream transport to a bootloader.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Number of received bytes waiting to be read.
    fn bytes_to_read(&mut self) -> Result<usize>;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Lists the serial ports currently visible to the host.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports(&mut self) -> Result<Vec<PortInfo>>;
}

impl<F> PortEnumerator for F
where
    F: FnMut() -> Result<Vec<PortInfo>>,
{
    fn list_ports(&mut self) -> Result<Vec<PortInfo>> {
        self()
    }
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert!(config.port_name.is_empty());
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyACM0", 57600).with_timeout(Duration::from_secs(5));

        assert_eq!(config.port_name, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.timeout, Duration::from_secs(5));

        let renamed = config.with_port_name("COM7");
        assert_eq!(renamed.port_name, "COM7");
    }

    #[test]
    fn test_closure_enumerator() {
        let mut calls = 0;
        let mut enumerator = || -> Result<Vec<PortInfo>> {
            calls += 1;
            Ok(vec![PortInfo::named("/dev/ttyACM0")])
        };
        let ports = enumerator.list_ports().unwrap();
        assert_eq!(ports[0].name, "/dev/ttyACM0");
        drop(enumerator);
        assert_eq!(calls, 1);
    }
}
