//! Port abstraction for the serial link to the bootloader.
//!
//! The protocol layer never touches a serial device directly. It sees a
//! [`Port`], a blocking `Read + Write` handle with a read timeout, and the
//! [`crate::link::Link`] pumps split it into a receive and a send half by
//! cloning the handle.
//!
//! ```text
//! +------------------+
//! |  Flasher/Updater |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |  Link (pumps)    |
//! +---+----------+---+
//!     | reader   | writer
//!     v          v
//! +---+----------+---+
//! |   Port Trait     |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! | NativePort       |
//! |  (serialport)    |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use fpgaboot::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> std::io::Result<()> {
//!     port.write_all(b"Hello")?;
//!
//!     let mut buf = [0u8; 32];
//!     let n = port.read(&mut buf)?;
//!     println!("Received: {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
///
/// The bootloader's UART is fixed at 8N1 without flow control, so only the
/// rate and timeout are configurable.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
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
}

/// Serial port information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
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

/// Byte transport to the bootloader.
///
/// Reads must honour the configured timeout and report an expired wait as
/// [`std::io::ErrorKind::TimedOut`] (or `WouldBlock`), which the reader pump
/// treats as "no data yet".
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Open a second handle to the same device.
    ///
    /// The link gives one handle to its reader pump and the other to its
    /// writer pump.
    fn try_clone_port(&self) -> Result<Box<dyn Port>>;
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        (**self).try_clone_port()
    }
}

/// Lists the serial ports present on the host.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
