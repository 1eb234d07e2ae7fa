//! Transport sessions
//!
//! The byte-level link to the terminal. [`SerialTransport`] drives a real
//! USB-CDC device; tests and demos plug in [`crate::sim::SimulatedTerminal`].

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

use super::serial::{clear_buffers, configure_port, open_port};
use super::SigmaError;

/// Size of the scratch buffer used for a single read attempt
const READ_CHUNK: usize = 4096;

/// Abstraction over the link to the terminal
pub trait Transport: Send {
    /// Write all bytes, then flush.
    ///
    /// Failures are not retried here.
    fn write(&mut self, bytes: &[u8]) -> Result<(), SigmaError>;

    /// Return whatever bytes arrive within `timeout`, possibly none.
    ///
    /// Must not block past `timeout`.
    fn read_attempt(&mut self, timeout: Duration) -> Result<Vec<u8>, SigmaError>;

    /// Release the link. Safe to call more than once.
    fn close(&mut self);
}

/// Serial port transport. Closes the port when dropped.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    port_name: String,
    read_timeout: Duration,
}

impl SerialTransport {
    /// Open a serial device.
    ///
    /// Line-state and buffer-flush failures are logged and ignored; only a
    /// failure to open the device node is an error.
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self, SigmaError> {
        let mut port = open_port(port_name, Some(baud_rate), read_timeout)?;
        configure_port(port.as_mut());

        // Stale bytes may be left over from a crashed session
        if let Err(e) = clear_buffers(port.as_mut()) {
            tracing::debug!(port = port_name, "buffer flush failed: {} (continuing)", e);
        }

        tracing::debug!(port = port_name, baud = baud_rate, "serial transport open");
        Ok(Self {
            port: Some(port),
            port_name: port_name.to_string(),
            read_timeout,
        })
    }

    /// Device path this transport was opened on
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Whether the port is still held
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, SigmaError> {
        self.port
            .as_mut()
            .ok_or_else(|| SigmaError::Transport(format!("{} is closed", self.port_name)))
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), SigmaError> {
        let port = self.port_mut()?;
        port.write_all(bytes)
            .and_then(|_| port.flush())
            .map_err(|e| SigmaError::Transport(format!("write failed: {}", e)))
    }

    fn read_attempt(&mut self, timeout: Duration) -> Result<Vec<u8>, SigmaError> {
        let current = self.read_timeout;
        let port = self.port_mut()?;
        let mut applied = current;
        if timeout != current {
            match port.set_timeout(timeout) {
                Ok(()) => applied = timeout,
                Err(e) => tracing::debug!("set_timeout failed: {} (keeping {:?})", e, current),
            }
        }

        let mut buffer = [0u8; READ_CHUNK];
        let result = match port.read(&mut buffer) {
            Ok(n) => Ok(buffer[..n].to_vec()),
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(SigmaError::Transport(format!("read failed: {}", e))),
        };
        self.read_timeout = applied;
        result
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::debug!(port = %self.port_name, "serial transport closed");
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
