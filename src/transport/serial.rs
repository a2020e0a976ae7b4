//! Serial (UART) transport

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{info, warn};

use super::{Transport, closed_error};
use crate::{CortexError, Result};

/// Baud rate used when the URI does not specify one.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Serial transport for UART-attached devices
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    path: String,
}

impl SerialTransport {
    /// Open a serial port in raw 8-N-1 mode without flow control
    ///
    /// # Arguments
    /// * `path` - Serial port path (e.g., "/dev/ttyUSB0")
    /// * `baud_rate` - Baud rate (e.g., 115200)
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(|source| CortexError::Serial { path: path.to_string(), source })?;

        // Stale bytes from a previous session would only feed the magic hunter.
        if let Err(e) = port.clear(ClearBuffer::All) {
            warn!(path, error = %e, "Could not clear serial buffers");
        }

        info!("Opened serial port: {} at {} baud", path, baud_rate);
        Ok(Self { port: Some(port), path: path.to_string() })
    }

    fn serial_error(&self, source: serialport::Error) -> CortexError {
        CortexError::Serial { path: self.path.clone(), source }
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port.as_mut().ok_or_else(|| closed_error("serial"))?;
        port.write_all(data).map_err(|e| CortexError::from_io("serial write", e))?;
        port.flush().map_err(|e| CortexError::from_io("serial flush", e))?;
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(port) = self.port.as_mut() else {
            return Err(closed_error("serial"));
        };

        if timeout.is_zero() {
            let pending = port.bytes_to_read();
            match pending {
                Ok(0) => return Err(CortexError::Timeout { duration: timeout }),
                Ok(_) => {}
                Err(e) => return Err(self.serial_error(e)),
            }
        } else if let Err(e) = port.set_timeout(timeout) {
            return Err(self.serial_error(e));
        }

        let Some(port) = self.port.as_mut() else {
            return Err(closed_error("serial"));
        };
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(CortexError::Timeout { duration: timeout })
            }
            Err(e) => Err(CortexError::from_io("serial read", e)),
        }
    }

    fn close(&mut self) {
        self.port.take();
    }

    fn kind(&self) -> &'static str {
        "serial"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_reports_serial_error() {
        let err = SerialTransport::open("/dev/cortex-does-not-exist", DEFAULT_BAUD_RATE)
            .err()
            .expect("opening a missing port must fail");
        assert!(matches!(err, CortexError::Serial { .. }));
        assert!(err.to_string().contains("/dev/cortex-does-not-exist"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pseudo_terminal_round_trip() {
        let (mut peer, port) = serialport::TTYPort::pair().unwrap();
        let path = port.name().unwrap();
        // Release the pair's own handle so the path can be opened like a real device.
        drop(port);
        let mut transport = SerialTransport::open(&path, DEFAULT_BAUD_RATE).unwrap();

        peer.write_all(b"CRTX").unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 8];
        while received.len() < 4 {
            let n = transport.recv(&mut buf, Duration::from_millis(500)).unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"CRTX");

        transport.close();
        assert!(transport.recv(&mut buf, Duration::from_millis(10)).is_err());
    }
}
