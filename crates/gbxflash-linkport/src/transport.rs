//! Transport layer for bridge communication
//!
//! The protocol layer only sees this trait; the serial implementation
//! lives in the `serial` submodule so tests can script a transport.

use crate::error::{LinkError, Result};

/// Byte pipe to the bridge
pub trait Transport {
    /// Write all bytes
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read exactly `buf.len()` bytes or fail
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout_ms`.
    /// Returns the number of bytes read, 0 on timeout.
    fn read_nonblock(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()>;

    /// Drain stale bytes from both directions
    fn clear(&mut self) -> Result<()>;
}

pub mod serial {
    //! Serial port transport implementation

    use super::*;
    use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
    use std::io::{Read, Write};
    use std::time::Duration;

    pub const DEFAULT_BAUD: u32 = 1_000_000;

    /// Serial port transport
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
    }

    impl SerialTransport {
        /// Open a serial port; `baud` falls back to the bridge default
        pub fn open(device: &str, baud: Option<u32>) -> Result<Self> {
            let baud_rate = baud.unwrap_or(DEFAULT_BAUD);

            let port = serialport::new(device, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_secs(5))
                .open()?;

            log::info!("Opened serial port {} at {} baud", device, baud_rate);

            Ok(Self { port })
        }
    }

    impl Transport for SerialTransport {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.port.write_all(data)?;
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            self.port.read_exact(buf)?;
            Ok(())
        }

        fn read_nonblock(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
            let old_timeout = self.port.timeout();
            self.port
                .set_timeout(Duration::from_millis(timeout_ms as u64))?;

            let result = match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(LinkError::from(e)),
            };

            self.port.set_timeout(old_timeout)?;
            result
        }

        fn flush(&mut self) -> Result<()> {
            self.port.flush()?;
            Ok(())
        }

        fn clear(&mut self) -> Result<()> {
            self.port.clear(serialport::ClearBuffer::All)?;
            Ok(())
        }
    }
}
