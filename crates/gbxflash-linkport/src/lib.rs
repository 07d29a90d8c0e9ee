//! gbxflash-linkport - USB serial cartridge bridge
//!
//! This crate talks to the flasher hardware: a microcontroller bridge
//! that exposes the DMG and AGB cartridge buses over a USB serial port.
//! `BridgeDevice` implements [`gbxflash_core::link::LinkPort`], so the
//! rest of the stack never sees serial framing or retries.
//!
//! # Example
//!
//! ```no_run
//! use gbxflash_linkport::open_serial;
//! use gbxflash_core::transfer::Session;
//!
//! let device = open_serial("/dev/ttyACM0", None)?;
//! println!("firmware {}", device.firmware());
//! let _session = Session::new(device);
//! # Ok::<(), gbxflash_linkport::LinkError>(())
//! ```

#![warn(rust_2018_idioms)]

pub mod device;
pub mod error;
pub mod protocol;
pub mod transport;

pub use device::BridgeDevice;
pub use error::{LinkError, Result};
pub use transport::serial::SerialTransport;
pub use transport::Transport;

/// Open a bridge on a serial port and complete the handshake
pub fn open_serial(device: &str, baud: Option<u32>) -> Result<BridgeDevice<SerialTransport>> {
    let transport = SerialTransport::open(device, baud)?;
    BridgeDevice::new(transport)
}

/// List serial ports that look like cartridge bridges. With no USB
/// metadata to go by every port is a candidate.
pub fn list_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            log::warn!("could not enumerate serial ports: {e}");
            Vec::new()
        }
    }
}
