//! Error types for bridge communication

use thiserror::Error;

/// Bridge-specific errors
#[derive(Debug, Error)]
pub enum LinkError {
    /// Failed to open or configure the serial device
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error during communication
    #[error("I/O error: {0}")]
    Io(String),

    /// The bridge answered something other than a success code
    #[error("Bad acknowledge 0x{got:02X} for command 0x{opcode:02X}")]
    BadAck { opcode: u8, got: u8 },

    /// Fewer bytes arrived than the bridge promised
    #[error("Short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    /// Command retried out; the link is considered dead
    #[error("Command 0x{opcode:02X} failed after {attempts} attempts")]
    RetriesExhausted { opcode: u8, attempts: u32 },

    /// The firmware did not identify itself during the handshake
    #[error("No firmware answer; is this a cartridge bridge?")]
    NoFirmware,
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Io(e.to_string())
    }
}

impl From<LinkError> for gbxflash_core::Error {
    fn from(e: LinkError) -> Self {
        gbxflash_core::Error::Communication(e.to_string())
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, LinkError>;
