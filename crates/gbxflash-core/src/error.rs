//! Error types for gbxflash-core

use thiserror::Error;

/// CFI decode failures
///
/// `NoCfi` is recoverable: callers fall back to the descriptor's static
/// sector map or disable sector erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CfiError {
    /// The QRY signature (or its D0/D1-swapped form) was not found
    #[error("no CFI data (missing QRY signature)")]
    NoCfi,
    /// Signature present but a mandatory field decoded to nonsense
    #[error("malformed CFI data: {0}")]
    Malformed(&'static str),
}

/// Core error type covering every fatal and recoverable failure class
#[derive(Debug, Error)]
pub enum Error {
    /// Serial link failed after all retries; reconnecting the bridge is the
    /// only recovery
    #[error("communication with the bridge failed: {0} (reconnect the device and retry)")]
    Communication(String),

    /// Mapper byte is not one we know how to drive; never silently defaulted
    #[error("unsupported mapper type 0x{0:02X}")]
    UnsupportedMapper(u8),

    /// Erase status polling exhausted its time budget
    #[error("erase timed out at 0x{addr:08X} (last status 0x{last_status:04X})")]
    EraseTimeout { addr: u32, last_status: u16 },

    /// Program status polling exhausted its time budget
    #[error("program timed out at 0x{addr:08X} (last status 0x{last_status:04X})")]
    ProgramTimeout { addr: u32, last_status: u16 },

    /// Post-write readback differs from what was written
    #[error("verify mismatch at 0x{offset:08X}: wrote 0x{expected:02X}, read back 0x{found:02X}")]
    VerifyMismatch { offset: u32, expected: u8, found: u8 },

    /// Sector rewrite retries exhausted; includes guidance for the operator
    #[error(
        "writing sector at 0x{addr:08X} kept failing after {attempts} attempts: {reason} \
         (clean the cartridge contacts, double-check the selected cartridge type, and make \
         sure the mapper supports this ROM size)"
    )]
    WriteRetriesExhausted {
        addr: u32,
        attempts: u32,
        reason: String,
    },

    /// CFI decode failed where the descriptor required CFI geometry
    #[error(transparent)]
    Cfi(#[from] CfiError),

    /// Catalog file rejected during load-time validation
    #[error("cartridge catalog: {0}")]
    Catalog(String),

    /// Operation cancelled cooperatively; hardware left in read mode
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Fatal errors end the operation; only `Cfi` is handled locally.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Cfi(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
