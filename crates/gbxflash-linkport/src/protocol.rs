//! Bridge wire protocol constants
//!
//! Every command is `[opcode][big-endian operands]`. State-changing
//! commands answer with a single acknowledge byte; read commands answer
//! with data in fixed-size chunks, each non-final chunk released by a
//! one-byte continuation token from the host.

/// Success acknowledge
pub const ACK_OK: u8 = 0x01;
/// Success acknowledge for commands that finish an internal sequence
pub const ACK_DONE: u8 = 0x03;

/// Host-to-bridge token releasing the next read chunk
pub const CONTINUE: u8 = 0x01;

/// Bytes per read chunk, matching the firmware's serial buffer
pub const READ_CHUNK: usize = 64;

/// A failed command is reissued this many times before the link is
/// declared dead
pub const COMMAND_RETRIES: u32 = 3;

/// Acknowledge wait per attempt
pub const ACK_TIMEOUT_MS: u32 = 500;

// Command opcodes
/// Query firmware version, replies [major][minor]
pub const Q_FIRMWARE: u8 = 0x01;
/// Select slot signaling, operand: mode code
pub const SET_MODE: u8 = 0x10;
/// Select cartridge voltage, operand: voltage code
pub const SET_VOLTAGE: u8 = 0x11;
/// Route the flash write strobe, operand: pin code
pub const SET_WRITE_PIN: u8 = 0x12;
/// Pulse the cartridge reset line
pub const RESET_CART: u8 = 0x13;
/// Busy-wait on the bridge, operand: u16 milliseconds
pub const DELAY: u8 = 0x14;

/// DMG bus read, operands: u16 addr, u16 len
pub const DMG_READ: u8 = 0x20;
/// DMG bus write, operands: u16 addr, u8 value
pub const DMG_WRITE: u8 = 0x21;
/// DMG flash write (strobed on the configured pin), operands as DMG_WRITE
pub const DMG_FLASH_WRITE: u8 = 0x22;
/// DMG block write, operands: u16 addr, u16 len, then len data bytes
pub const DMG_WRITE_BLOCK: u8 = 0x23;

/// AGB ROM-space read, operands: u32 addr, u16 len
pub const AGB_READ: u8 = 0x30;
/// AGB ROM-space word write, operands: u32 addr, u16 value
pub const AGB_WRITE: u8 = 0x31;
/// AGB save-space read, operands: u32 addr, u16 len
pub const AGB_SAVE_READ: u8 = 0x32;
/// AGB save-space byte write, operands: u32 addr, u8 value
pub const AGB_SAVE_WRITE: u8 = 0x33;
/// AGB EEPROM read, operands: u8 size code, then whole-array transfer
pub const AGB_EEPROM_READ: u8 = 0x34;
/// AGB EEPROM write, operands: u8 size code, then the array data
pub const AGB_EEPROM_WRITE: u8 = 0x35;

/// Wire codes for `SET_MODE`
pub mod mode {
    pub const DMG: u8 = 0x01;
    pub const AGB: u8 = 0x02;
}

/// Wire codes for `SET_VOLTAGE`
pub mod voltage {
    pub const V5: u8 = 0x01;
    pub const V3_3: u8 = 0x02;
}

/// Wire codes for `SET_WRITE_PIN`
pub mod write_pin {
    pub const WR: u8 = 0x00;
    pub const AUDIO: u8 = 0x01;
    pub const WR_RESET: u8 = 0x02;
}

/// Wire codes for `AGB_EEPROM_*`
pub mod eeprom {
    pub const SIZE_512: u8 = 0x01;
    pub const SIZE_8K: u8 = 0x02;
}
