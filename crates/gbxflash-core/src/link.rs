//! Link-port abstraction
//!
//! `LinkPort` is the seam between the algorithmic layers (mapper, flash
//! engine, orchestrator) and the actual USB serial bridge. The hardware
//! implementation lives in `gbxflash-linkport`; tests implement the trait
//! with in-memory mock cartridges.

use crate::error::Result;

/// Which cartridge slot protocol the bridge is speaking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    /// Game Boy / Game Boy Color (8-bit bus, 16-bit addresses)
    Dmg,
    /// Game Boy Advance (16-bit bus, byte addresses)
    Agb,
}

/// Cartridge supply voltage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voltage {
    V3_3,
    V5,
}

impl Voltage {
    pub fn millivolts(self) -> u16 {
        match self {
            Voltage::V3_3 => 3300,
            Voltage::V5 => 5000,
        }
    }
}

impl std::fmt::Display for Voltage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Voltage::V3_3 => write!(f, "3.3V"),
            Voltage::V5 => write!(f, "5V"),
        }
    }
}

/// Which pin flash command writes are strobed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePin {
    #[default]
    Wr,
    /// Bootleg DMG carts routed through the AUDIO pin
    Audio,
    /// WR with RESET held, used by a few AGB bootlegs
    WrReset,
}

/// AGB EEPROM density (addressed in 8-byte blocks over a serial protocol
/// the bridge firmware implements)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EepromSize {
    /// 512 bytes, 6-bit block addresses
    E512,
    /// 8 KiB, 14-bit block addresses
    E8K,
}

impl EepromSize {
    pub fn byte_len(self) -> usize {
        match self {
            EepromSize::E512 => 512,
            EepromSize::E8K => 8192,
        }
    }
}

/// Bridge firmware revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Device abstraction for the cartridge bridge
///
/// Addresses passed here are raw bus addresses; bank arithmetic is the
/// mapper's job and never leaks through this trait.
pub trait LinkPort {
    /// Currently selected slot protocol, if any
    fn mode(&self) -> Option<PortMode>;

    /// Switch the bridge between DMG and AGB signaling
    fn set_mode(&mut self, mode: PortMode) -> Result<()>;

    /// Select cartridge supply voltage
    fn set_voltage(&mut self, voltage: Voltage) -> Result<()>;

    /// Route flash command strobes to the given pin
    fn set_write_pin(&mut self, pin: WritePin) -> Result<()>;

    /// Read `buf.len()` sequential bytes from the DMG bus starting at `addr`
    fn dmg_read(&mut self, addr: u16, buf: &mut [u8]) -> Result<()>;

    /// Single write on the DMG bus (bank registers, RAM enable, SRAM bytes)
    fn dmg_write(&mut self, addr: u16, value: u8) -> Result<()>;

    /// Flash command write on the DMG bus, strobed on the configured pin
    fn dmg_flash_write(&mut self, addr: u16, value: u8) -> Result<()>;

    /// Block write to the DMG bus (SRAM window restores)
    fn dmg_write_block(&mut self, addr: u16, data: &[u8]) -> Result<()> {
        for (i, &b) in data.iter().enumerate() {
            self.dmg_write(addr + i as u16, b)?;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes (even count) from the AGB ROM bus
    fn agb_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// 16-bit write on the AGB ROM bus at byte address `addr`
    fn agb_write(&mut self, addr: u32, value: u16) -> Result<()>;

    /// Read from the AGB 8-bit SRAM/flash-save bus (0x0E000000 region,
    /// addresses here are relative to the save space)
    fn agb_save_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// 8-bit write on the AGB save bus
    fn agb_save_write(&mut self, addr: u32, value: u8) -> Result<()>;

    /// Read a whole AGB EEPROM through the bridge firmware
    fn agb_eeprom_read(&mut self, size: EepromSize, buf: &mut [u8]) -> Result<()>;

    /// Write a whole AGB EEPROM through the bridge firmware
    fn agb_eeprom_write(&mut self, size: EepromSize, data: &[u8]) -> Result<()>;

    /// Pulse the cartridge RESET line and return the bus to read mode
    fn reset_cart(&mut self) -> Result<()>;

    /// Host-side delay; mock devices may make this a no-op
    fn delay_ms(&mut self, ms: u32);
}
