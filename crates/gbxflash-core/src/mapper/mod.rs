//! Bank-switch controllers (MBCs)
//!
//! One `Mapper` per running operation. It owns the controller's bank state
//! and translates bank indices into bus writes; callers only ever see raw
//! bus addresses through the returned `RomWindow`. Bank index and in-bank
//! offset never mix.

pub mod rtc;

use crate::error::{Error, Result};
use crate::link::LinkPort;
use rtc::RtcSnapshot;

/// Controller families this tool can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperKind {
    /// 32 KiB ROM, no controller
    None,
    Mbc1,
    /// MBC1 multicart wiring (4-bit inner bank, second logo in bank 0x10)
    Mbc1Multi,
    Mbc2,
    /// Covers MBC30 (full 8-bit bank register)
    Mbc3,
    Mbc5,
    Mbc6,
    Mbc7,
    Mmm01,
    Huc1,
    Huc3,
    Tama5,
    M161,
    /// Nintendo Power GB-Memory G-MMC1
    GbMemory,
}

impl MapperKind {
    pub fn describe(self) -> &'static str {
        match self {
            MapperKind::None => "ROM only",
            MapperKind::Mbc1 => "MBC1",
            MapperKind::Mbc1Multi => "MBC1 multicart",
            MapperKind::Mbc2 => "MBC2",
            MapperKind::Mbc3 => "MBC3",
            MapperKind::Mbc5 => "MBC5",
            MapperKind::Mbc6 => "MBC6",
            MapperKind::Mbc7 => "MBC7",
            MapperKind::Mmm01 => "MMM01",
            MapperKind::Huc1 => "HuC-1",
            MapperKind::Huc3 => "HuC-3",
            MapperKind::Tama5 => "TAMA5",
            MapperKind::M161 => "M161",
            MapperKind::GbMemory => "GB-Memory (G-MMC1)",
        }
    }
}

/// Where a selected ROM bank appears on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomWindow {
    pub base: u16,
    pub size: u32,
}

/// Per-operation controller state
#[derive(Debug)]
pub struct Mapper {
    kind: MapperKind,
    ram_enabled: bool,
    /// MMM01 512 KiB block currently mapped, if any
    mapped_block: Option<u16>,
    /// GB-Memory flash mapped over the whole bus
    gbm_mapped: bool,
}

impl Mapper {
    pub fn new(kind: MapperKind) -> Self {
        Mapper {
            kind,
            ram_enabled: false,
            mapped_block: None,
            gbm_mapped: false,
        }
    }

    /// Build from the raw cartridge-type byte. An unknown byte is fatal;
    /// guessing a controller risks programming through the wrong registers.
    pub fn from_cart_type(byte: u8) -> Result<Self> {
        match crate::header::dmg::classify_mapper(byte) {
            Some(kind) => Ok(Mapper::new(kind)),
            None => Err(Error::UnsupportedMapper(byte)),
        }
    }

    pub fn kind(&self) -> MapperKind {
        self.kind
    }

    pub fn ram_enabled(&self) -> bool {
        self.ram_enabled
    }

    /// Bytes addressable through one bank window
    pub fn bank_size(&self) -> u32 {
        match self.kind {
            MapperKind::None | MapperKind::M161 => 0x8000,
            _ => 0x4000,
        }
    }

    /// True when selecting `bank` needs a cartridge reset first (latch-once
    /// controllers and MMM01 block boundaries)
    pub fn reset_before_bank_change(&self, bank: u16) -> bool {
        match self.kind {
            MapperKind::M161 => true,
            MapperKind::Mmm01 => self.mapped_block != Some(bank >> 5),
            _ => false,
        }
    }

    /// Switch the ROM window to `bank` and report where it landed
    pub fn select_rom_bank(&mut self, port: &mut dyn LinkPort, bank: u16) -> Result<RomWindow> {
        let lower = RomWindow {
            base: 0x0000,
            size: 0x4000,
        };
        let upper = RomWindow {
            base: 0x4000,
            size: 0x4000,
        };
        match self.kind {
            MapperKind::None => Ok(RomWindow {
                base: if bank == 0 { 0x0000 } else { 0x4000 },
                size: 0x4000,
            }),
            MapperKind::Mbc1 => {
                port.dmg_write(0x4000, (bank >> 5) as u8 & 0x03)?;
                port.dmg_write(0x2000, bank as u8 & 0x1F)?;
                if bank != 0 && bank & 0x1F == 0 {
                    // Banks 0x20/0x40/0x60 cannot appear at 0x4000; map them
                    // into the lower window via mode 1
                    port.dmg_write(0x6000, 0x01)?;
                    Ok(lower)
                } else {
                    port.dmg_write(0x6000, 0x00)?;
                    Ok(if bank == 0 { lower } else { upper })
                }
            }
            MapperKind::Mbc1Multi => {
                port.dmg_write(0x6000, 0x01)?;
                port.dmg_write(0x4000, (bank >> 4) as u8 & 0x03)?;
                port.dmg_write(0x2000, bank as u8 & 0x0F)?;
                Ok(if bank & 0x0F == 0 { lower } else { upper })
            }
            MapperKind::Mbc2 => {
                // Bank register requires address bit 8 set
                port.dmg_write(0x2100, bank as u8 & 0x0F)?;
                Ok(if bank == 0 { lower } else { upper })
            }
            MapperKind::Mbc3 => {
                // MBC30 uses the full 8 bits
                port.dmg_write(0x2000, bank as u8)?;
                Ok(if bank == 0 { lower } else { upper })
            }
            MapperKind::Mbc5 | MapperKind::Mbc7 => {
                port.dmg_write(0x2000, bank as u8)?;
                port.dmg_write(0x3000, (bank >> 8) as u8 & 0x01)?;
                Ok(if bank == 0 { lower } else { upper })
            }
            MapperKind::Mbc6 => {
                // Two 8 KiB halves make up the 16 KiB window
                port.dmg_write(0x2800, 0x00)?;
                port.dmg_write(0x3800, 0x00)?;
                port.dmg_write(0x2000, (bank << 1) as u8)?;
                port.dmg_write(0x3000, (bank << 1) as u8 | 0x01)?;
                Ok(if bank == 0 { lower } else { upper })
            }
            MapperKind::Mmm01 => {
                let block = bank >> 5;
                if self.mapped_block != Some(block) {
                    // Block bits latch when the game block is mapped in
                    port.reset_cart()?;
                    port.dmg_write(0x2000, (block << 5) as u8)?;
                    port.dmg_write(0x6000, 0x00)?;
                    port.dmg_write(0x0000, 0x40)?;
                    self.mapped_block = Some(block);
                }
                let inner = bank & 0x1F;
                port.dmg_write(0x2000, inner as u8)?;
                Ok(if inner == 0 { lower } else { upper })
            }
            MapperKind::Huc1 => {
                port.dmg_write(0x2000, bank as u8 & 0x3F)?;
                Ok(if bank == 0 { lower } else { upper })
            }
            MapperKind::Huc3 => {
                port.dmg_write(0x2000, bank as u8 & 0x7F)?;
                Ok(if bank == 0 { lower } else { upper })
            }
            MapperKind::Tama5 => {
                rtc::tama5_enable(port)?;
                rtc::tama5_reg_write(port, 0x00, bank as u8 & 0x0F)?;
                rtc::tama5_reg_write(port, 0x01, (bank >> 4) as u8 & 0x01)?;
                Ok(if bank == 0 { lower } else { upper })
            }
            MapperKind::M161 => {
                // The block register latches once per reset
                port.reset_cart()?;
                port.dmg_write(0x4000, bank as u8 & 0x07)?;
                Ok(RomWindow {
                    base: 0x0000,
                    size: 0x8000,
                })
            }
            MapperKind::GbMemory => {
                self.gbm_ensure_mapped(port)?;
                port.dmg_write(0x2000, bank as u8)?;
                port.dmg_write(0x3000, (bank >> 8) as u8 & 0x01)?;
                Ok(if bank == 0 { lower } else { upper })
            }
        }
    }

    /// Open or close the 0xA000 RAM window
    pub fn enable_ram(&mut self, port: &mut dyn LinkPort, on: bool) -> Result<()> {
        let value = if on { 0x0A } else { 0x00 };
        match self.kind {
            MapperKind::None | MapperKind::M161 => {}
            MapperKind::Tama5 => {
                if on {
                    rtc::tama5_enable(port)?;
                }
            }
            MapperKind::Mbc7 => {
                port.dmg_write(0x0000, value)?;
                // Second unlock gates the accelerometer/EEPROM registers
                port.dmg_write(0x4000, if on { 0x40 } else { 0x00 })?;
            }
            MapperKind::GbMemory => {
                if on {
                    gbm_wake(port)?;
                }
                port.dmg_write(0x0000, value)?;
            }
            _ => port.dmg_write(0x0000, value)?,
        }
        self.ram_enabled = on;
        Ok(())
    }

    pub fn select_ram_bank(&mut self, port: &mut dyn LinkPort, bank: u8) -> Result<()> {
        match self.kind {
            MapperKind::None
            | MapperKind::Mbc2
            | MapperKind::Mbc7
            | MapperKind::M161
            | MapperKind::Tama5 => Ok(()),
            MapperKind::Mbc1 | MapperKind::Mbc1Multi => {
                port.dmg_write(0x6000, 0x01)?;
                port.dmg_write(0x4000, bank & 0x03)
            }
            MapperKind::Mbc3 => port.dmg_write(0x4000, bank & 0x07),
            MapperKind::Mbc6 => {
                // 4 KiB halves at 0xA000/0xB000
                port.dmg_write(0x0400, bank << 1)?;
                port.dmg_write(0x0800, (bank << 1) | 0x01)
            }
            _ => port.dmg_write(0x4000, bank & 0x0F),
        }
    }

    pub fn has_rtc(&self) -> bool {
        matches!(
            self.kind,
            MapperKind::Mbc3 | MapperKind::Huc3 | MapperKind::Tama5
        )
    }

    pub fn read_rtc(&mut self, port: &mut dyn LinkPort, now_unix: u64) -> Result<RtcSnapshot> {
        match self.kind {
            MapperKind::Mbc3 => rtc::read_mbc3(port, now_unix),
            MapperKind::Huc3 => rtc::read_huc3(port, now_unix),
            MapperKind::Tama5 => rtc::read_tama5(port, now_unix),
            _ => Err(Error::UnsupportedMapper(0)),
        }
    }

    pub fn write_rtc(&mut self, port: &mut dyn LinkPort, snap: &RtcSnapshot) -> Result<()> {
        match self.kind {
            MapperKind::Mbc3 => rtc::write_mbc3(port, snap),
            MapperKind::Huc3 => rtc::write_huc3(port, snap),
            MapperKind::Tama5 => rtc::write_tama5(port, snap),
            _ => Err(Error::UnsupportedMapper(0)),
        }
    }

    /// G-MMC1 carries a 128-byte configuration sector outside the ROM space
    pub fn has_hidden_sector(&self) -> bool {
        self.kind == MapperKind::GbMemory
    }

    fn gbm_ensure_mapped(&mut self, port: &mut dyn LinkPort) -> Result<()> {
        if !self.gbm_mapped {
            gbm_wake(port)?;
            gbm_command(port, GBM_CMD_MAP_ENTIRE_ROM, &[])?;
            self.gbm_mapped = true;
        }
        Ok(())
    }

    /// Read the G-MMC1 hidden sector (mapping file and write counters)
    pub fn read_hidden_sector(&mut self, port: &mut dyn LinkPort) -> Result<[u8; 128]> {
        gbm_wake(port)?;
        gbm_command(port, GBM_CMD_MAP_HIDDEN, &[])?;
        let mut sector = [0u8; 128];
        port.dmg_read(0x0000, &mut sector)?;
        gbm_command(port, GBM_CMD_MAP_MENU, &[])?;
        self.gbm_mapped = false;
        Ok(sector)
    }

    /// Map the hidden sector for erase/program through the flash engine;
    /// the caller must unmap with `leave_hidden_sector` afterwards
    pub fn enter_hidden_sector(&mut self, port: &mut dyn LinkPort) -> Result<()> {
        gbm_wake(port)?;
        gbm_unlock_write(port)?;
        gbm_command(port, GBM_CMD_MAP_HIDDEN, &[])?;
        self.gbm_mapped = false;
        Ok(())
    }

    pub fn leave_hidden_sector(&mut self, port: &mut dyn LinkPort) -> Result<()> {
        gbm_command(port, GBM_CMD_MAP_MENU, &[])?;
        gbm_command(port, GBM_CMD_SLEEP, &[])?;
        Ok(())
    }

    /// Flash command writes must be strobed with write protection lifted
    /// on GB-Memory carts before the engine runs
    pub fn prepare_flash_write(&mut self, port: &mut dyn LinkPort) -> Result<()> {
        if self.kind == MapperKind::GbMemory {
            gbm_wake(port)?;
            gbm_unlock_write(port)?;
            self.gbm_ensure_mapped(port)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// G-MMC1 register protocol
// ---------------------------------------------------------------------------
//
// Commands load into 0x0120 with arguments at 0x0121.., and run when 0xA5
// is written to 0x013F. Register access itself is gated behind the wake
// command with its 0xAA/0x55 key.

const GBM_REG_CMD: u16 = 0x0120;
const GBM_REG_EXEC: u16 = 0x013F;
const GBM_EXEC_KEY: u8 = 0xA5;

const GBM_CMD_MAP_ENTIRE_ROM: u8 = 0x04;
const GBM_CMD_MAP_MENU: u8 = 0x05;
const GBM_CMD_MAP_HIDDEN: u8 = 0x02;
const GBM_CMD_SLEEP: u8 = 0x08;
const GBM_CMD_WAKE: u8 = 0x09;
const GBM_CMD_WRITE_ENABLE: u8 = 0x0A;

fn gbm_command(port: &mut dyn LinkPort, cmd: u8, args: &[u8]) -> Result<()> {
    port.dmg_write(GBM_REG_CMD, cmd)?;
    for (i, &a) in args.iter().enumerate() {
        port.dmg_write(GBM_REG_CMD + 1 + i as u16, a)?;
    }
    port.dmg_write(GBM_REG_EXEC, GBM_EXEC_KEY)?;
    Ok(())
}

fn gbm_wake(port: &mut dyn LinkPort) -> Result<()> {
    gbm_command(port, GBM_CMD_WAKE, &[0xAA, 0x55])
}

fn gbm_unlock_write(port: &mut dyn LinkPort) -> Result<()> {
    gbm_command(port, GBM_CMD_WRITE_ENABLE, &[0x00, 0x00, 0x00, 0x62, 0x04])
}

// ---------------------------------------------------------------------------
// MBC7 EEPROM (93LC56 bit-banged through 0xA080)
// ---------------------------------------------------------------------------
//
// Port bit layout: CS = bit 7, CLK = bit 6, DI = bit 1, DO = bit 0.
// The part is organized as 128 x16; opcodes are MSB-first after a start bit.

const MBC7_EE_PORT: u16 = 0xA080;
pub const MBC7_EEPROM_LEN: usize = 256;

struct Mbc7Eeprom<'a> {
    port: &'a mut dyn LinkPort,
}

impl<'a> Mbc7Eeprom<'a> {
    fn cs_low(&mut self) -> Result<()> {
        self.port.dmg_write(MBC7_EE_PORT, 0x00)
    }

    fn cs_high(&mut self) -> Result<()> {
        self.port.dmg_write(MBC7_EE_PORT, 0x80)
    }

    fn clock_out(&mut self, bit: u8) -> Result<()> {
        let di = (bit & 1) << 1;
        self.port.dmg_write(MBC7_EE_PORT, 0x80 | di)?;
        self.port.dmg_write(MBC7_EE_PORT, 0x80 | 0x40 | di)?;
        Ok(())
    }

    fn clock_in(&mut self) -> Result<u8> {
        self.port.dmg_write(MBC7_EE_PORT, 0x80)?;
        self.port.dmg_write(MBC7_EE_PORT, 0x80 | 0x40)?;
        let mut b = [0u8; 1];
        self.port.dmg_read(MBC7_EE_PORT, &mut b)?;
        Ok(b[0] & 0x01)
    }

    /// Start bit, 2-bit opcode, 8-bit address field
    fn command(&mut self, opcode: u8, addr: u8) -> Result<()> {
        self.cs_low()?;
        self.cs_high()?;
        self.clock_out(1)?;
        self.clock_out(opcode >> 1)?;
        self.clock_out(opcode & 1)?;
        for i in (0..8).rev() {
            self.clock_out(addr >> i)?;
        }
        Ok(())
    }

    fn read_word(&mut self, addr: u8) -> Result<u16> {
        self.command(0b10, addr)?;
        let mut word = 0u16;
        for _ in 0..16 {
            word = word << 1 | self.clock_in()? as u16;
        }
        Ok(word)
    }

    fn write_word(&mut self, addr: u8, word: u16) -> Result<()> {
        self.command(0b01, addr)?;
        for i in (0..16).rev() {
            self.clock_out((word >> i) as u8 & 1)?;
        }
        // Busy poll: CS cycle, DO goes high when the cell is written
        self.cs_low()?;
        self.cs_high()?;
        for _ in 0..256 {
            if self.clock_in()? == 1 {
                return Ok(());
            }
        }
        Err(Error::ProgramTimeout {
            addr: addr as u32 * 2,
            last_status: 0,
        })
    }

    fn write_enable(&mut self) -> Result<()> {
        // EWEN: opcode 00, address 11xxxxxx
        self.command(0b00, 0xC0)
    }

    fn write_disable(&mut self) -> Result<()> {
        self.command(0b00, 0x00)
    }
}

/// Dump the MBC7 save EEPROM. `Mapper::enable_ram` must have run first.
pub fn mbc7_eeprom_read(port: &mut dyn LinkPort) -> Result<Vec<u8>> {
    let mut ee = Mbc7Eeprom { port };
    let mut out = Vec::with_capacity(MBC7_EEPROM_LEN);
    for addr in 0..(MBC7_EEPROM_LEN / 2) as u8 {
        let word = ee.read_word(addr)?;
        out.push((word >> 8) as u8);
        out.push(word as u8);
    }
    ee.cs_low()?;
    Ok(out)
}

/// Program the MBC7 save EEPROM from a 256-byte image
pub fn mbc7_eeprom_write(port: &mut dyn LinkPort, data: &[u8]) -> Result<Vec<u8>> {
    let mut ee = Mbc7Eeprom { port };
    ee.write_enable()?;
    for addr in 0..(MBC7_EEPROM_LEN / 2) as u8 {
        let i = addr as usize * 2;
        let hi = data.get(i).copied().unwrap_or(0xFF);
        let lo = data.get(i + 1).copied().unwrap_or(0xFF);
        ee.write_word(addr, (hi as u16) << 8 | lo as u16)?;
    }
    ee.write_disable()?;
    ee.cs_low()?;
    mbc7_eeprom_read(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptPort;

    #[test]
    fn unknown_cart_type_byte_is_fatal() {
        match Mapper::from_cart_type(0xEA) {
            Err(Error::UnsupportedMapper(0xEA)) => {}
            other => panic!("expected UnsupportedMapper, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn mbc5_writes_both_bank_registers() {
        let mut port = ScriptPort::new();
        let mut m = Mapper::new(MapperKind::Mbc5);
        let win = m.select_rom_bank(&mut port, 0x1FF).unwrap();

        assert_eq!(port.last_write(0x2000), Some(0xFF));
        assert_eq!(port.last_write(0x3000), Some(0x01));
        assert_eq!(win.base, 0x4000);
        assert_eq!(win.size, 0x4000);
    }

    #[test]
    fn mbc1_aliased_bank_maps_through_lower_window() {
        let mut port = ScriptPort::new();
        let mut m = Mapper::new(MapperKind::Mbc1);

        // Bank 0x20 has zero low bits; needs mode 1 and the lower window
        let win = m.select_rom_bank(&mut port, 0x20).unwrap();
        assert_eq!(win.base, 0x0000);
        assert_eq!(port.last_write(0x6000), Some(0x01));
        assert_eq!(port.last_write(0x4000), Some(0x01));

        let win = m.select_rom_bank(&mut port, 0x21).unwrap();
        assert_eq!(win.base, 0x4000);
        assert_eq!(port.last_write(0x6000), Some(0x00));
    }

    #[test]
    fn mmm01_resets_only_on_block_boundaries() {
        let mut port = ScriptPort::new();
        let mut m = Mapper::new(MapperKind::Mmm01);

        assert!(m.reset_before_bank_change(0x00));
        m.select_rom_bank(&mut port, 0x00).unwrap();
        assert_eq!(port.resets, 1);

        // Same 512 KiB block: no reset
        assert!(!m.reset_before_bank_change(0x1F));
        m.select_rom_bank(&mut port, 0x1F).unwrap();
        assert_eq!(port.resets, 1);

        // Next block: reset and remap
        assert!(m.reset_before_bank_change(0x20));
        m.select_rom_bank(&mut port, 0x20).unwrap();
        assert_eq!(port.resets, 2);
        assert_eq!(port.last_write(0x0000), Some(0x40));
    }

    #[test]
    fn m161_latches_one_32k_block_per_reset() {
        let mut port = ScriptPort::new();
        let mut m = Mapper::new(MapperKind::M161);

        let win = m.select_rom_bank(&mut port, 3).unwrap();
        assert_eq!(port.resets, 1);
        assert_eq!(win.base, 0x0000);
        assert_eq!(win.size, 0x8000);
        assert_eq!(port.last_write(0x4000), Some(0x03));
    }

    #[test]
    fn mbc2_bank_register_keeps_address_bit_8() {
        let mut port = ScriptPort::new();
        let mut m = Mapper::new(MapperKind::Mbc2);
        m.select_rom_bank(&mut port, 5).unwrap();
        assert_eq!(port.writes, vec![(0x2100, 0x05)]);
    }

    #[test]
    fn gb_memory_maps_flash_before_banking() {
        let mut port = ScriptPort::new();
        let mut m = Mapper::new(MapperKind::GbMemory);
        m.select_rom_bank(&mut port, 2).unwrap();

        // Wake key then map-entire-ROM, each executed via 0x013F
        let cmds = port
            .writes
            .iter()
            .filter(|(a, _)| *a == GBM_REG_CMD)
            .map(|(_, v)| *v)
            .collect::<Vec<_>>();
        assert_eq!(cmds, vec![GBM_CMD_WAKE, GBM_CMD_MAP_ENTIRE_ROM]);
        assert_eq!(
            port.writes
                .iter()
                .filter(|(a, v)| *a == GBM_REG_EXEC && *v == GBM_EXEC_KEY)
                .count(),
            2
        );
        assert_eq!(port.last_write(0x2000), Some(0x02));

        // Second switch reuses the mapping
        port.writes.clear();
        m.select_rom_bank(&mut port, 3).unwrap();
        assert!(port.writes.iter().all(|(a, _)| *a != GBM_REG_CMD));
    }

    #[test]
    fn mbc7_ram_unlock_is_two_stage() {
        let mut port = ScriptPort::new();
        let mut m = Mapper::new(MapperKind::Mbc7);
        m.enable_ram(&mut port, true).unwrap();
        assert_eq!(port.writes, vec![(0x0000, 0x0A), (0x4000, 0x40)]);
    }
}
