//! Shared mock link port for unit tests
//!
//! Records every bus write and serves scripted bytes for reads. Modules
//! that need real NOR semantics build their own mocks on top of this.

use std::collections::VecDeque;

use crate::error::Result;
use crate::link::{EepromSize, LinkPort, PortMode, Voltage, WritePin};

#[derive(Default)]
pub(crate) struct ScriptPort {
    pub mode: Option<PortMode>,
    pub voltage: Option<Voltage>,
    pub write_pin: Option<WritePin>,
    /// (addr, value) log of plain DMG bus writes
    pub writes: Vec<(u16, u8)>,
    /// (addr, value) log of flash-strobed writes
    pub flash_writes: Vec<(u16, u8)>,
    /// Bytes served to `dmg_read`, one per byte requested
    pub dmg_reads: VecDeque<u8>,
    /// Bytes served to `agb_read`
    pub agb_reads: VecDeque<u8>,
    pub resets: usize,
}

impl ScriptPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value written to `addr`, if any
    pub fn last_write(&self, addr: u16) -> Option<u8> {
        self.writes
            .iter()
            .rev()
            .find(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
    }
}

impl LinkPort for ScriptPort {
    fn mode(&self) -> Option<PortMode> {
        self.mode
    }

    fn set_mode(&mut self, mode: PortMode) -> Result<()> {
        self.mode = Some(mode);
        Ok(())
    }

    fn set_voltage(&mut self, voltage: Voltage) -> Result<()> {
        self.voltage = Some(voltage);
        Ok(())
    }

    fn set_write_pin(&mut self, pin: WritePin) -> Result<()> {
        self.write_pin = Some(pin);
        Ok(())
    }

    fn dmg_read(&mut self, _addr: u16, buf: &mut [u8]) -> Result<()> {
        for b in buf.iter_mut() {
            *b = self.dmg_reads.pop_front().unwrap_or(0xFF);
        }
        Ok(())
    }

    fn dmg_write(&mut self, addr: u16, value: u8) -> Result<()> {
        self.writes.push((addr, value));
        Ok(())
    }

    fn dmg_flash_write(&mut self, addr: u16, value: u8) -> Result<()> {
        self.flash_writes.push((addr, value));
        Ok(())
    }

    fn agb_read(&mut self, _addr: u32, buf: &mut [u8]) -> Result<()> {
        for b in buf.iter_mut() {
            *b = self.agb_reads.pop_front().unwrap_or(0xFF);
        }
        Ok(())
    }

    fn agb_write(&mut self, _addr: u32, _value: u16) -> Result<()> {
        Ok(())
    }

    fn agb_save_read(&mut self, _addr: u32, buf: &mut [u8]) -> Result<()> {
        buf.fill(0xFF);
        Ok(())
    }

    fn agb_save_write(&mut self, _addr: u32, _value: u8) -> Result<()> {
        Ok(())
    }

    fn agb_eeprom_read(&mut self, _size: EepromSize, buf: &mut [u8]) -> Result<()> {
        buf.fill(0xFF);
        Ok(())
    }

    fn agb_eeprom_write(&mut self, _size: EepromSize, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn reset_cart(&mut self) -> Result<()> {
        self.resets += 1;
        Ok(())
    }

    fn delay_ms(&mut self, _ms: u32) {}
}

/// In-memory NOR flash speaking the AMD command protocol: AND-writes,
/// erase to 0xFF, 0xAA/0x55 unlock cycles decoded by data value.
/// Addresses are byte addresses; data writes land as little-endian words.
pub(crate) struct MockNorChip {
    pub mem: Vec<u8>,
    pub sector_size: u32,
    /// Byte-wide part: data cycles carry one byte, not a word
    pub x8: bool,
    pub id: Vec<u8>,
    /// Sector bases erased, in order (chip erase records 0xFFFF_FFFF)
    pub erases: Vec<u32>,
    pub program_words: u32,
    pub buffer_commits: u32,
    /// Reads answered as busy before an erase reports done
    pub erase_polls_until_done: u32,
    busy_polls: u32,
    state: NorState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NorState {
    Read,
    Unlock1,
    Unlock2,
    Autoselect,
    ProgramNext,
    EraseSetup,
    EraseUnlock1,
    EraseUnlock2,
    BufferCount,
    BufferData { remaining: u16 },
    BufferCommit,
}

impl MockNorChip {
    pub fn new(size: u32, sector_size: u32) -> Self {
        MockNorChip {
            mem: vec![0xFF; size as usize],
            sector_size,
            x8: false,
            id: vec![0x01, 0x7E],
            erases: Vec::new(),
            program_words: 0,
            buffer_commits: 0,
            erase_polls_until_done: 0,
            busy_polls: 0,
            state: NorState::Read,
        }
    }

    pub fn fill(&mut self, value: u8) {
        self.mem.fill(value);
    }

    fn write_word(&mut self, addr: u32, data: u16) {
        let a = addr as usize;
        if a < self.mem.len() {
            self.mem[a] &= data as u8;
        }
        if !self.x8 && a + 1 < self.mem.len() {
            self.mem[a + 1] &= (data >> 8) as u8;
        }
    }

    pub fn command(&mut self, addr: u32, data: u16) {
        let byte = data as u8;
        // 0xF0 resets from any command state, but in data-carrying states
        // it is payload (an image word may well end in 0xF0)
        let data_state = matches!(
            self.state,
            NorState::BufferData { .. } | NorState::ProgramNext
        );
        if byte == 0xF0 && !data_state {
            self.state = NorState::Read;
            return;
        }
        self.state = match self.state {
            NorState::Read => match byte {
                0xAA => NorState::Unlock1,
                0x25 => NorState::BufferCount,
                _ => NorState::Read,
            },
            NorState::Unlock1 => {
                if byte == 0x55 {
                    NorState::Unlock2
                } else {
                    NorState::Read
                }
            }
            NorState::Unlock2 => match byte {
                0x90 => NorState::Autoselect,
                0xA0 => NorState::ProgramNext,
                0x80 => NorState::EraseSetup,
                _ => NorState::Read,
            },
            NorState::Autoselect => NorState::Autoselect,
            NorState::ProgramNext => {
                self.write_word(addr, data);
                self.program_words += 1;
                NorState::Read
            }
            NorState::EraseSetup => {
                if byte == 0xAA {
                    NorState::EraseUnlock1
                } else {
                    NorState::Read
                }
            }
            NorState::EraseUnlock1 => {
                if byte == 0x55 {
                    NorState::EraseUnlock2
                } else {
                    NorState::Read
                }
            }
            NorState::EraseUnlock2 => {
                match byte {
                    0x30 => {
                        let base = addr - addr % self.sector_size;
                        let end = ((base + self.sector_size) as usize).min(self.mem.len());
                        self.mem[base as usize..end].fill(0xFF);
                        self.erases.push(base);
                    }
                    0x10 => {
                        self.mem.fill(0xFF);
                        self.erases.push(u32::MAX);
                    }
                    _ => {}
                }
                self.busy_polls = self.erase_polls_until_done;
                NorState::Read
            }
            NorState::BufferCount => NorState::BufferData {
                remaining: data.wrapping_add(1),
            },
            NorState::BufferData { remaining } => {
                self.write_word(addr, data);
                self.program_words += 1;
                if remaining <= 1 {
                    NorState::BufferCommit
                } else {
                    NorState::BufferData {
                        remaining: remaining - 1,
                    }
                }
            }
            NorState::BufferCommit => {
                if byte == 0x29 {
                    self.buffer_commits += 1;
                }
                NorState::Read
            }
        };
    }

    pub fn read(&mut self, addr: u32, buf: &mut [u8]) {
        match self.state {
            NorState::Autoselect => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = self
                        .id
                        .get(addr as usize + i)
                        .copied()
                        .unwrap_or(0x00);
                }
            }
            _ => {
                if self.busy_polls > 0 {
                    self.busy_polls -= 1;
                    buf.fill(0x00);
                    return;
                }
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = self
                        .mem
                        .get(addr as usize + i)
                        .copied()
                        .unwrap_or(0xFF);
                }
            }
        }
    }
}
