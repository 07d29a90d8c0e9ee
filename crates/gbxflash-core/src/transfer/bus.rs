//! Bus adapters between the flash engine's flat chip offsets and the
//! link port.
//!
//! The AGB adapter is a pass-through. The DMG adapter owns the bank
//! arithmetic: data cycles go through the mapper's switchable window,
//! command cycles use raw bus addresses (optionally forced through bank 1
//! so that unlock addresses like 0x5555 reach the chip's address lines).

use crate::cart::CartType;
use crate::error::Result;
use crate::flash::FlashBus;
use crate::link::LinkPort;
use crate::mapper::Mapper;

pub struct AgbFlashBus<'a, P: LinkPort + ?Sized> {
    port: &'a mut P,
}

impl<'a, P: LinkPort + ?Sized> AgbFlashBus<'a, P> {
    pub fn new(port: &'a mut P) -> Self {
        AgbFlashBus { port }
    }
}

impl<P: LinkPort + ?Sized> FlashBus for AgbFlashBus<'_, P> {
    fn width(&self) -> u8 {
        2
    }

    fn command(&mut self, addr: u32, data: u16) -> Result<()> {
        self.port.agb_write(addr, data)
    }

    fn program(&mut self, addr: u32, data: u16) -> Result<()> {
        self.port.agb_write(addr, data)
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.port.agb_read(addr, buf)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.port.delay_ms(ms);
    }
}

pub struct DmgFlashBus<'a, P: LinkPort> {
    port: &'a mut P,
    mapper: &'a mut Mapper,
    bank1_commands: bool,
    current_bank: Option<u16>,
    window_base: u16,
}

impl<'a, P: LinkPort> DmgFlashBus<'a, P> {
    pub fn new(port: &'a mut P, mapper: &'a mut Mapper, cart: &CartType) -> Self {
        DmgFlashBus {
            port,
            mapper,
            bank1_commands: cart.flash_commands_on_bank_1,
            current_bank: None,
            window_base: 0,
        }
    }

    fn ensure_bank(&mut self, bank: u16) -> Result<()> {
        if self.current_bank != Some(bank) {
            let win = self.mapper.select_rom_bank(self.port, bank)?;
            self.current_bank = Some(bank);
            self.window_base = win.base;
        }
        Ok(())
    }

    fn banked_write(&mut self, flat: u32, data: u8) -> Result<()> {
        let bank = (flat >> 14) as u16;
        let off = (flat & 0x3FFF) as u16;
        self.ensure_bank(bank)?;
        self.port.dmg_flash_write(self.window_base + off, data)
    }
}

impl<P: LinkPort> FlashBus for DmgFlashBus<'_, P> {
    fn width(&self) -> u8 {
        1
    }

    fn command(&mut self, addr: u32, data: u16) -> Result<()> {
        // Command-space address: raw bus lines. With the bank-1 flag the
        // window must hold bank 1 so A14+ decode correctly.
        if self.bank1_commands {
            self.ensure_bank(1)?;
        }
        self.port.dmg_flash_write(addr as u16, data as u8)
    }

    fn cell_command(&mut self, addr: u32, data: u16) -> Result<()> {
        // Sector/program address: flat chip offset, reached through the
        // bank that holds it
        self.banked_write(addr, data as u8)
    }

    fn program(&mut self, addr: u32, data: u16) -> Result<()> {
        self.banked_write(addr, data as u8)
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut flat = addr;
        let mut done = 0usize;
        while done < buf.len() {
            let bank = (flat >> 14) as u16;
            let off = (flat & 0x3FFF) as u32;
            self.ensure_bank(bank)?;
            let n = ((0x4000 - off) as usize).min(buf.len() - done);
            self.port
                .dmg_read(self.window_base + off as u16, &mut buf[done..done + n])?;
            done += n;
            flat += n as u32;
        }
        Ok(())
    }

    fn delay_ms(&mut self, ms: u32) {
        self.port.delay_ms(ms);
    }
}
