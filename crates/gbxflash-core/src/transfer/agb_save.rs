//! AGB save-memory protocols
//!
//! The save space behind 0x0E000000 is an 8-bit bus carrying either plain
//! SRAM, a small flash part with its own AMD-style protocol, or nothing
//! (EEPROM carts talk a serial protocol the bridge firmware implements).

use crate::error::{Error, Result};
use crate::header::agb::AgbSaveType;
use crate::link::{EepromSize, LinkPort};

const CHUNK: usize = 0x1000;
/// 128 KiB flash saves are two 64 KiB banks behind a bank command
const FLASH_BANK: u32 = 0x10000;
const FLASH_ERASE_MS: u32 = 4_000;
const FLASH_BYTE_POLL: u32 = 64;

fn flash_cmd(port: &mut dyn LinkPort, cmd: u8) -> Result<()> {
    port.agb_save_write(0x5555, 0xAA)?;
    port.agb_save_write(0x2AAA, 0x55)?;
    port.agb_save_write(0x5555, cmd)
}

fn flash_switch_bank(port: &mut dyn LinkPort, bank: u8) -> Result<()> {
    flash_cmd(port, 0xB0)?;
    port.agb_save_write(0x0000, bank)
}

fn flash_wait_blank(port: &mut dyn LinkPort, addr: u32) -> Result<()> {
    let mut b = [0u8; 1];
    for _ in 0..FLASH_ERASE_MS / 4 {
        port.agb_save_read(addr, &mut b)?;
        if b[0] == 0xFF {
            return Ok(());
        }
        port.delay_ms(4);
    }
    Err(Error::EraseTimeout {
        addr,
        last_status: b[0] as u16,
    })
}

/// Read the whole save memory for `ty`
pub fn read_save(
    port: &mut dyn LinkPort,
    ty: AgbSaveType,
    mut chunk_done: impl FnMut(u32, u32),
) -> Result<Vec<u8>> {
    let len = ty.byte_len() as usize;
    let mut out = vec![0u8; len];
    match ty {
        AgbSaveType::None => {}
        AgbSaveType::Eeprom512 => port.agb_eeprom_read(EepromSize::E512, &mut out)?,
        AgbSaveType::Eeprom8K => port.agb_eeprom_read(EepromSize::E8K, &mut out)?,
        AgbSaveType::Sram32K | AgbSaveType::Flash64K | AgbSaveType::Flash128K => {
            let banked = ty == AgbSaveType::Flash128K;
            for (i, chunk) in out.chunks_mut(CHUNK).enumerate() {
                let pos = (i * CHUNK) as u32;
                if banked && pos % FLASH_BANK == 0 {
                    flash_switch_bank(port, (pos / FLASH_BANK) as u8)?;
                }
                port.agb_save_read(pos % FLASH_BANK, chunk)?;
                chunk_done(pos + chunk.len() as u32, len as u32);
            }
            if banked {
                flash_switch_bank(port, 0)?;
            }
        }
    }
    Ok(out)
}

/// Write `data` into the save memory for `ty`. Flash saves are always
/// chip-erased first; SRAM is simply overwritten.
pub fn write_save(
    port: &mut dyn LinkPort,
    ty: AgbSaveType,
    data: &[u8],
    mut chunk_done: impl FnMut(u32, u32),
) -> Result<()> {
    let len = ty.byte_len() as usize;
    if data.len() < len {
        return Err(Error::Catalog(format!(
            "save image is {} bytes, {} needs {len}",
            data.len(),
            ty.describe()
        )));
    }
    let data = &data[..len];
    match ty {
        AgbSaveType::None => {}
        AgbSaveType::Eeprom512 => port.agb_eeprom_write(EepromSize::E512, data)?,
        AgbSaveType::Eeprom8K => port.agb_eeprom_write(EepromSize::E8K, data)?,
        AgbSaveType::Sram32K => {
            for (i, &b) in data.iter().enumerate() {
                port.agb_save_write(i as u32, b)?;
                if (i + 1) % CHUNK == 0 {
                    chunk_done((i + 1) as u32, len as u32);
                }
            }
        }
        AgbSaveType::Flash64K | AgbSaveType::Flash128K => {
            let banked = ty == AgbSaveType::Flash128K;
            if banked {
                flash_switch_bank(port, 0)?;
            }
            flash_cmd(port, 0x80)?;
            flash_cmd(port, 0x10)?;
            flash_wait_blank(port, 0)?;

            for (i, &b) in data.iter().enumerate() {
                let pos = i as u32;
                if banked && pos % FLASH_BANK == 0 {
                    flash_switch_bank(port, (pos / FLASH_BANK) as u8)?;
                }
                let addr = pos % FLASH_BANK;
                flash_cmd(port, 0xA0)?;
                port.agb_save_write(addr, b)?;
                // Data poll; these parts settle in a few microseconds
                let mut rb = [0u8; 1];
                let mut ok = false;
                for _ in 0..FLASH_BYTE_POLL {
                    port.agb_save_read(addr, &mut rb)?;
                    if rb[0] == b {
                        ok = true;
                        break;
                    }
                }
                if !ok {
                    return Err(Error::ProgramTimeout {
                        addr: pos,
                        last_status: rb[0] as u16,
                    });
                }
                if (i + 1) % CHUNK == 0 {
                    chunk_done((i + 1) as u32, len as u32);
                }
            }
            if banked {
                flash_switch_bank(port, 0)?;
            }
        }
    }
    Ok(())
}
