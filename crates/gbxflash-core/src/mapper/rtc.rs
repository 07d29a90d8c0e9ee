//! Cartridge real-time clocks
//!
//! Three controller families carry a battery-backed clock, each with its
//! own register protocol. `RtcSnapshot` is the controller-neutral value;
//! the per-controller read/write functions live here and are called
//! through `Mapper`.

use crate::error::Result;
use crate::link::LinkPort;

/// MBC3-style day counter width: 9 bits, wraps at 512
pub const DAY_COUNTER_WRAP: u64 = 512;

/// Controller-neutral clock value paired with the wall-clock moment it was
/// captured. Save files store the snapshot; restoring rolls it forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcSnapshot {
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    /// Day counter, 0..=511
    pub days: u16,
    pub halted: bool,
    pub day_carry: bool,
    /// Unix timestamp at capture
    pub captured_at: u64,
}

impl RtcSnapshot {
    pub fn total_seconds(&self) -> u64 {
        self.seconds as u64
            + self.minutes as u64 * 60
            + self.hours as u64 * 3600
            + self.days as u64 * 86400
    }

    /// Roll the clock forward to `now_unix`. A halted clock does not move.
    /// If the day counter wraps during the advance the pending carry flag
    /// is cleared; the wrap has been accounted for in the new day value.
    pub fn advanced_to(&self, now_unix: u64) -> RtcSnapshot {
        if self.halted || now_unix <= self.captured_at {
            return RtcSnapshot {
                captured_at: now_unix,
                ..*self
            };
        }
        let total = self.total_seconds() + (now_unix - self.captured_at);
        let day_total = total / 86400;
        let wraps = day_total / DAY_COUNTER_WRAP;
        RtcSnapshot {
            seconds: (total % 60) as u8,
            minutes: (total / 60 % 60) as u8,
            hours: (total / 3600 % 24) as u8,
            days: (day_total % DAY_COUNTER_WRAP) as u16,
            halted: false,
            day_carry: if wraps > 0 { false } else { self.day_carry },
            captured_at: now_unix,
        }
    }

    /// Decode the five MBC3 registers (0x08..=0x0C)
    pub fn from_mbc3_regs(regs: [u8; 5], captured_at: u64) -> Self {
        RtcSnapshot {
            seconds: regs[0] & 0x3F,
            minutes: regs[1] & 0x3F,
            hours: regs[2] & 0x1F,
            days: regs[3] as u16 | ((regs[4] as u16 & 0x01) << 8),
            halted: regs[4] & 0x40 != 0,
            day_carry: regs[4] & 0x80 != 0,
            captured_at,
        }
    }

    pub fn to_mbc3_regs(&self) -> [u8; 5] {
        let mut hi = (self.days >> 8) as u8 & 0x01;
        if self.halted {
            hi |= 0x40;
        }
        if self.day_carry {
            hi |= 0x80;
        }
        [self.seconds, self.minutes, self.hours, self.days as u8, hi]
    }
}

// ---------------------------------------------------------------------------
// MBC3
// ---------------------------------------------------------------------------

/// Latch and read the MBC3 clock registers
pub fn read_mbc3(port: &mut dyn LinkPort, now_unix: u64) -> Result<RtcSnapshot> {
    port.dmg_write(0x0000, 0x0A)?;
    // Latch on the 0 -> 1 edge
    port.dmg_write(0x6000, 0x00)?;
    port.dmg_write(0x6000, 0x01)?;
    let mut regs = [0u8; 5];
    for (i, reg) in (0x08..=0x0C).enumerate() {
        port.dmg_write(0x4000, reg)?;
        let mut b = [0u8; 1];
        port.dmg_read(0xA000, &mut b)?;
        regs[i] = b[0];
    }
    port.dmg_write(0x0000, 0x00)?;
    Ok(RtcSnapshot::from_mbc3_regs(regs, now_unix))
}

/// Write the MBC3 clock. The counter is halted while the time registers
/// load, then the real halt/carry flags go in last.
pub fn write_mbc3(port: &mut dyn LinkPort, snap: &RtcSnapshot) -> Result<()> {
    let regs = snap.to_mbc3_regs();
    port.dmg_write(0x0000, 0x0A)?;
    port.dmg_write(0x4000, 0x0C)?;
    port.dmg_write(0xA000, regs[4] | 0x40)?;
    for (i, reg) in (0x08..=0x0B).enumerate() {
        port.dmg_write(0x4000, reg)?;
        port.dmg_write(0xA000, regs[i])?;
    }
    port.dmg_write(0x4000, 0x0C)?;
    port.dmg_write(0xA000, regs[4])?;
    port.dmg_write(0x0000, 0x00)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// HuC-3
// ---------------------------------------------------------------------------
//
// The HuC-3 clock is driven through a nibble command port at 0xA000,
// selected by the mode register at 0x0000: 0x0B loads a command, 0x0D
// executes it (poll bit 0 for completion), 0x0C exposes the result.
// Commands: 0x1n read-and-increment, 0x3n write-and-increment, 0x4n/0x5n
// set address low/high nibble, 0x6n execute (0x60 latch, 0x61 set clock).
// Time is minute-of-day (3 nibbles) followed by day counter (3 nibbles).

fn huc3_cmd(port: &mut dyn LinkPort, cmd: u8) -> Result<u8> {
    port.dmg_write(0x0000, 0x0B)?;
    port.dmg_write(0xA000, cmd)?;
    port.dmg_write(0x0000, 0x0D)?;
    let mut b = [0u8; 1];
    for _ in 0..16 {
        port.dmg_read(0xA000, &mut b)?;
        if b[0] & 0x01 != 0 {
            break;
        }
        port.delay_ms(1);
    }
    port.dmg_write(0x0000, 0x0C)?;
    port.dmg_read(0xA000, &mut b)?;
    Ok(b[0] & 0x0F)
}

fn huc3_set_addr(port: &mut dyn LinkPort, addr: u8) -> Result<()> {
    huc3_cmd(port, 0x40 | (addr & 0x0F))?;
    huc3_cmd(port, 0x50 | (addr >> 4))?;
    Ok(())
}

pub fn read_huc3(port: &mut dyn LinkPort, now_unix: u64) -> Result<RtcSnapshot> {
    huc3_cmd(port, 0x60)?; // latch
    huc3_set_addr(port, 0x00)?;
    let mut nibbles = [0u8; 6];
    for n in nibbles.iter_mut() {
        *n = huc3_cmd(port, 0x10)?;
    }
    port.dmg_write(0x0000, 0x0A)?;
    let minute_of_day =
        nibbles[0] as u16 | (nibbles[1] as u16) << 4 | (nibbles[2] as u16) << 8;
    let days = nibbles[3] as u16 | (nibbles[4] as u16) << 4 | (nibbles[5] as u16) << 8;
    Ok(RtcSnapshot {
        seconds: 0,
        minutes: (minute_of_day % 60) as u8,
        hours: (minute_of_day / 60).min(23) as u8,
        days: days & 0x1FF,
        halted: false,
        day_carry: false,
        captured_at: now_unix,
    })
}

pub fn write_huc3(port: &mut dyn LinkPort, snap: &RtcSnapshot) -> Result<()> {
    let minute_of_day = snap.minutes as u16 + snap.hours as u16 * 60;
    let nibbles = [
        (minute_of_day & 0x0F) as u8,
        (minute_of_day >> 4 & 0x0F) as u8,
        (minute_of_day >> 8 & 0x0F) as u8,
        (snap.days & 0x0F) as u8,
        (snap.days >> 4 & 0x0F) as u8,
        (snap.days >> 8 & 0x0F) as u8,
    ];
    huc3_set_addr(port, 0x00)?;
    for n in nibbles {
        huc3_cmd(port, 0x30 | n)?;
    }
    huc3_cmd(port, 0x61)?; // copy into the running clock
    port.dmg_write(0x0000, 0x0A)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// TAMA5
// ---------------------------------------------------------------------------
//
// All TAMA5 access goes through two ports: 0xA001 selects a register,
// 0xA000 carries its nibble value. Registers 4/5 are data in (lo/hi),
// 6/7 are command + address (writing 7 triggers), 0x0C/0x0D data out.
// Clock bytes live in the chip's storage page and are BCD.

const TAMA5_SEL: u16 = 0xA001;
const TAMA5_VAL: u16 = 0xA000;

pub(super) fn tama5_reg_write(port: &mut dyn LinkPort, reg: u8, val: u8) -> Result<()> {
    port.dmg_write(TAMA5_SEL, reg)?;
    port.dmg_write(TAMA5_VAL, val & 0x0F)?;
    Ok(())
}

fn tama5_reg_read(port: &mut dyn LinkPort, reg: u8) -> Result<u8> {
    port.dmg_write(TAMA5_SEL, reg)?;
    let mut b = [0u8; 1];
    port.dmg_read(TAMA5_VAL, &mut b)?;
    Ok(b[0] & 0x0F)
}

/// Wake the controller; it answers 0xF1 on the value port when ready
pub(super) fn tama5_enable(port: &mut dyn LinkPort) -> Result<()> {
    port.dmg_write(TAMA5_SEL, 0x0A)?;
    let mut b = [0u8; 1];
    for _ in 0..32 {
        port.dmg_read(TAMA5_VAL, &mut b)?;
        if b[0] == 0xF1 {
            return Ok(());
        }
        port.delay_ms(1);
    }
    log::warn!("TAMA5 did not acknowledge wake, continuing anyway");
    Ok(())
}

fn tama5_ram_read(port: &mut dyn LinkPort, addr: u8) -> Result<u8> {
    tama5_reg_write(port, 0x06, (addr >> 4) | 0x02)?;
    tama5_reg_write(port, 0x07, addr & 0x0F)?;
    let lo = tama5_reg_read(port, 0x0C)?;
    let hi = tama5_reg_read(port, 0x0D)?;
    Ok(hi << 4 | lo)
}

fn tama5_ram_write(port: &mut dyn LinkPort, addr: u8, val: u8) -> Result<()> {
    tama5_reg_write(port, 0x04, val & 0x0F)?;
    tama5_reg_write(port, 0x05, val >> 4)?;
    tama5_reg_write(port, 0x06, addr >> 4)?;
    tama5_reg_write(port, 0x07, addr & 0x0F)?;
    Ok(())
}

fn bcd_decode(b: u8) -> u8 {
    (b >> 4) * 10 + (b & 0x0F)
}

fn bcd_encode(v: u8) -> u8 {
    (v / 10) << 4 | (v % 10)
}

/// Clock bytes at the start of the storage page: BCD seconds, minutes,
/// hours, then a binary little-endian day counter.
pub fn read_tama5(port: &mut dyn LinkPort, now_unix: u64) -> Result<RtcSnapshot> {
    tama5_enable(port)?;
    let sec = bcd_decode(tama5_ram_read(port, 0x00)?);
    let min = bcd_decode(tama5_ram_read(port, 0x01)?);
    let hour = bcd_decode(tama5_ram_read(port, 0x02)?);
    let day_lo = tama5_ram_read(port, 0x03)?;
    let day_hi = tama5_ram_read(port, 0x04)?;
    Ok(RtcSnapshot {
        seconds: sec.min(59),
        minutes: min.min(59),
        hours: hour.min(23),
        days: (day_lo as u16 | (day_hi as u16) << 8) & 0x1FF,
        halted: false,
        day_carry: false,
        captured_at: now_unix,
    })
}

pub fn write_tama5(port: &mut dyn LinkPort, snap: &RtcSnapshot) -> Result<()> {
    tama5_enable(port)?;
    tama5_ram_write(port, 0x00, bcd_encode(snap.seconds))?;
    tama5_ram_write(port, 0x01, bcd_encode(snap.minutes))?;
    tama5_ram_write(port, 0x02, bcd_encode(snap.hours))?;
    tama5_ram_write(port, 0x03, snap.days as u8)?;
    tama5_ram_write(port, 0x04, (snap.days >> 8) as u8)?;
    Ok(())
}

/// TAMA5 storage page size in bytes
pub const TAMA5_RAM_LEN: usize = 0x20;

/// Dump the whole TAMA5 storage page, clock bytes included
pub fn tama5_ram_dump(port: &mut dyn LinkPort) -> Result<Vec<u8>> {
    tama5_enable(port)?;
    let mut out = Vec::with_capacity(TAMA5_RAM_LEN);
    for addr in 0..TAMA5_RAM_LEN as u8 {
        out.push(tama5_ram_read(port, addr)?);
    }
    Ok(out)
}

pub fn tama5_ram_load(port: &mut dyn LinkPort, data: &[u8]) -> Result<()> {
    tama5_enable(port)?;
    for (addr, &b) in data.iter().take(TAMA5_RAM_LEN).enumerate() {
        tama5_ram_write(port, addr as u8, b)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptPort;

    fn base_snap() -> RtcSnapshot {
        RtcSnapshot {
            seconds: 0,
            minutes: 0,
            hours: 0,
            days: 0,
            halted: false,
            day_carry: false,
            captured_at: 1_000_000,
        }
    }

    #[test]
    fn advance_rolls_time_fields_with_overflow() {
        let snap = RtcSnapshot {
            seconds: 50,
            minutes: 59,
            hours: 23,
            ..base_snap()
        };
        let next = snap.advanced_to(1_000_000 + 20);
        assert_eq!(next.seconds, 10);
        assert_eq!(next.minutes, 0);
        assert_eq!(next.hours, 0);
        assert_eq!(next.days, 1);
    }

    #[test]
    fn day_wrap_consumes_pending_carry() {
        let snap = RtcSnapshot {
            days: 511,
            day_carry: true,
            ..base_snap()
        };
        let next = snap.advanced_to(1_000_000 + 2 * 86400);
        assert_eq!(next.days, 1);
        assert!(!next.day_carry);
    }

    #[test]
    fn carry_survives_when_no_wrap_happens() {
        let snap = RtcSnapshot {
            days: 10,
            day_carry: true,
            ..base_snap()
        };
        let next = snap.advanced_to(1_000_000 + 3600);
        assert_eq!(next.days, 10);
        assert!(next.day_carry);
    }

    #[test]
    fn halted_clock_does_not_move() {
        let snap = RtcSnapshot {
            minutes: 5,
            halted: true,
            ..base_snap()
        };
        let next = snap.advanced_to(1_000_000 + 86400);
        assert_eq!(next.minutes, 5);
        assert_eq!(next.days, 0);
        assert!(next.halted);
    }

    #[test]
    fn mbc3_regs_round_trip() {
        let snap = RtcSnapshot {
            seconds: 12,
            minutes: 34,
            hours: 21,
            days: 300,
            halted: true,
            day_carry: true,
            captured_at: 7,
        };
        let back = RtcSnapshot::from_mbc3_regs(snap.to_mbc3_regs(), 7);
        assert_eq!(back, snap);
    }

    #[test]
    fn mbc3_read_follows_latch_protocol() {
        let mut port = ScriptPort::new();
        // sec, min, hour, day lo, day hi (bit 8 set, carry set)
        port.dmg_reads.extend([10, 30, 5, 0x2C, 0x81]);

        let snap = read_mbc3(&mut port, 99).unwrap();
        assert_eq!(snap.seconds, 10);
        assert_eq!(snap.days, 0x12C);
        assert!(snap.day_carry);

        // Latch edge before any register select
        let latch = port
            .writes
            .iter()
            .filter(|(a, _)| *a == 0x6000)
            .map(|(_, v)| *v)
            .collect::<Vec<_>>();
        assert_eq!(latch, vec![0x00, 0x01]);
        // Register selects in order
        let selects = port
            .writes
            .iter()
            .filter(|(a, _)| *a == 0x4000)
            .map(|(_, v)| *v)
            .collect::<Vec<_>>();
        assert_eq!(selects, vec![0x08, 0x09, 0x0A, 0x0B, 0x0C]);
    }
}
