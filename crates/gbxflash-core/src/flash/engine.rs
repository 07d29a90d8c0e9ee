//! Flash algorithm engine
//!
//! Drives the erase/program/verify protocol described by a catalog entry's
//! command table. The engine only ever sees flat chip offsets through a
//! `FlashBus`; on DMG carts the orchestrator's bus adapter does the bank
//! arithmetic before anything reaches the wire.

use std::time::{Duration, Instant};

use crate::cart::{AddrToken, CartType, CommandSet, CommandStep, DataToken, WaitStep};
use crate::cfi::{self, CfiInfo, CFI_BUFFER_LEN};
use crate::error::{Error, Result};
use crate::flash::sector_map::Sector;
use crate::flash::SECTOR_RETRIES;

/// Fallbacks used until CFI timing is known
const DEFAULT_SECTOR_ERASE_MS: u64 = 10_000;
const DEFAULT_CHIP_ERASE_MS: u64 = 240_000;
const PROGRAM_POLL_MS: u64 = 500;
const BESPOKE_SETTLE_MS: u32 = 1;

/// Word-oriented view of the flash chip. Implementations translate flat
/// chip offsets into bus traffic (AGB pass-through, DMG bank windows).
///
/// Command cycles and data cycles are separate calls: on DMG carts the
/// unlock addresses (0x555/0x2AAA/0x5555) are raw bus addresses that may
/// need bank 1 in the switchable window, while data cycles address a flash
/// cell and go through whatever bank holds it.
pub trait FlashBus {
    /// Bytes per bus word: 1 on DMG, 2 on AGB
    fn width(&self) -> u8;

    /// Flash command cycle at a command-space address (unlock cycles and
    /// other fixed addresses from the command table)
    fn command(&mut self, addr: u32, data: u16) -> Result<()>;

    /// Command cycle addressed at a flash cell (sector or program
    /// address); DMG adapters route these through the cell's bank
    fn cell_command(&mut self, addr: u32, data: u16) -> Result<()> {
        self.command(addr, data)
    }

    /// Data cycle programming the word at flat chip offset `addr`
    fn program(&mut self, addr: u32, data: u16) -> Result<()>;

    /// Plain read of `buf.len()` bytes starting at a flat chip offset
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    fn delay_ms(&mut self, ms: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramStrategy {
    /// One command sequence per word
    Single,
    /// Vendor buffered writes of `buffer_size` bytes
    Buffered,
    /// Vendor sequences (Datel, movie-player clones) that answer array
    /// data instead of toggle/status bits while programming
    Bespoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Unlocked,
    ChipErasing,
    SectorErasing,
    Programming,
    Verifying,
}

fn resolve_addr(tok: AddrToken, die_base: u32, sa: u32, pa: u32) -> u32 {
    match tok {
        AddrToken::Fixed(a) => die_base + a,
        AddrToken::SectorAddr => sa,
        AddrToken::ProgramAddr => pa,
    }
}

fn resolve_data(tok: DataToken, pd: u16, bc: u16) -> u16 {
    match tok {
        DataToken::Fixed(d) => d,
        DataToken::ProgramData => pd,
        DataToken::BufferCount => bc,
    }
}

fn exec<B: FlashBus>(
    bus: &mut B,
    steps: &[CommandStep],
    die_base: u32,
    sa: u32,
    pa: u32,
    pd: u16,
    bc: u16,
) -> Result<()> {
    for s in steps {
        let addr = resolve_addr(s.addr, die_base, sa, pa);
        let val = resolve_data(s.data, pd, bc);
        if s.data == DataToken::ProgramData {
            bus.program(addr, val)?;
        } else if matches!(s.addr, AddrToken::Fixed(_)) {
            bus.command(addr, val)?;
        } else {
            bus.cell_command(addr, val)?;
        }
    }
    Ok(())
}

fn read_word<B: FlashBus>(bus: &mut B, addr: u32) -> Result<u16> {
    let w = bus.width() as usize;
    let mut buf = [0u8; 2];
    bus.read(addr, &mut buf[..w])?;
    Ok(if w == 2 {
        u16::from_le_bytes(buf)
    } else {
        buf[0] as u16
    })
}

#[derive(Debug, Clone, Copy)]
enum PollKind {
    Erase,
    Program,
}

pub struct FlashEngine<'a, B: FlashBus> {
    bus: &'a mut B,
    cart: &'a CartType,
    state: State,
    sector_erase_ms: u64,
    chip_erase_ms: u64,
}

impl<'a, B: FlashBus> FlashEngine<'a, B> {
    pub fn new(bus: &'a mut B, cart: &'a CartType) -> Self {
        FlashEngine {
            bus,
            cart,
            state: State::Idle,
            sector_erase_ms: DEFAULT_SECTOR_ERASE_MS,
            chip_erase_ms: DEFAULT_CHIP_ERASE_MS,
        }
    }

    pub fn strategy(&self) -> ProgramStrategy {
        match self.cart.command_set {
            CommandSet::Datel | CommandSet::MoviePlayer => ProgramStrategy::Bespoke,
            _ if self.cart.commands.buffer_write.is_empty() => ProgramStrategy::Single,
            _ => ProgramStrategy::Buffered,
        }
    }

    /// Tighten the poll budgets from the chip's own CFI timing. A zero
    /// timing field means the table does not declare it; keep the default.
    pub fn apply_cfi_timing(&mut self, info: &CfiInfo) {
        let sector_ms = info.max_sector_erase_ms() as u64;
        if sector_ms > 0 {
            self.sector_erase_ms = sector_ms.max(500);
        }
        let chip_ms = info.max_chip_erase_ms() as u64;
        if chip_ms > 0 {
            self.chip_erase_ms = chip_ms.max(1_000);
        }
    }

    fn set_state(&mut self, next: State) {
        if self.state != next {
            log::trace!("flash engine: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn blank_word(&self) -> u16 {
        if self.bus.width() == 2 {
            0xFFFF
        } else {
            0x00FF
        }
    }

    /// Commands of a double-die chip mirror at the upper die
    fn die_base(&self, offset: u32) -> u32 {
        let half = self.cart.chip_size / 2;
        if self.cart.double_die && offset >= half {
            half
        } else {
            0
        }
    }

    pub fn unlock(&mut self) -> Result<()> {
        exec(self.bus, &self.cart.commands.unlock, 0, 0, 0, 0, 0)?;
        for &addr in &self.cart.commands.unlock_reads {
            let mut dummy = [0u8; 2];
            let w = self.bus.width() as usize;
            self.bus.read(addr, &mut dummy[..w])?;
        }
        self.set_state(State::Unlocked);
        Ok(())
    }

    /// Return the chip to array-read mode
    pub fn reset(&mut self) -> Result<()> {
        if self.cart.commands.reset.is_empty() {
            if self.cart.command_set != CommandSet::None {
                self.bus.command(0, 0xF0)?;
            }
        } else {
            exec(self.bus, &self.cart.commands.reset, 0, 0, 0, 0, 0)?;
        }
        self.set_state(State::Idle);
        Ok(())
    }

    /// Autoselect identifier bytes. A mismatch against the catalog's known
    /// IDs is logged, not fatal; bootleg chips lie about their identity.
    pub fn read_identifier(&mut self) -> Result<Vec<u8>> {
        let len = self
            .cart
            .flash_ids
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(4)
            .max(2);
        exec(self.bus, &self.cart.commands.read_identifier, 0, 0, 0, 0, 0)?;
        let mut id = vec![0u8; len];
        self.bus.read(0, &mut id)?;
        self.reset()?;

        if !self.cart.flash_ids.is_empty()
            && !self.cart.flash_ids.iter().any(|k| id.starts_with(k))
        {
            log::warn!(
                "flash id {:02X?} does not match any known id for {}",
                id,
                self.cart.name()
            );
        }
        Ok(id)
    }

    /// Enter CFI query mode and parse the table
    pub fn read_cfi(&mut self) -> Result<CfiInfo> {
        if self.cart.commands.read_cfi.is_empty() {
            exec_default_cfi(self.bus)?;
        } else {
            exec(self.bus, &self.cart.commands.read_cfi, 0, 0, 0, 0, 0)?;
        }

        let mut buf = vec![0u8; CFI_BUFFER_LEN];
        if self.bus.width() == 2 {
            self.bus.read(0, &mut buf)?;
        } else {
            // x8 chip: one CFI byte per address; widen to the x16 layout
            // the parser expects
            let mut narrow = vec![0u8; CFI_BUFFER_LEN / 2];
            self.bus.read(0, &mut narrow)?;
            for (i, b) in narrow.into_iter().enumerate() {
                buf[i * 2] = b;
            }
        }
        let parsed = cfi::parse(&buf);
        self.reset()?;
        parsed.map_err(Error::Cfi)
    }

    fn poll(
        &mut self,
        waits: &[WaitStep],
        die_base: u32,
        sa: u32,
        pa: u32,
        expected: u16,
        timeout_ms: u64,
        kind: PollKind,
        mut tick: Option<&mut dyn FnMut(u64)>,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(timeout_ms);
        let (addr, want, mask, cell) = match waits.first() {
            Some(w) => (
                resolve_addr(w.addr, die_base, sa, pa),
                w.value,
                w.mask,
                !matches!(w.addr, AddrToken::Fixed(_)),
            ),
            None => match kind {
                PollKind::Erase => (sa, self.blank_word(), 0xFFFF, true),
                PollKind::Program => (pa, expected, 0xFFFF, true),
            },
        };

        let intel = matches!(self.cart.command_set, CommandSet::Intel | CommandSet::Sharp);
        let mut last;
        loop {
            if intel {
                if self.cart.commands.read_status.is_empty() {
                    if cell {
                        self.bus.cell_command(addr, 0x70)?;
                    } else {
                        self.bus.command(addr, 0x70)?;
                    }
                } else {
                    exec(self.bus, &self.cart.commands.read_status, die_base, sa, pa, 0, 0)?;
                }
                last = read_word(self.bus, addr)?;
                if last & 0x80 != 0 {
                    if last & 0x3A != 0 {
                        log::warn!("status register error bits set: {last:#06x}");
                    }
                    // Clear status, back to array mode
                    if cell {
                        self.bus.cell_command(addr, 0x50)?;
                        self.bus.cell_command(addr, 0xFF)?;
                    } else {
                        self.bus.command(addr, 0x50)?;
                        self.bus.command(addr, 0xFF)?;
                    }
                    return Ok(());
                }
            } else {
                last = read_word(self.bus, addr)?;
                if last & mask == want & mask {
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(match kind {
                    PollKind::Erase => Error::EraseTimeout {
                        addr: sa,
                        last_status: last,
                    },
                    PollKind::Program => Error::ProgramTimeout {
                        addr: pa,
                        last_status: last,
                    },
                });
            }
            if let Some(t) = tick.as_deref_mut() {
                t(started.elapsed().as_millis() as u64);
            }
            self.bus.delay_ms(1);
        }
    }

    /// Whole-chip erase; `tick` fires once per poll with elapsed ms since
    /// nothing finer exists to report
    pub fn chip_erase(&mut self, tick: &mut dyn FnMut(u64)) -> Result<()> {
        if self.cart.commands.chip_erase.is_empty() {
            return Err(Error::Catalog(format!(
                "{} has no chip erase sequence",
                self.cart.name()
            )));
        }
        self.unlock()?;
        self.set_state(State::ChipErasing);
        exec(self.bus, &self.cart.commands.chip_erase, 0, 0, 0, 0, 0)?;
        let waits = self.cart.commands.chip_erase_wait.clone();
        let budget = self.chip_erase_ms;
        self.poll(&waits, 0, 0, 0, self.blank_word(), budget, PollKind::Erase, Some(tick))?;
        self.reset()
    }

    pub fn erase_sector(&mut self, sector: Sector) -> Result<()> {
        let die = self.die_base(sector.base);
        self.unlock()?;
        self.set_state(State::SectorErasing);
        exec(
            self.bus,
            &self.cart.commands.sector_erase,
            die,
            sector.base,
            0,
            0,
            0,
        )?;
        let waits = self.cart.commands.sector_erase_wait.clone();
        let budget = self.sector_erase_ms;
        self.poll(
            &waits,
            die,
            sector.base,
            0,
            self.blank_word(),
            budget,
            PollKind::Erase,
            None,
        )?;
        self.set_state(State::Unlocked);
        Ok(())
    }

    fn word_at(&self, data: &[u8], i: usize) -> u16 {
        if self.bus.width() == 2 {
            u16::from_le_bytes([data[i], *data.get(i + 1).unwrap_or(&0xFF)])
        } else {
            data[i] as u16
        }
    }

    /// Program `data` at chip offset `offset`. Freshly erased all-0xFF
    /// stretches are skipped when `skip_blank` is set. Returns bytes
    /// actually pushed over the bus.
    pub fn program(&mut self, offset: u32, data: &[u8], skip_blank: bool) -> Result<u32> {
        self.set_state(State::Programming);
        let written = match self.strategy() {
            ProgramStrategy::Single => self.program_single(offset, data, skip_blank)?,
            ProgramStrategy::Buffered => self.program_buffered(offset, data, skip_blank)?,
            ProgramStrategy::Bespoke => self.program_bespoke(offset, data, skip_blank)?,
        };
        self.set_state(State::Unlocked);
        Ok(written)
    }

    fn program_single(&mut self, offset: u32, data: &[u8], skip_blank: bool) -> Result<u32> {
        let width = self.bus.width() as usize;
        let blank = self.blank_word();
        let steps = self.cart.commands.single_write.clone();
        let mut written = 0u32;
        for i in (0..data.len()).step_by(width) {
            let pd = self.word_at(data, i);
            if skip_blank && pd == blank {
                continue;
            }
            let pa = offset + i as u32;
            let die = self.die_base(pa);
            exec(self.bus, &steps, die, 0, pa, pd, 0)?;
            self.poll(&[], die, pa, pa, pd, PROGRAM_POLL_MS, PollKind::Program, None)?;
            written += width as u32;
        }
        Ok(written)
    }

    /// Datel and movie-player clones never expose toggle or status bits;
    /// the array comes back as soon as the cell is done. Each word gets a
    /// settle delay and is then read back until it matches.
    fn program_bespoke(&mut self, offset: u32, data: &[u8], skip_blank: bool) -> Result<u32> {
        let width = self.bus.width() as usize;
        let blank = self.blank_word();
        let steps = self.cart.commands.single_write.clone();
        let mut written = 0u32;
        for i in (0..data.len()).step_by(width) {
            let pd = self.word_at(data, i);
            if skip_blank && pd == blank {
                continue;
            }
            let pa = offset + i as u32;
            let die = self.die_base(pa);
            exec(self.bus, &steps, die, 0, pa, pd, 0)?;
            self.bus.delay_ms(BESPOKE_SETTLE_MS);
            let deadline = Instant::now() + Duration::from_millis(PROGRAM_POLL_MS);
            loop {
                let got = read_word(self.bus, pa)?;
                if got == pd {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(Error::ProgramTimeout {
                        addr: pa,
                        last_status: got,
                    });
                }
                self.bus.delay_ms(1);
            }
            written += width as u32;
        }
        Ok(written)
    }

    fn program_buffered(&mut self, offset: u32, data: &[u8], skip_blank: bool) -> Result<u32> {
        let width = self.bus.width() as usize;
        let buf_len = self.cart.buffer_size as usize;
        let steps = self.cart.commands.buffer_write.clone();
        let waits = self.cart.commands.buffer_write_wait.clone();
        // The PA/PD step is the template for the data burst
        let data_pos = steps
            .iter()
            .position(|s| {
                s.addr == AddrToken::ProgramAddr && s.data == DataToken::ProgramData
            })
            .ok_or_else(|| {
                Error::Catalog(format!(
                    "{}: buffer_write has no PA/PD step",
                    self.cart.name()
                ))
            })?;

        let mut written = 0u32;
        for (chunk_i, chunk) in data.chunks(buf_len).enumerate() {
            if skip_blank && chunk.iter().all(|&b| b == 0xFF) {
                continue;
            }
            let base = offset + (chunk_i * buf_len) as u32;
            let die = self.die_base(base);
            let sa = base; // buffered command addressing is sector-relative
            let words = chunk.len() / width;
            let bc = (words as u16).saturating_sub(1);

            exec(self.bus, &steps[..data_pos], die, sa, base, 0, bc)?;
            let mut last_pa = base;
            let mut last_pd = self.blank_word();
            for w in 0..words {
                let i = w * width;
                last_pa = base + i as u32;
                last_pd = self.word_at(chunk, i);
                self.bus.program(last_pa, last_pd)?;
            }
            exec(self.bus, &steps[data_pos + 1..], die, sa, last_pa, last_pd, bc)?;
            self.poll(
                &waits,
                die,
                last_pa,
                last_pa,
                last_pd,
                PROGRAM_POLL_MS,
                PollKind::Program,
                None,
            )?;
            written += chunk.len() as u32;
        }
        Ok(written)
    }

    /// Byte-exact readback compare; reports the first mismatch
    pub fn verify(&mut self, offset: u32, expected: &[u8]) -> Result<()> {
        self.set_state(State::Verifying);
        let mut buf = vec![0u8; 0x800];
        let mut pos = 0usize;
        while pos < expected.len() {
            let n = buf.len().min(expected.len() - pos);
            self.bus.read(offset + pos as u32, &mut buf[..n])?;
            for i in 0..n {
                if buf[i] != expected[pos + i] {
                    return Err(Error::VerifyMismatch {
                        offset: offset + (pos + i) as u32,
                        expected: expected[pos + i],
                        found: buf[i],
                    });
                }
            }
            pos += n;
        }
        self.set_state(State::Unlocked);
        Ok(())
    }

    /// Erase, program and optionally verify one sector, retrying the whole
    /// sector on transient failures. Returns whether the data was verified
    /// (device-reported success alone is not).
    pub fn program_sector(&mut self, sector: Sector, data: &[u8], verify: bool) -> Result<bool> {
        let blank = data.iter().all(|&b| b == 0xFF);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.try_sector(sector, data, blank, verify);
            match outcome {
                Ok(verified) => return Ok(verified),
                Err(e) if attempt < SECTOR_RETRIES && !matches!(e, Error::Communication(_)) => {
                    log::warn!(
                        "sector {:#x} attempt {attempt} failed ({e}); rewinding to sector start",
                        sector.base
                    );
                    self.reset()?;
                }
                Err(Error::VerifyMismatch { offset, .. }) => {
                    return Err(Error::WriteRetriesExhausted {
                        addr: offset,
                        attempts: attempt,
                        reason: "verify kept failing".into(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_sector(&mut self, sector: Sector, data: &[u8], blank: bool, verify: bool) -> Result<bool> {
        self.erase_sector(sector)?;
        if !blank {
            self.program(sector.base, data, true)?;
        }
        if verify {
            self.verify(sector.base, data)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// JEDEC standard CFI entry: 0x98 at word address 0x55
fn exec_default_cfi<B: FlashBus>(bus: &mut B) -> Result<()> {
    let addr = if bus.width() == 2 { 0xAA } else { 0x55 };
    bus.command(addr, 0x98)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::Catalog;
    use crate::flash::sector_map::SectorMap;
    use crate::testutil::MockNorChip;

    /// AGB-style pass-through bus over the mock chip
    struct MockBus {
        chip: MockNorChip,
    }

    impl FlashBus for MockBus {
        fn width(&self) -> u8 {
            2
        }

        fn command(&mut self, addr: u32, data: u16) -> Result<()> {
            self.chip.command(addr, data);
            Ok(())
        }

        fn program(&mut self, addr: u32, data: u16) -> Result<()> {
            self.chip.command(addr, data);
            Ok(())
        }

        fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
            self.chip.read(addr, buf);
            Ok(())
        }

        fn delay_ms(&mut self, _ms: u32) {}
    }

    fn amd_cart(chip_size: u32, buffered: bool) -> crate::cart::CartType {
        let bufwrite = if buffered {
            r#", "buffer_write": [["SA", "0x25"], ["SA", "BC"], ["PA", "PD"], ["SA", "0x29"]]"#
        } else {
            ""
        };
        let json = format!(
            r#"[{{
            "names": ["mock amd"],
            "platform": "AGB",
            "command_set": "AMD",
            "flash_ids": [[1, 126]],
            "chip_size": {chip_size},
            "sector_size": 65536,
            "buffer_size": 256,
            "commands": {{
                "reset": [["0", "0xF0"]],
                "read_identifier": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0x90"]],
                "read_cfi": [["0xAA", "0x98"]],
                "chip_erase": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0x80"],
                               ["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0x10"]],
                "sector_erase": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0x80"],
                                 ["0xAAA", "0xAA"], ["0x555", "0x55"], ["SA", "0x30"]],
                "single_write": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0xA0"], ["PA", "PD"]]{bufwrite}
            }}
        }}]"#
        );
        Catalog::load_json(&json).unwrap().entries()[0].clone()
    }

    #[test]
    fn sector_erase_blanks_exactly_one_sector() {
        let cart = amd_cart(0x20000, false);
        let mut bus = MockBus {
            chip: MockNorChip::new(0x20000, 0x10000),
        };
        bus.chip.fill(0x00);
        let map = SectorMap::uniform(0x10000, 0x20000);

        let mut engine = FlashEngine::new(&mut bus, &cart);
        engine.erase_sector(map.sectors()[1]).unwrap();

        assert_eq!(bus.chip.erases, vec![0x10000]);
        assert!(bus.chip.mem[0x10000..].iter().all(|&b| b == 0xFF));
        assert!(bus.chip.mem[..0x10000].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn single_write_programs_and_verifies() {
        let cart = amd_cart(0x20000, false);
        let mut bus = MockBus {
            chip: MockNorChip::new(0x20000, 0x10000),
        };
        let map = SectorMap::uniform(0x10000, 0x20000);
        let data: Vec<u8> = (0..0x10000u32).map(|i| (i % 251) as u8).collect();

        let mut engine = FlashEngine::new(&mut bus, &cart);
        let verified = engine
            .program_sector(map.sectors()[0], &data, true)
            .unwrap();

        assert!(verified);
        assert_eq!(&bus.chip.mem[..0x10000], &data[..]);
        assert_eq!(bus.chip.erases, vec![0]);
    }

    #[test]
    fn buffered_write_uses_count_and_commit() {
        let cart = amd_cart(0x10000, true);
        let mut bus = MockBus {
            chip: MockNorChip::new(0x10000, 0x10000),
        };
        let map = SectorMap::uniform(0x10000, 0x10000);
        let data = vec![0x5A; 0x10000];

        let mut engine = FlashEngine::new(&mut bus, &cart);
        engine.program_sector(map.sectors()[0], &data, true).unwrap();

        assert_eq!(&bus.chip.mem[..], &data[..]);
        assert!(bus.chip.buffer_commits >= 0x10000 / 256);
    }

    #[test]
    fn blank_chunks_are_not_programmed() {
        let cart = amd_cart(0x10000, false);
        let mut bus = MockBus {
            chip: MockNorChip::new(0x10000, 0x10000),
        };
        let map = SectorMap::uniform(0x10000, 0x10000);
        let mut data = vec![0xFF; 0x10000];
        data[0x8000] = 0x12;
        data[0x8001] = 0x34;

        let mut engine = FlashEngine::new(&mut bus, &cart);
        engine.program_sector(map.sectors()[0], &data, true).unwrap();

        // Exactly one word crossed the program path
        assert_eq!(bus.chip.program_words, 1);
        assert_eq!(bus.chip.mem[0x8000], 0x12);
    }

    #[test]
    fn program_data_matching_the_reset_byte_still_lands() {
        let cart = amd_cart(0x10000, false);
        let mut bus = MockBus {
            chip: MockNorChip::new(0x10000, 0x10000),
        };
        let map = SectorMap::uniform(0x10000, 0x10000);
        // Words whose low byte equals the 0xF0 reset command
        let mut data = vec![0xFF; 0x10000];
        data[0x100] = 0xF0;
        data[0x101] = 0x12;
        data[0x102] = 0xF0;
        data[0x103] = 0xF0;

        let mut engine = FlashEngine::new(&mut bus, &cart);
        let verified = engine
            .program_sector(map.sectors()[0], &data, true)
            .unwrap();

        assert!(verified);
        assert_eq!(&bus.chip.mem[0x100..0x104], &[0xF0, 0x12, 0xF0, 0xF0]);
    }

    #[test]
    fn cfi_timing_tightens_only_declared_budgets() {
        let cart = amd_cart(0x10000, false);
        let mut bus = MockBus {
            chip: MockNorChip::new(0x10000, 0x10000),
        };
        let mut engine = FlashEngine::new(&mut bus, &cart);

        let info = CfiInfo {
            d0d1_swapped: false,
            vcc_min_mv: 2700,
            vcc_max_mv: 3600,
            typ_word_program_us: 16,
            typ_buffer_program_us: 0,
            typ_sector_erase_ms: 1024,
            // Chip erase undeclared; its default budget must survive
            typ_chip_erase_ms: 0,
            max_timeout_multiplier: [1, 1, 4, 1],
            device_size: 0x10000,
            buffer_size: 0,
            regions: vec![],
            top_boot: false,
        };
        engine.apply_cfi_timing(&info);

        assert_eq!(engine.sector_erase_ms, 4096);
        assert_eq!(engine.chip_erase_ms, DEFAULT_CHIP_ERASE_MS);
    }

    #[test]
    fn datel_carts_program_word_by_word_with_readback() {
        // A buffer_write table must not win over the vendor path
        let mut cart = amd_cart(0x10000, true);
        cart.command_set = CommandSet::Datel;
        let mut bus = MockBus {
            chip: MockNorChip::new(0x10000, 0x10000),
        };
        let map = SectorMap::uniform(0x10000, 0x10000);
        let data: Vec<u8> = (0..0x10000u32).map(|i| (i % 253) as u8).collect();

        let mut engine = FlashEngine::new(&mut bus, &cart);
        assert_eq!(engine.strategy(), ProgramStrategy::Bespoke);
        let verified = engine
            .program_sector(map.sectors()[0], &data, true)
            .unwrap();

        assert!(verified);
        assert_eq!(&bus.chip.mem[..], &data[..]);
        assert_eq!(bus.chip.buffer_commits, 0);
    }

    #[test]
    fn movie_player_carts_select_the_vendor_strategy() {
        let mut cart = amd_cart(0x10000, false);
        cart.command_set = CommandSet::MoviePlayer;
        let mut bus = MockBus {
            chip: MockNorChip::new(0x10000, 0x10000),
        };

        let engine = FlashEngine::new(&mut bus, &cart);
        assert_eq!(engine.strategy(), ProgramStrategy::Bespoke);
    }

    #[test]
    fn identifier_readout_resets_back_to_array_mode() {
        let cart = amd_cart(0x10000, false);
        let mut bus = MockBus {
            chip: MockNorChip::new(0x10000, 0x10000),
        };
        bus.chip.id = vec![0x01, 0x7E];

        let mut engine = FlashEngine::new(&mut bus, &cart);
        let id = engine.read_identifier().unwrap();
        assert_eq!(id, vec![0x01, 0x7E]);

        // Back in array mode: reads hit memory again
        let mut b = [0u8; 1];
        bus.chip.read(0, &mut b);
        assert_eq!(b[0], 0xFF);
    }

    #[test]
    fn chip_erase_reports_progress_ticks() {
        let cart = amd_cart(0x10000, false);
        let mut bus = MockBus {
            chip: MockNorChip::new(0x10000, 0x10000),
        };
        bus.chip.fill(0x00);
        bus.chip.erase_polls_until_done = 3;

        let mut ticks = 0u32;
        let mut engine = FlashEngine::new(&mut bus, &cart);
        engine.chip_erase(&mut |_elapsed| ticks += 1).unwrap();

        assert!(bus.chip.mem.iter().all(|&b| b == 0xFF));
        assert!(ticks >= 2);
    }

    #[test]
    fn verify_reports_first_mismatch_offset() {
        let cart = amd_cart(0x10000, false);
        let mut bus = MockBus {
            chip: MockNorChip::new(0x10000, 0x10000),
        };
        let mut expected = vec![0xFF; 0x1000];
        expected[0x123] = 0x42;

        let mut engine = FlashEngine::new(&mut bus, &cart);
        match engine.verify(0, &expected) {
            Err(Error::VerifyMismatch {
                offset,
                expected: 0x42,
                found: 0xFF,
            }) => assert_eq!(offset, 0x123),
            other => panic!("expected mismatch at 0x123, got {other:?}"),
        }
    }
}
