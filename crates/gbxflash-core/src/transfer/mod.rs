//! Transfer orchestrator
//!
//! `Session` owns the link port and runs whole-cartridge operations:
//! chunking, bank switching, progress events, delta flashing and
//! cooperative cancellation. Exactly one operation runs at a time; for
//! background execution the session (and with it the port) moves into a
//! worker thread and reports through an mpsc channel.

pub mod bus;
mod agb_save;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cart::{Catalog, CartType, CommandSet, SectorSource};
use crate::cfi::CfiInfo;
use crate::error::{Error, Result};
use crate::flash::delta::DeltaManifest;
use crate::flash::{FlashBus, FlashEngine, Sector, SectorMap};
use crate::header::agb::{self, AgbSaveType};
use crate::header::db::HeaderDatabase;
use crate::header::dmg;
use crate::link::{LinkPort, PortMode, Voltage};
use crate::mapper::rtc::RtcSnapshot;
use crate::mapper::{self, Mapper, MapperKind};
use crate::progress::{Action, ProgressEvent};

const CHUNK: usize = 0x1000;
/// Program granularity on the chip-erase path
const PROGRAM_CHUNK: usize = 0x10000;
/// DMG save-RAM window
const RAM_WINDOW: u16 = 0xA000;
const RAM_BANK_SIZE: u32 = 0x2000;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Advisory cancellation flag, polled at chunk and sector boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn check_cancel(cancel: &CancelToken, events: &Sender<ProgressEvent>) -> Result<()> {
    if cancel.is_cancelled() {
        let _ = events.send(ProgressEvent::Abort);
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
    pub voltage_override: Option<Voltage>,
    pub prefer_chip_erase: bool,
    pub verify: bool,
    /// Recompute DMG header checksums before programming
    pub fix_header: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub mapper_hint: Option<MapperKind>,
    pub save_type: Option<AgbSaveType>,
    pub include_rtc: bool,
    /// On restore, wipe save memory the image does not cover (0xFF fill)
    pub erase: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashSummary {
    pub sectors_erased: u32,
    pub sectors_skipped: u32,
    pub bytes_written: u64,
    pub verified: bool,
}

/// What `read_info` learned about the inserted cartridge
#[derive(Debug, Clone)]
pub struct CartInfo {
    pub platform: PortMode,
    pub dmg: Option<dmg::DmgHeader>,
    pub agb: Option<agb::AgbHeader>,
    /// Display name from the header database, when known
    pub display_name: Option<String>,
    pub rom_size: u32,
    pub save_size: u32,
    pub save_type: Option<AgbSaveType>,
}

#[derive(Debug)]
pub struct ChipCheck {
    pub id: Vec<u8>,
    pub cfi: Option<CfiInfo>,
}

pub struct Session<P: LinkPort> {
    port: P,
}

impl<P: LinkPort> Session<P> {
    pub fn new(port: P) -> Self {
        Session { port }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    /// Probe the slot and parse whatever header is there. AGB is tried
    /// first; a valid boot logo settles it.
    pub fn read_info(&mut self, db: Option<&HeaderDatabase>) -> Result<CartInfo> {
        self.port.set_mode(PortMode::Agb)?;
        self.port.set_voltage(Voltage::V3_3)?;
        let mut head = vec![0u8; 0xC0];
        self.port.agb_read(0, &mut head)?;
        let agb_header = agb::parse(&head);
        if agb_header.logo_correct {
            let entry = db.and_then(|d| d.lookup(&agb_header.header_sha1));
            return Ok(CartInfo {
                platform: PortMode::Agb,
                rom_size: entry.map(|e| e.rom_size).unwrap_or(0),
                save_size: entry.map(|e| e.save_size).unwrap_or(0),
                save_type: entry.and_then(|e| e.agb_save_type()),
                display_name: entry.map(|e| e.display_name.clone()),
                dmg: None,
                agb: Some(agb_header),
            });
        }

        self.port.set_mode(PortMode::Dmg)?;
        self.port.set_voltage(Voltage::V5)?;
        let mut head = vec![0u8; 0x150];
        self.port.dmg_read(0, &mut head)?;
        let h = dmg::parse(&head);
        let entry = db.and_then(|d| d.lookup(&h.header_sha1));
        Ok(CartInfo {
            platform: PortMode::Dmg,
            rom_size: entry.map(|e| e.rom_size).unwrap_or(h.rom_size),
            save_size: entry.map(|e| e.save_size).unwrap_or(h.ram_size),
            save_type: None,
            display_name: entry.map(|e| e.display_name.clone()),
            dmg: Some(h),
            agb: None,
        })
    }

    pub fn backup_rom(
        &mut self,
        platform: PortMode,
        mapper_hint: Option<MapperKind>,
        rom_size: Option<u32>,
        fast_read: bool,
        events: &Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        match platform {
            PortMode::Dmg => self.backup_rom_dmg(mapper_hint, rom_size, fast_read, events, cancel),
            PortMode::Agb => self.backup_rom_agb(rom_size, fast_read, events, cancel),
        }
    }

    fn backup_rom_dmg(
        &mut self,
        mapper_hint: Option<MapperKind>,
        rom_size: Option<u32>,
        fast_read: bool,
        events: &Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        self.port.set_mode(PortMode::Dmg)?;
        let mut head = vec![0u8; 0x150];
        self.port.dmg_read(0, &mut head)?;
        let h = dmg::parse(&head);

        let kind = match mapper_hint.or(h.mapper) {
            Some(k) => k,
            None => return Err(Error::UnsupportedMapper(h.cart_type)),
        };
        let mut mapper = Mapper::new(kind);
        let total = rom_size.unwrap_or(h.rom_size);
        let _ = events.send(ProgressEvent::Initialize {
            action: Action::ReadRom,
            total_bytes: total,
        });
        log::info!(
            "backing up {} DMG ROM, {} ({} bytes)",
            h.title,
            kind.describe(),
            total
        );

        let bank_size = mapper.bank_size();
        let banks = total.div_ceil(bank_size);
        let mut out = Vec::with_capacity(total as usize);
        for bank in 0..banks {
            check_cancel(cancel, events)?;
            let win = mapper.select_rom_bank(&mut self.port, bank as u16)?;
            let len = win.size.min(total - out.len() as u32) as usize;
            let mut buf = vec![0u8; len];
            // Fast mode pulls a whole bank per frame, one event per bank
            let step = if fast_read { buf.len().max(1) } else { CHUNK };
            let mut off = 0usize;
            while off < buf.len() {
                let n = step.min(buf.len() - off);
                self.port
                    .dmg_read(win.base + off as u16, &mut buf[off..off + n])?;
                off += n;
                let _ = events.send(ProgressEvent::Read {
                    pos: out.len() as u32 + off as u32,
                    len: n as u32,
                });
            }
            out.extend_from_slice(&buf);
        }
        let _ = events.send(ProgressEvent::Finished {
            bytes_transferred: out.len() as u64,
            verified: false,
        });
        Ok(out)
    }

    fn backup_rom_agb(
        &mut self,
        rom_size: Option<u32>,
        fast_read: bool,
        events: &Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        self.port.set_mode(PortMode::Agb)?;
        let total = match rom_size {
            Some(s) => s,
            None => self.probe_agb_rom_size()?,
        };
        let _ = events.send(ProgressEvent::Initialize {
            action: Action::ReadRom,
            total_bytes: total,
        });

        let step = if fast_read { PROGRAM_CHUNK } else { CHUNK };
        let mut out = vec![0u8; total as usize];
        for (i, chunk) in out.chunks_mut(step).enumerate() {
            check_cancel(cancel, events)?;
            let pos = (i * step) as u32;
            self.port.agb_read(pos, chunk)?;
            let _ = events.send(ProgressEvent::Read {
                pos: pos + chunk.len() as u32,
                len: chunk.len() as u32,
            });
        }
        let _ = events.send(ProgressEvent::Finished {
            bytes_transferred: out.len() as u64,
            verified: false,
        });
        Ok(out)
    }

    /// The AGB bus mirrors the ROM; the first offset whose content repeats
    /// block 0 (checked twice to dodge coincidences) is the ROM size.
    fn probe_agb_rom_size(&mut self) -> Result<u32> {
        let mut base0 = [0u8; 0x100];
        let mut base1 = [0u8; 0x100];
        self.port.agb_read(0, &mut base0)?;
        self.port.agb_read(0x8000, &mut base1)?;
        for exp in 20..25 {
            let size = 1u32 << exp;
            let mut p0 = [0u8; 0x100];
            let mut p1 = [0u8; 0x100];
            self.port.agb_read(size, &mut p0)?;
            self.port.agb_read(size + 0x8000, &mut p1)?;
            if p0 == base0 && p1 == base1 {
                return Ok(size);
            }
        }
        Ok(32 << 20)
    }

    pub fn flash_rom(
        &mut self,
        data: &[u8],
        cart: &CartType,
        opts: &FlashOptions,
        manifest_target: Option<&Path>,
        events: &Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<FlashSummary> {
        self.port.set_mode(cart.platform)?;
        self.port
            .set_voltage(opts.voltage_override.unwrap_or(cart.voltage))?;
        self.port.set_write_pin(cart.write_pin)?;

        let mut image = data.to_vec();
        if opts.fix_header && cart.platform == PortMode::Dmg {
            dmg::fix_checksums(&mut image);
        }
        if image.len() as u32 > cart.chip_size {
            return Err(Error::Catalog(format!(
                "image is {} bytes but {} holds {}",
                image.len(),
                cart.name(),
                cart.chip_size
            )));
        }

        let result = match cart.platform {
            PortMode::Agb => {
                let mut b = bus::AgbFlashBus::new(&mut self.port);
                flash_with_bus(&mut b, cart, &image, opts, manifest_target, events, cancel)
            }
            PortMode::Dmg => {
                let kind = if cart.command_set == CommandSet::GbMemory {
                    MapperKind::GbMemory
                } else {
                    MapperKind::Mbc5
                };
                let mut mapper = Mapper::new(kind);
                mapper.prepare_flash_write(&mut self.port)?;
                let mut b = bus::DmgFlashBus::new(&mut self.port, &mut mapper, cart);
                flash_with_bus(&mut b, cart, &image, opts, manifest_target, events, cancel)
            }
        };

        match result {
            Ok(summary) => {
                if cart.pulse_reset_after_write {
                    self.port.reset_cart()?;
                }
                Ok(summary)
            }
            Err(e) => {
                // Leave the hardware in a safe read state no matter what
                let _ = self.port.reset_cart();
                let _ = self.port.set_voltage(cart.voltage);
                Err(e)
            }
        }
    }

    pub fn backup_ram(
        &mut self,
        platform: PortMode,
        opts: &SaveOptions,
        events: &Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        match platform {
            PortMode::Dmg => self.backup_ram_dmg(opts, events, cancel),
            PortMode::Agb => {
                self.port.set_mode(PortMode::Agb)?;
                let ty = opts
                    .save_type
                    .ok_or_else(|| Error::Catalog("AGB save type required".into()))?;
                let _ = events.send(ProgressEvent::Initialize {
                    action: Action::ReadSave,
                    total_bytes: ty.byte_len(),
                });
                let out = agb_save::read_save(&mut self.port, ty, |pos, _total| {
                    let _ = events.send(ProgressEvent::Read { pos, len: CHUNK as u32 });
                })?;
                check_cancel(cancel, events)?;
                let _ = events.send(ProgressEvent::Finished {
                    bytes_transferred: out.len() as u64,
                    verified: false,
                });
                Ok(out)
            }
        }
    }

    fn backup_ram_dmg(
        &mut self,
        opts: &SaveOptions,
        events: &Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        self.port.set_mode(PortMode::Dmg)?;
        let (mut mapper, ram_size) = self.dmg_save_setup(opts)?;
        let _ = events.send(ProgressEvent::Initialize {
            action: Action::ReadSave,
            total_bytes: ram_size,
        });

        let mut out = match mapper.kind() {
            MapperKind::Mbc7 => {
                mapper.enable_ram(&mut self.port, true)?;
                mapper::mbc7_eeprom_read(&mut self.port)?
            }
            MapperKind::Tama5 => mapper::rtc::tama5_ram_dump(&mut self.port)?,
            _ => {
                mapper.enable_ram(&mut self.port, true)?;
                let mut data = Vec::with_capacity(ram_size as usize);
                let banks = ram_size.div_ceil(RAM_BANK_SIZE).max(1);
                for bank in 0..banks {
                    check_cancel(cancel, events)?;
                    mapper.select_ram_bank(&mut self.port, bank as u8)?;
                    let len = RAM_BANK_SIZE.min(ram_size - data.len() as u32) as usize;
                    let mut buf = vec![0u8; len];
                    self.port.dmg_read(RAM_WINDOW, &mut buf)?;
                    if mapper.kind() == MapperKind::Mbc2 {
                        // Only the low nibble exists
                        for b in buf.iter_mut() {
                            *b &= 0x0F;
                        }
                    }
                    data.extend_from_slice(&buf);
                    let _ = events.send(ProgressEvent::Read {
                        pos: data.len() as u32,
                        len: len as u32,
                    });
                }
                data
            }
        };

        if opts.include_rtc && mapper.has_rtc() {
            let snap = mapper.read_rtc(&mut self.port, now_unix())?;
            out.extend_from_slice(&encode_rtc_trailer(&snap));
        }
        mapper.enable_ram(&mut self.port, false)?;
        let _ = events.send(ProgressEvent::Finished {
            bytes_transferred: out.len() as u64,
            verified: false,
        });
        Ok(out)
    }

    pub fn restore_ram(
        &mut self,
        platform: PortMode,
        data: &[u8],
        opts: &SaveOptions,
        events: &Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<()> {
        match platform {
            PortMode::Dmg => self.restore_ram_dmg(data, opts, events, cancel),
            PortMode::Agb => {
                self.port.set_mode(PortMode::Agb)?;
                let ty = opts
                    .save_type
                    .ok_or_else(|| Error::Catalog("AGB save type required".into()))?;
                let _ = events.send(ProgressEvent::Initialize {
                    action: Action::WriteSave,
                    total_bytes: ty.byte_len(),
                });
                check_cancel(cancel, events)?;
                let data = pad_save_image(data, ty.byte_len() as usize, opts.erase);
                agb_save::write_save(&mut self.port, ty, &data, |pos, _total| {
                    let _ = events.send(ProgressEvent::Write { pos, len: CHUNK as u32 });
                })?;
                let _ = events.send(ProgressEvent::Finished {
                    bytes_transferred: ty.byte_len() as u64,
                    verified: false,
                });
                Ok(())
            }
        }
    }

    fn restore_ram_dmg(
        &mut self,
        data: &[u8],
        opts: &SaveOptions,
        events: &Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.port.set_mode(PortMode::Dmg)?;
        let (mut mapper, ram_size) = self.dmg_save_setup(opts)?;

        // An RTC trailer rides behind the RAM image
        let (ram_image, trailer) = split_rtc_trailer(data, ram_size as usize);
        let ram_image = pad_save_image(ram_image, ram_size as usize, opts.erase);
        let ram_image = ram_image.as_ref();
        let _ = events.send(ProgressEvent::Initialize {
            action: Action::WriteSave,
            total_bytes: ram_image.len() as u32,
        });

        match mapper.kind() {
            MapperKind::Mbc7 => {
                mapper.enable_ram(&mut self.port, true)?;
                mapper::mbc7_eeprom_write(&mut self.port, ram_image)?;
            }
            MapperKind::Tama5 => mapper::rtc::tama5_ram_load(&mut self.port, ram_image)?,
            _ => {
                mapper.enable_ram(&mut self.port, true)?;
                let banks = (ram_image.len() as u32).div_ceil(RAM_BANK_SIZE).max(1);
                for bank in 0..banks {
                    check_cancel(cancel, events)?;
                    mapper.select_ram_bank(&mut self.port, bank as u8)?;
                    let start = (bank * RAM_BANK_SIZE) as usize;
                    let end = (start + RAM_BANK_SIZE as usize).min(ram_image.len());
                    self.port
                        .dmg_write_block(RAM_WINDOW, &ram_image[start..end])?;
                    let _ = events.send(ProgressEvent::Write {
                        pos: end as u32,
                        len: (end - start) as u32,
                    });
                }
            }
        }

        if opts.include_rtc && mapper.has_rtc() {
            if let Some(snap) = trailer {
                // Roll the stored clock forward to the present
                let snap = snap.advanced_to(now_unix());
                mapper.write_rtc(&mut self.port, &snap)?;
            }
        }
        mapper.enable_ram(&mut self.port, false)?;
        let _ = events.send(ProgressEvent::Finished {
            bytes_transferred: ram_image.len() as u64,
            verified: false,
        });
        Ok(())
    }

    fn dmg_save_setup(&mut self, opts: &SaveOptions) -> Result<(Mapper, u32)> {
        let mut head = vec![0u8; 0x150];
        self.port.dmg_read(0, &mut head)?;
        let h = dmg::parse(&head);
        let kind = match opts.mapper_hint.or(h.mapper) {
            Some(k) => k,
            None => return Err(Error::UnsupportedMapper(h.cart_type)),
        };
        Ok((Mapper::new(kind), h.ram_size))
    }

    /// Try every catalog entry's identify sequence and report which ones
    /// recognize the chip
    pub fn auto_detect_flash(
        &mut self,
        catalog: &Catalog,
        platform: PortMode,
        limit_voltage: Option<Voltage>,
    ) -> Result<Vec<String>> {
        self.port.set_mode(platform)?;
        let mut found = Vec::new();
        for ct in catalog.for_platform(platform) {
            if ct.flash_ids.is_empty() {
                continue;
            }
            if let Some(v) = limit_voltage {
                if ct.voltage != v {
                    continue;
                }
            }
            self.port.set_voltage(ct.voltage)?;
            self.port.set_write_pin(ct.write_pin)?;
            let id = self.identify_for(ct)?;
            if ct.flash_ids.iter().any(|k| id.starts_with(k)) {
                log::info!("{} matches id {:02X?}", ct.name(), id);
                found.push(ct.name().to_string());
            }
        }
        self.port.reset_cart()?;
        Ok(found)
    }

    /// Identify the chip and dump its CFI table under one cartridge type
    pub fn check_flash_chip(&mut self, cart: &CartType) -> Result<ChipCheck> {
        self.port.set_mode(cart.platform)?;
        self.port.set_voltage(cart.voltage)?;
        self.port.set_write_pin(cart.write_pin)?;
        let id = self.identify_for(cart)?;
        let cfi = match cart.platform {
            PortMode::Agb => {
                let mut b = bus::AgbFlashBus::new(&mut self.port);
                FlashEngine::new(&mut b, cart).read_cfi()
            }
            PortMode::Dmg => {
                let mut mapper = Mapper::new(MapperKind::Mbc5);
                let mut b = bus::DmgFlashBus::new(&mut self.port, &mut mapper, cart);
                FlashEngine::new(&mut b, cart).read_cfi()
            }
        };
        let cfi = match cfi {
            Ok(info) => Some(info),
            Err(e) => {
                log::debug!("no CFI table: {e}");
                None
            }
        };
        self.port.reset_cart()?;
        Ok(ChipCheck { id, cfi })
    }

    fn identify_for(&mut self, cart: &CartType) -> Result<Vec<u8>> {
        match cart.platform {
            PortMode::Agb => {
                let mut b = bus::AgbFlashBus::new(&mut self.port);
                FlashEngine::new(&mut b, cart).read_identifier()
            }
            PortMode::Dmg => {
                let mut mapper = Mapper::new(MapperKind::Mbc5);
                let mut b = bus::DmgFlashBus::new(&mut self.port, &mut mapper, cart);
                FlashEngine::new(&mut b, cart).read_identifier()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background execution
// ---------------------------------------------------------------------------

/// A whole-cartridge operation with everything it needs, ready to move
/// into a worker thread
pub enum Operation {
    BackupRom {
        platform: PortMode,
        mapper_hint: Option<MapperKind>,
        rom_size: Option<u32>,
        fast_read: bool,
    },
    FlashRom {
        data: Vec<u8>,
        cart: CartType,
        opts: FlashOptions,
        manifest_target: Option<PathBuf>,
    },
    BackupRam {
        platform: PortMode,
        opts: SaveOptions,
    },
    RestoreRam {
        platform: PortMode,
        data: Vec<u8>,
        opts: SaveOptions,
    },
}

#[derive(Debug)]
pub enum Outcome {
    Rom(Vec<u8>),
    Flashed(FlashSummary),
    Save(Vec<u8>),
    Restored,
}

/// Handle to a running background operation
pub struct Job {
    pub events: Receiver<ProgressEvent>,
    pub cancel: CancelToken,
    handle: JoinHandle<Result<Outcome>>,
}

impl Job {
    pub fn join(self) -> Result<Outcome> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(Error::Communication("worker thread panicked".into())))
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<P: LinkPort + Send + 'static> Session<P> {
    /// Move the session into a worker thread running `op`
    pub fn spawn(mut self, op: Operation) -> Job {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let c = cancel.clone();
        let handle = thread::spawn(move || match op {
            Operation::BackupRom {
                platform,
                mapper_hint,
                rom_size,
                fast_read,
            } => self
                .backup_rom(platform, mapper_hint, rom_size, fast_read, &tx, &c)
                .map(Outcome::Rom),
            Operation::FlashRom {
                data,
                cart,
                opts,
                manifest_target,
            } => self
                .flash_rom(&data, &cart, &opts, manifest_target.as_deref(), &tx, &c)
                .map(Outcome::Flashed),
            Operation::BackupRam { platform, opts } => {
                self.backup_ram(platform, &opts, &tx, &c).map(Outcome::Save)
            }
            Operation::RestoreRam {
                platform,
                data,
                opts,
            } => self
                .restore_ram(platform, &data, &opts, &tx, &c)
                .map(|_| Outcome::Restored),
        });
        Job {
            events: rx,
            cancel,
            handle,
        }
    }
}

// ---------------------------------------------------------------------------
// Flash flow
// ---------------------------------------------------------------------------

fn padded_sector(data: &[u8], s: &Sector) -> Vec<u8> {
    let start = (s.base as usize).min(data.len());
    let end = (s.end() as usize).min(data.len());
    let mut v = data[start..end].to_vec();
    v.resize(s.size as usize, 0xFF);
    v
}

fn flash_with_bus<B: FlashBus>(
    b: &mut B,
    cart: &CartType,
    data: &[u8],
    opts: &FlashOptions,
    manifest_target: Option<&Path>,
    events: &Sender<ProgressEvent>,
    cancel: &CancelToken,
) -> Result<FlashSummary> {
    let mut engine = FlashEngine::new(b, cart);
    let _ = events.send(ProgressEvent::Initialize {
        action: Action::WriteRom,
        total_bytes: data.len() as u32,
    });

    let id = engine.read_identifier()?;
    log::debug!("flash id: {id:02X?}");

    let map = match &cart.sectors {
        SectorSource::Static(regions) => {
            let m = SectorMap::from_regions(regions);
            Some(if cart.sector_reversal { m.reversed() } else { m })
        }
        SectorSource::Cfi => {
            let info = engine.read_cfi()?;
            log::info!("CFI geometry: {}", info.describe());
            engine.apply_cfi_timing(&info);
            Some(SectorMap::from_cfi(&info))
        }
        SectorSource::ChipEraseOnly => None,
    };

    let summary = match map {
        Some(map) if !opts.prefer_chip_erase || cart.commands.chip_erase.is_empty() => {
            flash_by_sectors(&mut engine, &map, data, opts, manifest_target, events, cancel)?
        }
        _ => flash_whole_chip(&mut engine, data, opts, events, cancel)?,
    };

    engine.reset()?;
    let _ = events.send(ProgressEvent::Finished {
        bytes_transferred: summary.bytes_written,
        verified: summary.verified,
    });
    Ok(summary)
}

fn flash_whole_chip<B: FlashBus>(
    engine: &mut FlashEngine<'_, B>,
    data: &[u8],
    opts: &FlashOptions,
    events: &Sender<ProgressEvent>,
    cancel: &CancelToken,
) -> Result<FlashSummary> {
    check_cancel(cancel, events)?;
    let mut last_report = 0u64;
    engine.chip_erase(&mut |elapsed| {
        if elapsed >= last_report + 250 {
            last_report = elapsed;
            let _ = events.send(ProgressEvent::Erase { elapsed_ms: elapsed });
        }
    })?;

    let mut summary = FlashSummary::default();
    for (i, chunk) in data.chunks(PROGRAM_CHUNK).enumerate() {
        check_cancel(cancel, events)?;
        let pos = (i * PROGRAM_CHUNK) as u32;
        summary.bytes_written += engine.program(pos, chunk, true)? as u64;
        let _ = events.send(ProgressEvent::Write {
            pos: pos + chunk.len() as u32,
            len: chunk.len() as u32,
        });
    }
    if opts.verify {
        for (i, chunk) in data.chunks(PROGRAM_CHUNK).enumerate() {
            check_cancel(cancel, events)?;
            engine.verify((i * PROGRAM_CHUNK) as u32, chunk)?;
        }
        summary.verified = true;
    }
    Ok(summary)
}

fn flash_by_sectors<B: FlashBus>(
    engine: &mut FlashEngine<'_, B>,
    map: &SectorMap,
    data: &[u8],
    opts: &FlashOptions,
    manifest_target: Option<&Path>,
    events: &Sender<ProgressEvent>,
    cancel: &CancelToken,
) -> Result<FlashSummary> {
    let mut manifest = manifest_target.map(|t| DeltaManifest::load(t, map));
    let mut summary = FlashSummary::default();

    // Plan which sectors actually change
    let mut plan: Vec<(Sector, Vec<u8>, u32)> = Vec::new();
    let mut cursor = map.cursor();
    while let Some(s) = cursor.peek() {
        if s.base as usize >= data.len() {
            break;
        }
        cursor.advance();
        let content = padded_sector(data, &s);
        let crc = crc32fast::hash(&content);
        if manifest
            .as_ref()
            .is_some_and(|m| m.matches(s.base, s.size, crc))
        {
            summary.sectors_skipped += 1;
            let _ = events.send(ProgressEvent::UpdatePos { pos: s.end() });
        } else {
            plan.push((s, content, crc));
        }
    }
    log::info!(
        "{} sectors to rewrite, {} unchanged",
        plan.len(),
        summary.sectors_skipped
    );

    // Erase phase. The running erase always completes; cancellation lands
    // between sectors so the chip is never left erase-pending.
    let count = plan.len() as u32;
    for (i, (s, _, _)) in plan.iter().enumerate() {
        check_cancel(cancel, events)?;
        // Drop the sector from the on-disk manifest before touching it; an
        // interrupted run must not leave a stale CRC for a blank sector
        if let Some(m) = manifest.as_mut() {
            m.forget(s.base, s.size);
            m.save()?;
        }
        engine.erase_sector(*s)?;
        summary.sectors_erased += 1;
        let _ = events.send(ProgressEvent::SectorErase {
            index: i as u32,
            count,
            pos: s.base,
        });
    }

    // Program phase
    for (s, content, _) in &plan {
        check_cancel(cancel, events)?;
        summary.bytes_written += engine.program(s.base, content, true)? as u64;
        let _ = events.send(ProgressEvent::Write {
            pos: s.end(),
            len: s.size,
        });
    }

    // Verify phase; a mismatching sector gets the full rewind treatment
    for (s, content, crc) in &plan {
        if opts.verify {
            check_cancel(cancel, events)?;
            match engine.verify(s.base, content) {
                Ok(()) => {}
                Err(Error::VerifyMismatch { offset, .. }) => {
                    log::warn!("verify mismatch at {offset:#x}, rewriting sector {:#x}", s.base);
                    engine.program_sector(*s, content, true)?;
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(m) = manifest.as_mut() {
            m.record(s.base, s.size, *crc);
        }
    }
    summary.verified = opts.verify;

    if let Some(m) = &manifest {
        m.save()?;
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// DMG save RTC trailer (VBA-style, 48 bytes)
// ---------------------------------------------------------------------------

const RTC_TRAILER_LEN: usize = 48;

fn encode_rtc_trailer(snap: &RtcSnapshot) -> [u8; RTC_TRAILER_LEN] {
    let regs = snap.to_mbc3_regs();
    let mut out = [0u8; RTC_TRAILER_LEN];
    // Running registers, then the latched copy, each widened to u32
    for (i, &r) in regs.iter().chain(regs.iter()).enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&(r as u32).to_le_bytes());
    }
    out[40..48].copy_from_slice(&snap.captured_at.to_le_bytes());
    out
}

fn decode_rtc_trailer(raw: &[u8]) -> Option<RtcSnapshot> {
    if raw.len() != RTC_TRAILER_LEN {
        return None;
    }
    let mut regs = [0u8; 5];
    for (i, r) in regs.iter_mut().enumerate() {
        *r = raw[i * 4];
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&raw[40..48]);
    Some(RtcSnapshot::from_mbc3_regs(regs, u64::from_le_bytes(ts)))
}

/// With `erase` set, extend a short save image to `full_len` with 0xFF so
/// restore wipes the memory it does not cover
fn pad_save_image(data: &[u8], full_len: usize, erase: bool) -> std::borrow::Cow<'_, [u8]> {
    if erase && data.len() < full_len {
        let mut padded = data.to_vec();
        padded.resize(full_len, 0xFF);
        std::borrow::Cow::Owned(padded)
    } else {
        std::borrow::Cow::Borrowed(data)
    }
}

fn split_rtc_trailer(data: &[u8], ram_size: usize) -> (&[u8], Option<RtcSnapshot>) {
    if data.len() == ram_size + RTC_TRAILER_LEN {
        (
            &data[..ram_size],
            decode_rtc_trailer(&data[ram_size..]),
        )
    } else {
        (&data[..data.len().min(ram_size)], None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::Catalog;
    use crate::error::Result;
    use crate::header::dmg::{fix_checksums, NINTENDO_LOGO};
    use crate::link::{EepromSize, WritePin};
    use crate::testutil::MockNorChip;

    // -----------------------------------------------------------------
    // Mock cartridges on the link-port level
    // -----------------------------------------------------------------

    /// AGB cartridge with an AMD NOR chip behind the ROM bus
    struct AgbNorPort {
        chip: MockNorChip,
        mode: Option<PortMode>,
        resets: u32,
        /// Fire this token once the chip has seen N sector erases
        cancel_after_erases: Option<(usize, CancelToken)>,
    }

    impl AgbNorPort {
        fn new(size: u32, sector: u32) -> Self {
            AgbNorPort {
                chip: MockNorChip::new(size, sector),
                mode: None,
                resets: 0,
                cancel_after_erases: None,
            }
        }
    }

    impl LinkPort for AgbNorPort {
        fn mode(&self) -> Option<PortMode> {
            self.mode
        }
        fn set_mode(&mut self, mode: PortMode) -> Result<()> {
            self.mode = Some(mode);
            Ok(())
        }
        fn set_voltage(&mut self, _voltage: Voltage) -> Result<()> {
            Ok(())
        }
        fn set_write_pin(&mut self, _pin: WritePin) -> Result<()> {
            Ok(())
        }
        fn dmg_read(&mut self, _addr: u16, buf: &mut [u8]) -> Result<()> {
            buf.fill(0xFF);
            Ok(())
        }
        fn dmg_write(&mut self, _addr: u16, _value: u8) -> Result<()> {
            Ok(())
        }
        fn dmg_flash_write(&mut self, _addr: u16, _value: u8) -> Result<()> {
            Ok(())
        }
        fn agb_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
            self.chip.read(addr, buf);
            Ok(())
        }
        fn agb_write(&mut self, addr: u32, value: u16) -> Result<()> {
            self.chip.command(addr, value);
            if let Some((n, token)) = &self.cancel_after_erases {
                if self.chip.erases.len() >= *n {
                    token.cancel();
                }
            }
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
            self.chip.command(0, 0xF0);
            Ok(())
        }
        fn delay_ms(&mut self, _ms: u32) {}
    }

    /// DMG cartridge: MBC5 banking in front of an x8 AMD NOR chip, plus
    /// banked save RAM
    struct DmgNorPort {
        chip: MockNorChip,
        rom_bank: u16,
        ram_bank: u8,
        ram_enabled: bool,
        ram: Vec<u8>,
        mode: Option<PortMode>,
        resets: u32,
    }

    impl DmgNorPort {
        fn new(size: u32, sector: u32) -> Self {
            let mut chip = MockNorChip::new(size, sector);
            chip.x8 = true;
            DmgNorPort {
                chip,
                rom_bank: 1,
                ram_bank: 0,
                ram_enabled: false,
                ram: vec![0xFF; 0x8000],
                mode: None,
                resets: 0,
            }
        }

        fn flat(&self, addr: u16) -> u32 {
            if addr >= 0x4000 {
                self.rom_bank as u32 * 0x4000 + (addr as u32 - 0x4000)
            } else {
                addr as u32
            }
        }

        fn ram_index(&self, addr: u16) -> usize {
            self.ram_bank as usize * 0x2000 + (addr as usize - 0xA000)
        }
    }

    impl LinkPort for DmgNorPort {
        fn mode(&self) -> Option<PortMode> {
            self.mode
        }
        fn set_mode(&mut self, mode: PortMode) -> Result<()> {
            self.mode = Some(mode);
            Ok(())
        }
        fn set_voltage(&mut self, _voltage: Voltage) -> Result<()> {
            Ok(())
        }
        fn set_write_pin(&mut self, _pin: WritePin) -> Result<()> {
            Ok(())
        }
        fn dmg_read(&mut self, addr: u16, buf: &mut [u8]) -> Result<()> {
            if addr >= 0xA000 {
                let start = self.ram_index(addr);
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = self.ram.get(start + i).copied().unwrap_or(0xFF);
                }
            } else {
                let flat = self.flat(addr);
                self.chip.read(flat, buf);
            }
            Ok(())
        }
        fn dmg_write(&mut self, addr: u16, value: u8) -> Result<()> {
            match addr {
                0x0000..=0x1FFF => self.ram_enabled = value == 0x0A,
                0x2000..=0x2FFF => {
                    self.rom_bank = (self.rom_bank & 0x100) | value as u16;
                }
                0x3000..=0x3FFF => {
                    self.rom_bank = (self.rom_bank & 0xFF) | ((value as u16 & 1) << 8);
                }
                0x4000..=0x5FFF => self.ram_bank = value & 0x0F,
                0xA000..=0xBFFF => {
                    if self.ram_enabled {
                        let i = self.ram_index(addr);
                        if i < self.ram.len() {
                            self.ram[i] = value;
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        }
        fn dmg_flash_write(&mut self, addr: u16, value: u8) -> Result<()> {
            let flat = self.flat(addr);
            self.chip.command(flat, value as u16);
            Ok(())
        }
        fn agb_read(&mut self, _addr: u32, buf: &mut [u8]) -> Result<()> {
            buf.fill(0xFF);
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
            self.rom_bank = 1;
            self.chip.command(0, 0xF0);
            Ok(())
        }
        fn delay_ms(&mut self, _ms: u32) {}
    }

    fn agb_cart(chip_size: u32, sector: u32) -> CartType {
        let json = format!(
            r#"[{{
            "names": ["test agb flash"],
            "platform": "AGB",
            "command_set": "AMD",
            "flash_ids": [[1, 126]],
            "chip_size": {chip_size},
            "sector_size": {sector},
            "commands": {{
                "reset": [["0", "0xF0"]],
                "read_identifier": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0x90"]],
                "sector_erase": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0x80"],
                                 ["0xAAA", "0xAA"], ["0x555", "0x55"], ["SA", "0x30"]],
                "single_write": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0xA0"], ["PA", "PD"]]
            }}
        }}]"#
        );
        Catalog::load_json(&json).unwrap().entries()[0].clone()
    }

    fn dmg_cart(chip_size: u32, sector: u32) -> CartType {
        let json = format!(
            r#"[{{
            "names": ["test dmg flash"],
            "platform": "DMG",
            "command_set": "AMD",
            "flash_ids": [[1, 126]],
            "chip_size": {chip_size},
            "sector_size": {sector},
            "commands": {{
                "reset": [["0", "0xF0"]],
                "read_identifier": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0x90"]],
                "sector_erase": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0x80"],
                                 ["0xAAA", "0xAA"], ["0x555", "0x55"], ["SA", "0x30"]],
                "single_write": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0xA0"], ["PA", "PD"]]
            }}
        }}]"#
        );
        Catalog::load_json(&json).unwrap().entries()[0].clone()
    }

    fn dmg_rom(title: &str, cart_type: u8, rom_code: u8, ram_code: u8, len: usize) -> Vec<u8> {
        let mut rom = vec![0u8; len];
        rom[0x104..0x134].copy_from_slice(&NINTENDO_LOGO);
        for (i, b) in title.bytes().take(16).enumerate() {
            rom[0x134 + i] = b;
        }
        rom[0x147] = cart_type;
        rom[0x148] = rom_code;
        rom[0x149] = ram_code;
        fix_checksums(&mut rom);
        rom
    }

    fn channel() -> (Sender<ProgressEvent>, Receiver<ProgressEvent>) {
        mpsc::channel()
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    // -----------------------------------------------------------------

    #[test]
    fn dmg_32k_image_erases_two_sectors_and_verifies() {
        let cart = dmg_cart(0x8000, 0x4000);
        let data = patterned(0x8000);
        let mut session = Session::new(DmgNorPort::new(0x8000, 0x4000));
        let (tx, _rx) = channel();
        let cancel = CancelToken::new();

        let opts = FlashOptions {
            verify: true,
            ..Default::default()
        };
        let summary = session
            .flash_rom(&data, &cart, &opts, None, &tx, &cancel)
            .unwrap();

        assert_eq!(summary.sectors_erased, 2);
        assert_eq!(summary.bytes_written, 32768);
        assert!(summary.verified);
        let port = session.into_port();
        assert_eq!(port.chip.erases, vec![0x0000, 0x4000]);
        assert_eq!(&port.chip.mem[..], &data[..]);
    }

    #[test]
    fn dmg_sector_erase_reaches_banked_sector_addresses() {
        let cart = dmg_cart(0x8000, 0x4000);
        let mut port = DmgNorPort::new(0x8000, 0x4000);
        let mut mapper = Mapper::new(MapperKind::Mbc5);
        let map = SectorMap::uniform(0x4000, 0x8000);
        {
            let mut b = bus::DmgFlashBus::new(&mut port, &mut mapper, &cart);
            let mut engine = FlashEngine::new(&mut b, &cart);
            // Programming sector 0 leaves bank 0 in the window; the erase
            // cycle for flat 0x4000 must still land in its own bank
            engine.program(0, &[0x12, 0x34], false).unwrap();
            engine.erase_sector(map.sectors()[1]).unwrap();
        }
        assert_eq!(port.chip.erases, vec![0x4000]);
        assert_eq!(port.chip.mem[0], 0x12);
    }

    #[test]
    fn interrupted_flash_never_leaves_stale_manifest_entries() {
        let dir = std::env::temp_dir().join(format!("gbxflash-delta-stale-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let target = dir.join("image.gba");

        let cart = agb_cart(0x40000, 0x10000);
        let original = patterned(0x40000);
        let other: Vec<u8> = original.iter().map(|b| b ^ 0xA5).collect();
        let (tx, _rx) = channel();
        let opts = FlashOptions {
            verify: true,
            ..Default::default()
        };

        // Populate the manifest with the original image
        let mut session = Session::new(AgbNorPort::new(0x40000, 0x10000));
        session
            .flash_rom(&original, &cart, &opts, Some(&target), &tx, &CancelToken::new())
            .unwrap();

        // Flash a different image, cancelled after two of its four erases
        let cancel = CancelToken::new();
        session.port_mut().cancel_after_erases = Some((6, cancel.clone()));
        let err = session.flash_rom(&other, &cart, &opts, Some(&target), &tx, &cancel);
        assert!(matches!(err, Err(Error::Cancelled)));
        session.port_mut().cancel_after_erases = None;

        // The blanked sectors must not be skipped when the original comes
        // back; the untouched ones still hold it and may be
        let third = session
            .flash_rom(&original, &cart, &opts, Some(&target), &tx, &CancelToken::new())
            .unwrap();
        assert_eq!(third.sectors_erased, 2);
        assert_eq!(third.sectors_skipped, 2);
        assert!(third.bytes_written > 0);
        assert_eq!(&session.into_port().chip.mem[..], &original[..]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn flashing_the_same_image_twice_rewrites_zero_sectors() {
        let dir = std::env::temp_dir().join(format!("gbxflash-delta-xfer-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let target = dir.join("image.gba");

        let cart = agb_cart(0x40000, 0x10000);
        let data = patterned(0x40000);
        let (tx, _rx) = channel();
        let cancel = CancelToken::new();
        let opts = FlashOptions {
            verify: true,
            ..Default::default()
        };

        let mut session = Session::new(AgbNorPort::new(0x40000, 0x10000));
        let first = session
            .flash_rom(&data, &cart, &opts, Some(&target), &tx, &cancel)
            .unwrap();
        assert_eq!(first.sectors_erased, 4);
        assert_eq!(first.sectors_skipped, 0);

        let second = session
            .flash_rom(&data, &cart, &opts, Some(&target), &tx, &cancel)
            .unwrap();
        assert_eq!(second.sectors_erased, 0);
        assert_eq!(second.sectors_skipped, 4);
        assert_eq!(second.bytes_written, 0);

        // The chip never saw more than the first four erases
        assert_eq!(session.into_port().chip.erases.len(), 4);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn cancel_during_erase_leaves_nothing_programmed() {
        let cart = agb_cart(0xA0000, 0x10000);
        let data = patterned(0xA0000);
        let mut port = AgbNorPort::new(0xA0000, 0x10000);
        let cancel = CancelToken::new();
        port.cancel_after_erases = Some((3, cancel.clone()));
        let mut session = Session::new(port);
        let (tx, rx) = channel();

        let opts = FlashOptions {
            verify: true,
            ..Default::default()
        };
        let err = session
            .flash_rom(&data, &cart, &opts, None, &tx, &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let port = session.into_port();
        assert_eq!(port.chip.erases.len(), 3);
        assert_eq!(port.chip.program_words, 0);
        assert!(port.resets >= 1, "no safe reset was issued");

        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert!(matches!(events.last(), Some(ProgressEvent::Abort)));
    }

    #[test]
    fn oversized_image_is_rejected_before_touching_the_chip() {
        let cart = agb_cart(0x20000, 0x10000);
        let data = patterned(0x40000);
        let mut session = Session::new(AgbNorPort::new(0x20000, 0x10000));
        let (tx, _rx) = channel();

        let err = session
            .flash_rom(&data, &cart, &Default::default(), None, &tx, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::Catalog(_)));
        assert!(session.into_port().chip.erases.is_empty());
    }

    #[test]
    fn read_info_falls_back_to_dmg() {
        let mut port = DmgNorPort::new(0x8000, 0x4000);
        let rom = dmg_rom("INFOTEST", 0x1B, 0x00, 0x03, 0x8000);
        port.chip.mem.copy_from_slice(&rom);
        let mut session = Session::new(port);

        let info = session.read_info(None).unwrap();
        assert_eq!(info.platform, PortMode::Dmg);
        let h = info.dmg.unwrap();
        assert_eq!(h.title, "INFOTEST");
        assert_eq!(h.mapper, Some(MapperKind::Mbc5));
        assert_eq!(info.save_size, 0x8000);
    }

    #[test]
    fn dmg_backup_reads_through_all_banks() {
        let mut port = DmgNorPort::new(0x20000, 0x4000);
        // 128 KiB MBC5 cart, each bank carries its number
        let mut rom = dmg_rom("BANKTEST", 0x19, 0x02, 0x00, 0x20000);
        for bank in 0..8usize {
            for b in rom[bank * 0x4000..(bank + 1) * 0x4000].iter_mut() {
                if *b == 0 {
                    *b = bank as u8 | 0x40;
                }
            }
        }
        // Bank markers corrupt the checksum fields; restore them
        fix_checksums(&mut rom);
        port.chip.mem.copy_from_slice(&rom);
        let mut session = Session::new(port);
        let (tx, _rx) = channel();

        let dump = session
            .backup_rom(PortMode::Dmg, None, None, false, &tx, &CancelToken::new())
            .unwrap();
        assert_eq!(dump.len(), 0x20000);
        assert_eq!(dump, rom);
    }

    #[test]
    fn dmg_save_round_trips_through_banked_ram() {
        let rom = dmg_rom("SAVETEST", 0x1B, 0x00, 0x03, 0x8000);
        let mut port = DmgNorPort::new(0x8000, 0x4000);
        port.chip.mem.copy_from_slice(&rom);
        let mut session = Session::new(port);
        let (tx, _rx) = channel();
        let cancel = CancelToken::new();
        let opts = SaveOptions::default();

        let save = patterned(0x8000);
        session
            .restore_ram(PortMode::Dmg, &save, &opts, &tx, &cancel)
            .unwrap();
        let back = session
            .backup_ram(PortMode::Dmg, &opts, &tx, &cancel)
            .unwrap();
        assert_eq!(back, save);

        // RAM window left disabled afterwards
        assert!(!session.into_port().ram_enabled);
    }

    #[test]
    fn auto_detect_matches_by_flash_id() {
        // Two AGB entries, only the first one's id is on the mock chip
        let json = r#"[
            {
                "names": ["right chip"],
                "platform": "AGB",
                "command_set": "AMD",
                "flash_ids": [[1, 126]],
                "chip_size": 131072,
                "sector_size": 65536,
                "commands": {
                    "reset": [["0", "0xF0"]],
                    "read_identifier": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0x90"]],
                    "single_write": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0xA0"], ["PA", "PD"]]
                }
            },
            {
                "names": ["wrong chip"],
                "platform": "AGB",
                "command_set": "AMD",
                "flash_ids": [[194, 9]],
                "chip_size": 131072,
                "sector_size": 65536,
                "commands": {
                    "reset": [["0", "0xF0"]],
                    "read_identifier": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0x90"]],
                    "single_write": [["0xAAA", "0xAA"], ["0x555", "0x55"], ["0xAAA", "0xA0"], ["PA", "PD"]]
                }
            }
        ]"#;
        let catalog = Catalog::load_json(json).unwrap();

        let mut port = AgbNorPort::new(0x20000, 0x10000);
        port.chip.id = vec![0x01, 0x7E];
        let mut session = Session::new(port);

        let found = session
            .auto_detect_flash(&catalog, PortMode::Agb, None)
            .unwrap();
        assert_eq!(found, vec!["right chip".to_string()]);
    }

    #[test]
    fn rtc_trailer_round_trips() {
        let snap = RtcSnapshot {
            seconds: 1,
            minutes: 2,
            hours: 3,
            days: 400,
            halted: false,
            day_carry: true,
            captured_at: 1_720_000_000,
        };
        let raw = encode_rtc_trailer(&snap);
        assert_eq!(decode_rtc_trailer(&raw), Some(snap));

        let mut file = vec![0u8; 0x2000];
        file.extend_from_slice(&raw);
        let (ram, trailer) = split_rtc_trailer(&file, 0x2000);
        assert_eq!(ram.len(), 0x2000);
        assert_eq!(trailer, Some(snap));
    }

    #[test]
    fn background_job_reports_events_and_joins() {
        let mut port = DmgNorPort::new(0x8000, 0x4000);
        let rom = dmg_rom("JOBTEST", 0x19, 0x00, 0x00, 0x8000);
        port.chip.mem.copy_from_slice(&rom);
        let session = Session::new(port);

        let job = session.spawn(Operation::BackupRom {
            platform: PortMode::Dmg,
            mapper_hint: None,
            rom_size: None,
            fast_read: false,
        });
        let outcome = job.join().unwrap();
        match outcome {
            Outcome::Rom(data) => assert_eq!(data, rom),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
