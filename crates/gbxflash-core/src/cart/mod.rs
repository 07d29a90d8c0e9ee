//! Cartridge type catalog
//!
//! Flashable cartridges are described by JSON entries shipped next to the
//! binary. The whole file is validated up front into typed descriptors;
//! a bad command set or a malformed operand fails the load, never a later
//! flash run.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::link::{PortMode, Voltage, WritePin};

/// Flash command-set family. Selects the program strategy and the status
/// polling style in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSet {
    /// Plain SRAM-style writes, no flash protocol
    None,
    Amd,
    Intel,
    Sharp,
    Sst,
    /// Nintendo Power GB-Memory (G-MMC1 front end)
    GbMemory,
    /// Datel Orbit/Action Replay style
    Datel,
    /// GBA movie-player bootlegs
    MoviePlayer,
}

impl CommandSet {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(CommandSet::None),
            "AMD" => Some(CommandSet::Amd),
            "INTEL" => Some(CommandSet::Intel),
            "SHARP" => Some(CommandSet::Sharp),
            "SST" => Some(CommandSet::Sst),
            "GBMEMORY" => Some(CommandSet::GbMemory),
            "DATEL" => Some(CommandSet::Datel),
            "MOVIEPLAYER" => Some(CommandSet::MoviePlayer),
            _ => None,
        }
    }
}

/// Address operand of one command step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrToken {
    Fixed(u32),
    /// Resolved against the sector base at run time
    SectorAddr,
    /// Resolved against the current program address
    ProgramAddr,
}

/// Data operand of one command step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataToken {
    Fixed(u16),
    /// The data word being programmed
    ProgramData,
    /// Buffered-write word count minus one
    BufferCount,
}

/// One bus write of a command sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStep {
    pub addr: AddrToken,
    pub data: DataToken,
}

/// One polling step: read `addr` until the masked value matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStep {
    pub addr: AddrToken,
    pub value: u16,
    pub mask: u16,
}

/// Validated command sequences for one cartridge type. Empty sequences
/// mean the operation does not exist on this hardware.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    pub unlock: Vec<CommandStep>,
    /// Dummy reads some carts require after unlock
    pub unlock_reads: Vec<u32>,
    pub reset: Vec<CommandStep>,
    pub read_identifier: Vec<CommandStep>,
    pub read_cfi: Vec<CommandStep>,
    pub chip_erase: Vec<CommandStep>,
    pub chip_erase_wait: Vec<WaitStep>,
    pub sector_erase: Vec<CommandStep>,
    pub sector_erase_wait: Vec<WaitStep>,
    pub single_write: Vec<CommandStep>,
    pub buffer_write: Vec<CommandStep>,
    pub buffer_write_wait: Vec<WaitStep>,
    pub read_status: Vec<CommandStep>,
}

/// Where the sector layout comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectorSource {
    /// Fixed `(size, count)` regions from the catalog entry
    Static(Vec<(u32, u32)>),
    /// Query the chip's CFI table at run time
    Cfi,
    /// No sector erase; chip erase only
    ChipEraseOnly,
}

/// Immutable descriptor for one flashable cartridge type
#[derive(Debug, Clone)]
pub struct CartType {
    pub names: Vec<String>,
    pub platform: PortMode,
    pub voltage: Voltage,
    pub command_set: CommandSet,
    pub commands: CommandTable,
    /// Known autoselect IDs; empty disables the identify check
    pub flash_ids: Vec<Vec<u8>>,
    pub chip_size: u32,
    pub sectors: SectorSource,
    /// Buffered-write length in bytes, 0 = unbuffered only
    pub buffer_size: u32,
    pub write_pin: WritePin,
    /// DMG: command addresses below 0x4000 are issued through bank 1
    pub flash_commands_on_bank_1: bool,
    pub pulse_reset_after_write: bool,
    /// Two dies, commands mirrored at half size
    pub double_die: bool,
    /// Sector list stored top-down
    pub sector_reversal: bool,
    /// Entry exists in both 3.3V and 5V wirings
    pub voltage_variants: bool,
}

impl CartType {
    pub fn name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or("(unnamed)")
    }
}

// ---------------------------------------------------------------------------
// JSON deserialization types (intermediate format)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Token {
    Num(u64),
    Text(String),
}

impl Token {
    fn number(&self) -> Option<u64> {
        match self {
            Token::Num(n) => Some(*n),
            Token::Text(t) => {
                let t = t.trim();
                if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                    u64::from_str_radix(hex, 16).ok()
                } else {
                    t.parse().ok()
                }
            }
        }
    }
}

type StepDef = (Token, Token);

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct CommandsDef {
    unlock: Vec<StepDef>,
    unlock_reads: Vec<Token>,
    reset: Vec<StepDef>,
    read_identifier: Vec<StepDef>,
    read_cfi: Vec<StepDef>,
    chip_erase: Vec<StepDef>,
    chip_erase_wait: Vec<StepDef>,
    sector_erase: Vec<StepDef>,
    sector_erase_wait: Vec<StepDef>,
    single_write: Vec<StepDef>,
    buffer_write: Vec<StepDef>,
    buffer_write_wait: Vec<StepDef>,
    read_status: Vec<StepDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SectorsDef {
    Uniform(Token),
    Regions(Vec<(Token, u32)>),
}

#[derive(Debug, Clone, Deserialize)]
struct CartDef {
    names: Vec<String>,
    platform: String,
    #[serde(default)]
    voltage: Option<String>,
    command_set: String,
    #[serde(default)]
    commands: CommandsDef,
    #[serde(default)]
    flash_ids: Vec<Vec<u8>>,
    /// Bytes, as a number or a hex string
    chip_size: Token,
    #[serde(default)]
    sector_size: Option<SectorsDef>,
    #[serde(default)]
    sector_size_from_cfi: bool,
    #[serde(default)]
    buffer_size: u32,
    #[serde(default)]
    write_pin: Option<String>,
    #[serde(default)]
    flash_commands_on_bank_1: bool,
    #[serde(default)]
    pulse_reset_after_write: bool,
    #[serde(default)]
    double_die: bool,
    #[serde(default)]
    sector_reversal: bool,
    #[serde(default)]
    voltage_variants: bool,
}

fn bad(entry: &str, what: impl std::fmt::Display) -> Error {
    Error::Catalog(format!("{entry}: {what}"))
}

fn parse_addr(entry: &str, tok: &Token) -> Result<AddrToken> {
    match tok {
        Token::Text(t) if t == "SA" => Ok(AddrToken::SectorAddr),
        Token::Text(t) if t == "PA" => Ok(AddrToken::ProgramAddr),
        _ => match tok.number() {
            Some(n) if n <= u32::MAX as u64 => Ok(AddrToken::Fixed(n as u32)),
            _ => Err(bad(entry, format_args!("bad address operand {tok:?}"))),
        },
    }
}

fn parse_data(entry: &str, tok: &Token) -> Result<DataToken> {
    match tok {
        Token::Text(t) if t == "PD" => Ok(DataToken::ProgramData),
        Token::Text(t) if t == "BC" => Ok(DataToken::BufferCount),
        _ => match tok.number() {
            Some(n) if n <= u16::MAX as u64 => Ok(DataToken::Fixed(n as u16)),
            _ => Err(bad(entry, format_args!("bad data operand {tok:?}"))),
        },
    }
}

fn parse_steps(entry: &str, defs: &[StepDef]) -> Result<Vec<CommandStep>> {
    defs.iter()
        .map(|(a, d)| {
            Ok(CommandStep {
                addr: parse_addr(entry, a)?,
                data: parse_data(entry, d)?,
            })
        })
        .collect()
}

fn parse_waits(entry: &str, defs: &[StepDef]) -> Result<Vec<WaitStep>> {
    defs.iter()
        .map(|(a, d)| {
            let value = match d.number() {
                Some(n) if n <= u16::MAX as u64 => n as u16,
                _ => return Err(bad(entry, format_args!("bad wait value {d:?}"))),
            };
            Ok(WaitStep {
                addr: parse_addr(entry, a)?,
                value,
                // Polls compare the full data word; DQ-level masks are the
                // engine's business, driven by the command set
                mask: 0xFFFF,
            })
        })
        .collect()
}

fn parse_voltage(entry: &str, v: Option<&str>, platform: PortMode) -> Result<Voltage> {
    match v {
        None => Ok(match platform {
            PortMode::Dmg => Voltage::V5,
            PortMode::Agb => Voltage::V3_3,
        }),
        Some("3.3V") | Some("3.3") => Ok(Voltage::V3_3),
        Some("5V") | Some("5") => Ok(Voltage::V5),
        Some(other) => Err(bad(entry, format_args!("unknown voltage {other:?}"))),
    }
}

fn validate(def: CartDef) -> Result<CartType> {
    let entry = def
        .names
        .first()
        .cloned()
        .unwrap_or_else(|| "(unnamed entry)".into());
    if def.names.is_empty() {
        return Err(bad(&entry, "entry has no names"));
    }

    let platform = match def.platform.as_str() {
        "DMG" => PortMode::Dmg,
        "AGB" => PortMode::Agb,
        other => return Err(bad(&entry, format_args!("unknown platform {other:?}"))),
    };

    let command_set = CommandSet::parse(&def.command_set)
        .ok_or_else(|| bad(&entry, format_args!("unknown command set {:?}", def.command_set)))?;

    let write_pin = match def.write_pin.as_deref() {
        None | Some("WR") => WritePin::Wr,
        Some("AUDIO") => WritePin::Audio,
        Some("WR+RESET") => WritePin::WrReset,
        Some(other) => return Err(bad(&entry, format_args!("unknown write pin {other:?}"))),
    };

    let chip_size = match def.chip_size.number() {
        Some(n) if n > 0 && n <= u32::MAX as u64 => n as u32,
        _ => return Err(bad(&entry, format_args!("bad chip size {:?}", def.chip_size))),
    };

    let sectors = if def.sector_size_from_cfi {
        SectorSource::Cfi
    } else {
        match def.sector_size {
            Some(SectorsDef::Uniform(tok)) => {
                let size = match tok.number() {
                    Some(n) if n > 0 && n <= u32::MAX as u64 => n as u32,
                    _ => return Err(bad(&entry, format_args!("bad sector size {tok:?}"))),
                };
                if chip_size % size != 0 {
                    return Err(bad(
                        &entry,
                        format_args!("sector size {size:#x} does not divide chip size"),
                    ));
                }
                SectorSource::Static(vec![(size, chip_size / size)])
            }
            Some(SectorsDef::Regions(defs)) => {
                let mut regions = Vec::with_capacity(defs.len());
                for (tok, count) in &defs {
                    match tok.number() {
                        Some(n) if n > 0 && n <= u32::MAX as u64 => {
                            regions.push((n as u32, *count))
                        }
                        _ => {
                            return Err(bad(
                                &entry,
                                format_args!("bad sector region size {tok:?}"),
                            ))
                        }
                    }
                }
                let covered: u64 = regions.iter().map(|(s, c)| *s as u64 * *c as u64).sum();
                if covered != chip_size as u64 {
                    return Err(bad(
                        &entry,
                        format_args!("sector regions cover {covered:#x} of {chip_size:#x}"),
                    ));
                }
                SectorSource::Static(regions)
            }
            None => SectorSource::ChipEraseOnly,
        }
    };

    let c = &def.commands;
    let unlock_reads = c
        .unlock_reads
        .iter()
        .map(|t| match t.number() {
            Some(n) if n <= u32::MAX as u64 => Ok(n as u32),
            _ => Err(bad(&entry, format_args!("bad unlock read address {t:?}"))),
        })
        .collect::<Result<Vec<u32>>>()?;

    let commands = CommandTable {
        unlock: parse_steps(&entry, &c.unlock)?,
        unlock_reads,
        reset: parse_steps(&entry, &c.reset)?,
        read_identifier: parse_steps(&entry, &c.read_identifier)?,
        read_cfi: parse_steps(&entry, &c.read_cfi)?,
        chip_erase: parse_steps(&entry, &c.chip_erase)?,
        chip_erase_wait: parse_waits(&entry, &c.chip_erase_wait)?,
        sector_erase: parse_steps(&entry, &c.sector_erase)?,
        sector_erase_wait: parse_waits(&entry, &c.sector_erase_wait)?,
        single_write: parse_steps(&entry, &c.single_write)?,
        buffer_write: parse_steps(&entry, &c.buffer_write)?,
        buffer_write_wait: parse_waits(&entry, &c.buffer_write_wait)?,
        read_status: parse_steps(&entry, &c.read_status)?,
    };

    if !commands.buffer_write.is_empty() && def.buffer_size == 0 {
        return Err(bad(&entry, "buffer_write sequence without buffer_size"));
    }

    Ok(CartType {
        voltage: parse_voltage(&entry, def.voltage.as_deref(), platform)?,
        names: def.names,
        platform,
        command_set,
        commands,
        flash_ids: def.flash_ids,
        chip_size,
        sectors,
        buffer_size: def.buffer_size,
        write_pin,
        flash_commands_on_bank_1: def.flash_commands_on_bank_1,
        pulse_reset_after_write: def.pulse_reset_after_write,
        double_die: def.double_die,
        sector_reversal: def.sector_reversal,
        voltage_variants: def.voltage_variants,
    })
}

/// Runtime cartridge type catalog
#[derive(Debug, Default)]
pub struct Catalog {
    entries: Vec<CartType>,
}

impl Catalog {
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::load_json(&content)
    }

    pub fn load_json(content: &str) -> Result<Self> {
        let defs: Vec<CartDef> = serde_json::from_str(content)
            .map_err(|e| Error::Catalog(format!("catalog parse: {e}")))?;
        let entries = defs.into_iter().map(validate).collect::<Result<Vec<_>>>()?;
        log::debug!("cartridge catalog loaded, {} types", entries.len());
        Ok(Catalog { entries })
    }

    pub fn entries(&self) -> &[CartType] {
        &self.entries
    }

    pub fn for_platform(&self, platform: PortMode) -> impl Iterator<Item = &CartType> {
        self.entries.iter().filter(move |e| e.platform == platform)
    }

    /// Case-insensitive match against any of an entry's names
    /// Case-insensitive name lookup. An exact match wins; otherwise the
    /// leading token of a name matches, so `AM29F016B` finds the entry
    /// named "AM29F016B (AUDIO)".
    pub fn find_by_name(&self, name: &str) -> Option<&CartType> {
        let lower = name.to_lowercase();
        self.entries
            .iter()
            .find(|e| e.names.iter().any(|n| n.to_lowercase() == lower))
            .or_else(|| {
                self.entries.iter().find(|e| {
                    e.names.iter().any(|n| {
                        let n = n.to_lowercase();
                        n.split_whitespace().next() == Some(lower.as_str())
                    })
                })
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
