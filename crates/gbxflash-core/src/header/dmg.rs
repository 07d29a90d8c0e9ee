//! Game Boy (DMG) cartridge header parsing
//!
//! The header lives at 0x100..0x150 of the ROM. `parse` accepts anything
//! from a bare header window up to the full dump; the global checksum is
//! computed over whatever was passed in.

use crate::header::{decode_title, sha1_hex};
use crate::mapper::MapperKind;

/// Offset of the header block within the ROM
pub const HEADER_START: usize = 0x100;
/// First byte past the header block
pub const HEADER_END: usize = 0x150;

/// The boot logo bitmap at 0x104..0x134
pub const NINTENDO_LOGO: [u8; 48] = [
    0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B, 0x03, 0x73, 0x00, 0x83, 0x00, 0x0C, 0x00,
    0x0D, 0x00, 0x08, 0x11, 0x1F, 0x88, 0x89, 0x00, 0x0E, 0xDC, 0xCC, 0x6E, 0xE6, 0xDD, 0xDD,
    0xD9, 0x99, 0xBB, 0xBB, 0x67, 0x63, 0x6E, 0x0E, 0xEC, 0xCC, 0xDD, 0xDC, 0x99, 0x9F, 0xBB,
    0xB9, 0x33, 0x3E,
];

/// SHA-1 of `NINTENDO_LOGO`; logo validation goes through the hash so that
/// byte-for-byte reproductions elsewhere in the dump do not matter
const LOGO_SHA1: &str = "0745fdef34132d1b3d488cfbdf0379a39fd54b4c";

/// Parsed DMG header with correctness flags
#[derive(Debug, Clone)]
pub struct DmgHeader {
    pub title: String,
    pub cgb_only: bool,
    pub sgb_support: bool,
    /// Raw cartridge-type byte at 0x147
    pub cart_type: u8,
    /// Classified mapper, possibly rewritten by a heuristic; `None` when the
    /// type byte is unknown (callers must treat that as fatal, not default)
    pub mapper: Option<MapperKind>,
    pub rom_size: u32,
    pub rom_banks: u32,
    pub ram_size: u32,
    pub has_battery: bool,
    pub has_rtc: bool,
    pub logo_correct: bool,
    pub header_checksum: u8,
    pub header_checksum_calc: u8,
    pub header_checksum_correct: bool,
    pub rom_checksum: u16,
    pub rom_checksum_calc: u16,
    pub rom_checksum_correct: bool,
    /// SHA-1 over 0x100..0x150, the key into the header database
    pub header_sha1: String,
    /// Names of the rewrite heuristics that fired
    pub overrides: Vec<&'static str>,
}

fn byte(rom: &[u8], off: usize) -> u8 {
    rom.get(off).copied().unwrap_or(0xFF)
}

/// ROM size byte at 0x148 to (bytes, banks)
fn decode_rom_size(code: u8) -> (u32, u32) {
    match code {
        0x00..=0x08 => {
            let banks = 2u32 << code;
            (banks * 0x4000, banks)
        }
        // Rare non-power-of-two codes found on some carts
        0x52 => (72 * 0x4000, 72),
        0x53 => (80 * 0x4000, 80),
        0x54 => (96 * 0x4000, 96),
        _ => (0x8000, 2),
    }
}

/// RAM size byte at 0x149 to bytes
fn decode_ram_size(code: u8) -> u32 {
    match code {
        0x01 => 0x800,
        0x02 => 0x2000,
        0x03 => 0x8000,
        0x04 => 0x20000,
        0x05 => 0x10000,
        _ => 0,
    }
}

/// Cartridge-type byte to mapper family
pub fn classify_mapper(cart_type: u8) -> Option<MapperKind> {
    match cart_type {
        0x00 | 0x08 | 0x09 => Some(MapperKind::None),
        0x01..=0x03 => Some(MapperKind::Mbc1),
        0x05 | 0x06 => Some(MapperKind::Mbc2),
        0x0B..=0x0D => Some(MapperKind::Mmm01),
        0x0F..=0x13 => Some(MapperKind::Mbc3),
        0x19..=0x1E => Some(MapperKind::Mbc5),
        0x20 => Some(MapperKind::Mbc6),
        0x22 => Some(MapperKind::Mbc7),
        0xFD => Some(MapperKind::Tama5),
        0xFE => Some(MapperKind::Huc3),
        0xFF => Some(MapperKind::Huc1),
        _ => None,
    }
}

fn has_battery(cart_type: u8) -> bool {
    matches!(
        cart_type,
        0x03 | 0x06 | 0x09 | 0x0D | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E | 0x22 | 0xFD | 0xFE | 0xFF
    )
}

fn has_rtc(cart_type: u8) -> bool {
    matches!(cart_type, 0x0F | 0x10 | 0xFD | 0xFE)
}

/// Parse a DMG header; never fails
pub fn parse(rom: &[u8]) -> DmgHeader {
    let title = decode_title(&collect(rom, 0x134, 16));
    let cgb_flag = byte(rom, 0x143);
    let cart_type = byte(rom, 0x147);
    // A buffer too short to hold a header carries no trustworthy fields;
    // the 0xFF padding would otherwise classify as a HuC-1 cart
    let complete = rom.len() >= HEADER_END;
    let (rom_size, rom_banks) = if complete {
        decode_rom_size(byte(rom, 0x148))
    } else {
        (0, 0)
    };
    let mut ram_size = if complete {
        decode_ram_size(byte(rom, 0x149))
    } else {
        0
    };
    let mapper = if complete {
        classify_mapper(cart_type)
    } else {
        None
    };

    // MBC2 and MBC7 carry their storage on the controller itself; the RAM
    // size byte is 0 on those carts
    match mapper {
        Some(MapperKind::Mbc2) => ram_size = 0x200,
        Some(MapperKind::Mbc7) => ram_size = 0x100,
        _ => {}
    }

    // Header checksum over 0x134..=0x14C
    let mut hc: u8 = 0;
    for off in 0x134..=0x14C {
        hc = hc.wrapping_sub(byte(rom, off)).wrapping_sub(1);
    }
    let header_checksum = byte(rom, 0x14D);

    // Global checksum: 16-bit sum of every byte except the two checksum
    // bytes, stored big-endian at 0x14E
    let mut gc: u16 = 0;
    for (off, &b) in rom.iter().enumerate() {
        if off != 0x14E && off != 0x14F {
            gc = gc.wrapping_add(b as u16);
        }
    }
    let rom_checksum = u16::from_be_bytes([byte(rom, 0x14E), byte(rom, 0x14F)]);

    let logo_correct = sha1_hex(&collect(rom, 0x104, 48)) == LOGO_SHA1;
    let header_sha1 = sha1_hex(&collect(rom, HEADER_START, HEADER_END - HEADER_START));

    let mut header = DmgHeader {
        title,
        cgb_only: cgb_flag == 0xC0,
        sgb_support: byte(rom, 0x146) == 0x03,
        cart_type,
        mapper,
        rom_size,
        rom_banks,
        ram_size,
        has_battery: has_battery(cart_type),
        has_rtc: has_rtc(cart_type),
        logo_correct,
        header_checksum,
        header_checksum_calc: hc,
        header_checksum_correct: header_checksum == hc,
        rom_checksum,
        rom_checksum_calc: gc,
        rom_checksum_correct: rom_checksum == gc,
        header_sha1,
        overrides: Vec::new(),
    };

    apply_overrides(&mut header, rom);
    header
}

fn collect(rom: &[u8], off: usize, len: usize) -> Vec<u8> {
    (off..off + len).map(|o| byte(rom, o)).collect()
}

/// Recompute and patch the two checksums in place (used by `--fix-header`)
pub fn fix_checksums(rom: &mut [u8]) {
    if rom.len() < HEADER_END {
        return;
    }
    let mut hc: u8 = 0;
    for off in 0x134..=0x14C {
        hc = hc.wrapping_sub(rom[off]).wrapping_sub(1);
    }
    rom[0x14D] = hc;
    rom[0x14E] = 0;
    rom[0x14F] = 0;
    let mut gc: u16 = 0;
    for &b in rom.iter() {
        gc = gc.wrapping_add(b as u16);
    }
    rom[0x14E] = (gc >> 8) as u8;
    rom[0x14F] = (gc & 0xFF) as u8;
}

// ---------------------------------------------------------------------------
// Header rewrite heuristics
// ---------------------------------------------------------------------------

/// Field overrides a single heuristic may apply
struct Rule {
    name: &'static str,
    matches: Match,
    mapper: Option<MapperKind>,
    rom_size: Option<u32>,
    ram_size: Option<u32>,
}

enum Match {
    /// Exact title string
    Title(&'static str),
    /// Title prefix
    TitlePrefix(&'static str),
}

/// Known non-standard cartridges whose headers lie about the hardware.
/// Each entry names a concrete cart family; the override wins over whatever
/// the type/size bytes claim.
const RULES: &[Rule] = &[
    // Nintendo Power GB-Memory cartridge: menu header claims plain MBC but
    // the flash is driven through the G-MMC1 controller
    Rule {
        name: "gb-memory menu",
        matches: Match::TitlePrefix("NP M-MENU"),
        mapper: Some(MapperKind::GbMemory),
        rom_size: Some(0x100000),
        ram_size: Some(0x20000),
    },
    Rule {
        name: "gb-memory cart",
        matches: Match::TitlePrefix("DMG MULTI"),
        mapper: Some(MapperKind::GbMemory),
        rom_size: Some(0x100000),
        ram_size: None,
    },
    // The M161 Tetris compilation reports ROM-only
    Rule {
        name: "m161 tetris set",
        matches: Match::Title("TETRIS SET"),
        mapper: Some(MapperKind::M161),
        rom_size: Some(0x40000),
        ram_size: None,
    },
    // Momotarou Collection reports MBC1 but is wired as MMM01
    Rule {
        name: "mmm01 momocol",
        matches: Match::TitlePrefix("MOMOCOL"),
        mapper: Some(MapperKind::Mmm01),
        rom_size: Some(0x100000),
        ram_size: None,
    },
    Rule {
        name: "mmm01 bomcol",
        matches: Match::TitlePrefix("BOMCOL"),
        mapper: Some(MapperKind::Mmm01),
        rom_size: Some(0x100000),
        ram_size: None,
    },
    // Japanese Pocket Monsters Crystal: MBC3 type byte, MBC30 wiring with
    // 64 KiB SRAM instead of the declared 32 KiB
    Rule {
        name: "mbc30 sram",
        matches: Match::TitlePrefix("PM_CRYSTAL"),
        mapper: Some(MapperKind::Mbc3),
        rom_size: None,
        ram_size: Some(0x10000),
    },
    // Game Boy Camera: MBC-like controller with 128 KiB SRAM, RAM size
    // byte is wrong on some regional revisions
    Rule {
        name: "pocket camera sram",
        matches: Match::TitlePrefix("GAMEBOYCAMERA"),
        mapper: None,
        rom_size: None,
        ram_size: Some(0x20000),
    },
];

fn apply_overrides(h: &mut DmgHeader, rom: &[u8]) {
    for rule in RULES {
        let hit = match rule.matches {
            Match::Title(t) => h.title == t,
            Match::TitlePrefix(p) => h.title.starts_with(p),
        };
        if !hit {
            continue;
        }
        log::debug!("header heuristic fired: {}", rule.name);
        if let Some(m) = rule.mapper {
            h.mapper = Some(m);
        }
        if let Some(s) = rule.rom_size {
            h.rom_size = s;
            h.rom_banks = s / 0x4000;
        }
        if let Some(s) = rule.ram_size {
            h.ram_size = s;
        }
        h.overrides.push(rule.name);
    }

    // MBC1 multicarts expose a second boot logo at the start of bank 0x10;
    // the type byte cannot distinguish them from plain MBC1
    if h.mapper == Some(MapperKind::Mbc1) && h.rom_banks >= 0x20 {
        let off = 0x10 * 0x4000 + 0x104;
        if off + 48 <= rom.len() && sha1_hex(&rom[off..off + 48]) == LOGO_SHA1 {
            log::debug!("header heuristic fired: mbc1m second logo");
            h.mapper = Some(MapperKind::Mbc1Multi);
            h.overrides.push("mbc1m second logo");
        }
    }
}
