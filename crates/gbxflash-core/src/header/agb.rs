//! Game Boy Advance cartridge header parsing
//!
//! The 192-byte header sits at the very start of the ROM. Save hardware is
//! not declared anywhere in it; the SDK embeds an ID string in the binary
//! instead, so detection scans the whole dump.

use crate::header::{decode_title, sha1_hex};

/// SHA-1 of the 156-byte compressed boot logo at 0x04..0xA0
const LOGO_SHA1: &str = "17daa0fec02fc33c0f6abb549a8b80b6613b48ee";

/// Backing store behind the cartridge save pins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgbSaveType {
    None,
    Sram32K,
    Flash64K,
    Flash128K,
    Eeprom512,
    Eeprom8K,
}

impl AgbSaveType {
    pub fn byte_len(self) -> u32 {
        match self {
            AgbSaveType::None => 0,
            AgbSaveType::Sram32K => 0x8000,
            AgbSaveType::Flash64K => 0x10000,
            AgbSaveType::Flash128K => 0x20000,
            AgbSaveType::Eeprom512 => 0x200,
            AgbSaveType::Eeprom8K => 0x2000,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            AgbSaveType::None => "none",
            AgbSaveType::Sram32K => "SRAM 32K",
            AgbSaveType::Flash64K => "FLASH 64K",
            AgbSaveType::Flash128K => "FLASH 128K",
            AgbSaveType::Eeprom512 => "EEPROM 512B",
            AgbSaveType::Eeprom8K => "EEPROM 8K",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgbHeader {
    pub title: String,
    /// Four-character game code at 0xAC
    pub game_code: String,
    pub maker_code: String,
    pub version: u8,
    pub logo_correct: bool,
    /// Fixed 0x96 marker at 0xB2, checked by the BIOS alongside the logo
    pub fixed_byte_correct: bool,
    pub checksum: u8,
    pub checksum_calc: u8,
    pub checksum_correct: bool,
    /// CRC-32 of the full buffer, the key into the header database
    pub rom_crc32: u32,
    pub header_sha1: String,
    /// Save hardware found by the ID string scan
    pub save_type: AgbSaveType,
}

fn byte(rom: &[u8], off: usize) -> u8 {
    rom.get(off).copied().unwrap_or(0xFF)
}

/// Complement checksum over 0xA0..=0xBC, stored at 0xBD
fn header_checksum(rom: &[u8]) -> u8 {
    let mut sum: u8 = 0;
    for off in 0xA0..=0xBC {
        sum = sum.wrapping_add(byte(rom, off));
    }
    0u8.wrapping_sub(sum.wrapping_add(0x19))
}

/// SDK save-library ID strings. The longer FLASH variants must be checked
/// before the bare `FLASH_V` prefix they share.
const SAVE_IDS: &[(&[u8], AgbSaveType)] = &[
    (b"EEPROM_V", AgbSaveType::Eeprom8K),
    (b"SRAM_V", AgbSaveType::Sram32K),
    (b"SRAM_F_V", AgbSaveType::Sram32K),
    (b"FLASH512_V", AgbSaveType::Flash64K),
    (b"FLASH1M_V", AgbSaveType::Flash128K),
    (b"FLASH_V", AgbSaveType::Flash64K),
];

/// Scan the dump for an SDK save ID string. At the first position that
/// matches anything, the longest ID wins so that FLASH512_V does not
/// register as FLASH_V.
pub fn detect_save_type(rom: &[u8]) -> AgbSaveType {
    let mut first = usize::MAX;
    for &(id, _) in SAVE_IDS {
        if let Some(pos) = find(rom, id) {
            first = first.min(pos);
        }
    }
    if first == usize::MAX {
        return AgbSaveType::None;
    }
    let mut chosen = AgbSaveType::None;
    let mut len = 0;
    for &(id, ty) in SAVE_IDS {
        if rom[first..].starts_with(id) && id.len() > len {
            chosen = ty;
            len = id.len();
        }
    }
    chosen
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse an AGB header; never fails
pub fn parse(rom: &[u8]) -> AgbHeader {
    let logo: Vec<u8> = (0x04..0xA0).map(|o| byte(rom, o)).collect();
    let header: Vec<u8> = (0..0xC0).map(|o| byte(rom, o)).collect();
    let checksum = byte(rom, 0xBD);
    let calc = header_checksum(rom);

    AgbHeader {
        title: decode_title(&header[0xA0..0xAC]),
        game_code: decode_title(&header[0xAC..0xB0]),
        maker_code: decode_title(&header[0xB0..0xB2]),
        version: byte(rom, 0xBC),
        logo_correct: sha1_hex(&logo) == LOGO_SHA1,
        fixed_byte_correct: byte(rom, 0xB2) == 0x96,
        checksum,
        checksum_calc: calc,
        checksum_correct: checksum == calc,
        rom_crc32: crc32fast::hash(rom),
        header_sha1: sha1_hex(&header),
        save_type: detect_save_type(rom),
    }
}

/// Trailing 0xFF padding past the last meaningful byte. Used to trim a full
/// oversized dump down to the real ROM image.
pub fn trimmed_len(rom: &[u8]) -> usize {
    let mut end = rom.len();
    while end > 0 && rom[end - 1] == 0xFF {
        end -= 1;
    }
    // Keep at least the header even for a blank chip dump
    end.max(0xC0.min(rom.len()))
}
