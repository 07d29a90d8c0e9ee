//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

#[derive(Parser)]
#[command(name = "gbxflash")]
#[command(author, version, about = "Game Boy / Game Boy Advance cartridge flasher", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Serial port of the bridge (auto-detected when only one exists)
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    /// Serial baud rate (defaults to the bridge's native rate)
    #[arg(long, global = true)]
    pub baud: Option<u32>,

    /// Path to the cartridge catalog JSON
    /// Defaults to ./data/carts.json and /usr/share/gbxflash/carts.json
    #[arg(long, global = true)]
    pub catalog: Option<PathBuf>,

    /// Path to the ROM hash database JSON
    #[arg(long, global = true)]
    pub hash_db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show header information for the inserted cartridge
    Info,

    /// List serial ports that could be a bridge
    ListPorts,

    /// List the flashable cartridge types in the catalog
    ListCarts {
        /// Restrict to one platform (DMG or AGB)
        #[arg(long)]
        platform: Option<String>,
    },

    /// Try every catalog identify sequence and report matches
    Detect {
        /// Platform to probe (DMG or AGB)
        #[arg(long)]
        platform: String,

        /// Only try entries at this voltage (3.3V or 5V)
        #[arg(long)]
        voltage: Option<String>,
    },

    /// Identify one cartridge type's flash chip and dump its CFI table
    CheckChip {
        /// Catalog entry name
        #[arg(short, long)]
        cart: String,
    },

    /// Dump the cartridge ROM to a file
    BackupRom {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Override the mapper detected from the header
        #[arg(long)]
        mapper: Option<String>,

        /// Override the ROM size in bytes (hex or decimal)
        #[arg(long, value_parser = parse_hex_u32)]
        size: Option<u32>,

        /// Read whole banks per transfer (fewer progress updates)
        #[arg(long)]
        fast_read: bool,
    },

    /// Write a ROM image to a flashable cartridge
    FlashRom {
        /// Input ROM file
        #[arg(short, long)]
        input: PathBuf,

        /// Catalog entry name for the cartridge
        #[arg(short, long)]
        cart: String,

        /// Erase the whole chip instead of per-sector
        #[arg(long)]
        chip_erase: bool,

        /// Skip the read-back verify pass
        #[arg(long)]
        no_verify: bool,

        /// Rewrite every sector even if a delta manifest matches
        #[arg(long)]
        no_delta: bool,

        /// Recompute DMG header checksums before programming
        #[arg(long)]
        fix_header: bool,

        /// Override the catalog voltage (3.3V or 5V)
        #[arg(long)]
        voltage: Option<String>,
    },

    /// Back up save RAM (and optionally the RTC) to a file
    BackupSave {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// AGB save type (SRAM_32K, FLASH_64K, FLASH_128K, EEPROM_512, EEPROM_8K)
        #[arg(long)]
        save_type: Option<String>,

        /// Override the mapper detected from the header
        #[arg(long)]
        mapper: Option<String>,

        /// Append the real-time clock state to the save
        #[arg(long)]
        rtc: bool,
    },

    /// Restore save RAM (and optionally the RTC) from a file
    RestoreSave {
        /// Input save file
        #[arg(short, long)]
        input: PathBuf,

        /// AGB save type (SRAM_32K, FLASH_64K, FLASH_128K, EEPROM_512, EEPROM_8K)
        #[arg(long)]
        save_type: Option<String>,

        /// Override the mapper detected from the header
        #[arg(long)]
        mapper: Option<String>,

        /// Restore the real-time clock from the save's trailer
        #[arg(long)]
        rtc: bool,

        /// Wipe save memory the input file does not cover
        #[arg(long)]
        erase: bool,
    },
}
