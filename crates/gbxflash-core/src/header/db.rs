//! Known-cartridge database
//!
//! A JSON file keyed by header SHA-1 that recovers authoritative metadata
//! when the on-cart header is damaged or lies (common on bootlegs). Missing
//! file or missing entry is never an error.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::header::agb::AgbSaveType;

#[derive(Debug, Clone, Deserialize)]
pub struct DbEntry {
    pub display_name: String,
    pub rom_size: u32,
    #[serde(default)]
    pub save_size: u32,
    #[serde(default)]
    pub save_type: Option<String>,
    #[serde(default)]
    pub rom_crc32: Option<u32>,
}

impl DbEntry {
    /// Decode the AGB save-type tag, if the entry carries one
    pub fn agb_save_type(&self) -> Option<AgbSaveType> {
        match self.save_type.as_deref()? {
            "SRAM_32K" => Some(AgbSaveType::Sram32K),
            "FLASH_64K" => Some(AgbSaveType::Flash64K),
            "FLASH_128K" => Some(AgbSaveType::Flash128K),
            "EEPROM_512" => Some(AgbSaveType::Eeprom512),
            "EEPROM_8K" => Some(AgbSaveType::Eeprom8K),
            "NONE" => Some(AgbSaveType::None),
            _ => None,
        }
    }
}

/// Read-only lookup table over header hashes
#[derive(Debug, Default)]
pub struct HeaderDatabase {
    entries: HashMap<String, DbEntry>,
}

impl HeaderDatabase {
    pub fn load_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::load_json(&text)
    }

    pub fn load_json(text: &str) -> Result<Self> {
        let entries: HashMap<String, DbEntry> = serde_json::from_str(text)
            .map_err(|e| Error::Catalog(format!("header database: {e}")))?;
        log::debug!("header database loaded, {} entries", entries.len());
        Ok(Self { entries })
    }

    pub fn lookup(&self, header_sha1: &str) -> Option<&DbEntry> {
        self.entries.get(&header_sha1.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
