//! Delta flashing manifest
//!
//! After a successful flash the CRC of every programmed sector is persisted
//! next to the target image. The next run compares sector CRCs against the
//! manifest and skips sectors that already hold the right data; flashing an
//! identical image twice rewrites nothing.
//!
//! The manifest is tagged with a hash of the sector layout. A manifest
//! written for a different chip geometry is stale and ignored wholesale.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::flash::sector_map::SectorMap;
use crate::header::sha1_hex;

#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    layout: String,
    /// `[offset, size, crc32]` per sector
    sectors: Vec<(u32, u32, u32)>,
}

#[derive(Debug)]
pub struct DeltaManifest {
    layout: String,
    entries: HashMap<(u32, u32), u32>,
    path: PathBuf,
}

/// Short identity of a sector layout: chip size plus every sector boundary
pub fn layout_hash(map: &SectorMap) -> String {
    let mut desc = Vec::with_capacity(map.sector_count() * 8 + 4);
    desc.extend_from_slice(&map.total_size().to_le_bytes());
    for s in map.sectors() {
        desc.extend_from_slice(&s.base.to_le_bytes());
        desc.extend_from_slice(&s.size.to_le_bytes());
    }
    sha1_hex(&desc)[..8].to_string()
}

/// Manifest file path for a given flash target
pub fn manifest_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".into());
    name.push_str(".delta.json");
    target.with_file_name(name)
}

impl DeltaManifest {
    /// Load the manifest for `target`, or start empty when there is none
    /// or its layout does not match the current chip
    pub fn load(target: &Path, map: &SectorMap) -> Self {
        let layout = layout_hash(map);
        let path = manifest_path(target);
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<ManifestFile>(&text) {
                Ok(file) if file.layout == layout => file
                    .sectors
                    .into_iter()
                    .map(|(off, size, crc)| ((off, size), crc))
                    .collect(),
                Ok(file) => {
                    log::info!(
                        "delta manifest {} is for layout {}, current is {}; full rewrite",
                        path.display(),
                        file.layout,
                        layout
                    );
                    HashMap::new()
                }
                Err(e) => {
                    log::warn!("ignoring unreadable delta manifest {}: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        DeltaManifest {
            layout,
            entries,
            path,
        }
    }

    /// True when the manifest says this sector already holds data with `crc`
    pub fn matches(&self, offset: u32, size: u32, crc: u32) -> bool {
        self.entries.get(&(offset, size)) == Some(&crc)
    }

    /// Record a sector as holding data with `crc`. Entries from an earlier
    /// interrupted run that were not touched this time stay valid.
    pub fn record(&mut self, offset: u32, size: u32, crc: u32) {
        self.entries.insert((offset, size), crc);
    }

    pub fn forget(&mut self, offset: u32, size: u32) {
        self.entries.remove(&(offset, size));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist atomically: write a sibling temp file, then rename over the
    /// old manifest so a crash never leaves a half-written one.
    pub fn save(&self) -> Result<()> {
        let mut sectors: Vec<(u32, u32, u32)> = self
            .entries
            .iter()
            .map(|(&(off, size), &crc)| (off, size, crc))
            .collect();
        sectors.sort_unstable();
        let file = ManifestFile {
            layout: self.layout.clone(),
            sectors,
        };
        let text = serde_json::to_string(&file)
            .map_err(|e| crate::error::Error::Catalog(format!("delta manifest encode: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmpdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gbxflash-delta-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn round_trip_persists_sector_crcs() {
        let dir = tmpdir("roundtrip");
        let target = dir.join("game.gba");
        let map = SectorMap::uniform(0x10000, 0x40000);

        let mut m = DeltaManifest::load(&target, &map);
        assert!(m.is_empty());
        m.record(0x00000, 0x10000, 0xAABBCCDD);
        m.record(0x10000, 0x10000, 0x11223344);
        m.save().unwrap();

        let m2 = DeltaManifest::load(&target, &map);
        assert_eq!(m2.len(), 2);
        assert!(m2.matches(0x00000, 0x10000, 0xAABBCCDD));
        assert!(!m2.matches(0x00000, 0x10000, 0xDEADBEEF));

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn layout_change_invalidates_the_manifest() {
        let dir = tmpdir("stale");
        let target = dir.join("game.gba");
        let map = SectorMap::uniform(0x10000, 0x40000);

        let mut m = DeltaManifest::load(&target, &map);
        m.record(0, 0x10000, 1);
        m.save().unwrap();

        // Same file, different chip geometry
        let other = SectorMap::uniform(0x20000, 0x40000);
        let m2 = DeltaManifest::load(&target, &other);
        assert!(m2.is_empty());

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn save_replaces_rather_than_appends() {
        let dir = tmpdir("replace");
        let target = dir.join("game.gb");
        let map = SectorMap::uniform(0x1000, 0x8000);

        let mut m = DeltaManifest::load(&target, &map);
        m.record(0, 0x1000, 7);
        m.save().unwrap();
        m.record(0, 0x1000, 8);
        m.save().unwrap();

        let m2 = DeltaManifest::load(&target, &map);
        assert_eq!(m2.len(), 1);
        assert!(m2.matches(0, 0x1000, 8));
        assert!(!manifest_path(&target).with_extension("json.tmp").exists());

        std::fs::remove_dir_all(dir).ok();
    }
}
