//! Sector geometry
//!
//! A `SectorMap` is the ordered list of erase sectors covering the chip.
//! It comes either from the catalog entry's static regions or from the
//! chip's CFI table. The cursor over it only ever moves forward; erase
//! progress never revisits a sector.

use crate::cfi::CfiInfo;

/// One erase sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub index: u32,
    /// Byte offset of the sector within the chip
    pub base: u32,
    pub size: u32,
}

impl Sector {
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.base && offset < self.end()
    }
}

#[derive(Debug, Clone)]
pub struct SectorMap {
    sectors: Vec<Sector>,
    total: u32,
}

impl SectorMap {
    /// Build from ordered `(size, count)` regions
    pub fn from_regions(regions: &[(u32, u32)]) -> Self {
        let mut sectors = Vec::new();
        let mut base = 0u32;
        for &(size, count) in regions {
            for _ in 0..count {
                sectors.push(Sector {
                    index: sectors.len() as u32,
                    base,
                    size,
                });
                base += size;
            }
        }
        SectorMap {
            sectors,
            total: base,
        }
    }

    /// Uniform layout covering `chip_size`
    pub fn uniform(sector_size: u32, chip_size: u32) -> Self {
        Self::from_regions(&[(sector_size, chip_size / sector_size)])
    }

    /// Geometry from a parsed CFI table
    pub fn from_cfi(cfi: &CfiInfo) -> Self {
        let regions: Vec<(u32, u32)> = cfi
            .regions
            .iter()
            .map(|r| (r.size, r.count))
            .collect();
        Self::from_regions(&regions)
    }

    /// Same sectors laid out from the top of the chip down, for catalog
    /// entries whose region list is stored top-boot
    pub fn reversed(&self) -> Self {
        let mut sizes: Vec<u32> = self.sectors.iter().map(|s| s.size).collect();
        sizes.reverse();
        let mut base = 0u32;
        let sectors = sizes
            .into_iter()
            .enumerate()
            .map(|(i, size)| {
                let s = Sector {
                    index: i as u32,
                    base,
                    size,
                };
                base += size;
                s
            })
            .collect();
        SectorMap {
            sectors,
            total: base,
        }
    }

    pub fn total_size(&self) -> u32 {
        self.total
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    /// The sector containing `offset`
    pub fn sector_at(&self, offset: u32) -> Option<Sector> {
        if offset >= self.total {
            return None;
        }
        let idx = self.sectors.partition_point(|s| s.end() <= offset);
        self.sectors.get(idx).copied()
    }

    pub fn cursor(&self) -> SectorCursor<'_> {
        SectorCursor { map: self, next: 0 }
    }
}

/// Forward-only walk over a sector map
#[derive(Debug)]
pub struct SectorCursor<'a> {
    map: &'a SectorMap,
    next: usize,
}

impl<'a> SectorCursor<'a> {
    /// The sector the cursor sits on, without moving
    pub fn peek(&self) -> Option<Sector> {
        self.map.sectors.get(self.next).copied()
    }

    /// Return the current sector and step past it
    pub fn advance(&mut self) -> Option<Sector> {
        let s = self.peek()?;
        self.next += 1;
        Some(s)
    }

    /// Move forward until the cursor covers `offset`. An offset behind the
    /// cursor leaves it where it is; the walk never regresses.
    pub fn seek_forward(&mut self, offset: u32) -> Option<Sector> {
        while let Some(s) = self.peek() {
            if s.end() > offset {
                return Some(s);
            }
            self.next += 1;
        }
        None
    }

    pub fn remaining(&self) -> usize {
        self.map.sectors.len() - self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_sector_layout_walks_in_order() {
        let map = SectorMap::from_regions(&[(0x2000, 8), (0x10000, 63)]);
        assert_eq!(map.total_size(), 0x2000 * 8 + 0x10000 * 63);
        assert_eq!(map.sector_count(), 71);

        let mut cur = map.cursor();
        for i in 0..8 {
            let s = cur.advance().unwrap();
            assert_eq!(s.size, 0x2000);
            assert_eq!(s.base, i * 0x2000);
        }
        let s = cur.advance().unwrap();
        assert_eq!(s.size, 0x10000);
        assert_eq!(s.base, 0x10000);
    }

    #[test]
    fn cursor_never_regresses() {
        let map = SectorMap::from_regions(&[(0x2000, 8), (0x10000, 63)]);
        let mut cur = map.cursor();

        let ahead = cur.seek_forward(0x30000).unwrap();
        assert_eq!(ahead.size, 0x10000);
        assert!(ahead.contains(0x30000));

        // Asking for an earlier offset does not move the cursor back
        let same = cur.seek_forward(0x1000).unwrap();
        assert_eq!(same, ahead);
    }

    #[test]
    fn sector_at_uses_binary_search() {
        let map = SectorMap::from_regions(&[(0x2000, 8), (0x10000, 63)]);
        let s = map.sector_at(0x0000).unwrap();
        assert_eq!(s.index, 0);
        let s = map.sector_at(0xFFFF).unwrap();
        assert_eq!(s.base, 0xE000);
        let s = map.sector_at(0x10000).unwrap();
        assert_eq!(s.size, 0x10000);
        assert!(map.sector_at(map.total_size()).is_none());
    }

    #[test]
    fn cfi_geometry_becomes_an_ordered_map() {
        let info = crate::cfi::parse(&cfi_fixture()).unwrap();
        let map = SectorMap::from_cfi(&info);
        assert_eq!(map.sector_count(), 8 + 63);
        assert_eq!(map.sectors()[0].size, 0x2000);
        assert_eq!(map.total_size(), info.device_size);
    }

    fn cfi_fixture() -> Vec<u8> {
        // 4 MiB, 8 x 8 KiB boot sectors + 63 x 64 KiB, bottom boot
        let mut buf = vec![0u8; crate::cfi::CFI_BUFFER_LEN];
        let mut set = |w: usize, v: u8| buf[w * 2] = v;
        set(0x10, b'Q');
        set(0x11, b'R');
        set(0x12, b'Y');
        set(0x1F, 4);
        set(0x21, 10);
        set(0x22, 13);
        set(0x25, 3);
        set(0x26, 3);
        set(0x27, 22);
        set(0x2C, 2);
        set(0x2D, 7);
        set(0x2F, 0x20);
        set(0x31, 62);
        set(0x34, 0x01);
        buf
    }

    #[test]
    fn reversed_moves_boot_sectors_to_the_top() {
        let map = SectorMap::from_regions(&[(0x2000, 8), (0x10000, 63)]).reversed();
        assert_eq!(map.sectors()[0].size, 0x10000);
        let last = map.sectors().last().copied().unwrap();
        assert_eq!(last.size, 0x2000);
        assert_eq!(last.end(), map.total_size());
    }
}
