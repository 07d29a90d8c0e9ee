//! Common Flash Interface (CFI) parsing
//!
//! Flash chips that implement CFI expose a self-describing data block after
//! the `read_cfi` command sequence. The block is read over a 16-bit bus, so
//! CFI word `W` sits at byte offset `W * 2` of the raw buffer (the high byte
//! of each word is ignored).
//!
//! Bootleg carts sometimes wire D0 and D1 swapped; the signature then reads
//! `"RQZ"` instead of `"QRY"` and every byte must be un-swapped before
//! decoding.

use crate::error::CfiError;

/// Minimum raw buffer we decode from
pub const CFI_BUFFER_LEN: usize = 0x400;

/// One run of equally sized erase sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfiRegion {
    /// Sector size in bytes
    pub size: u32,
    /// Number of sectors of this size
    pub count: u32,
}

impl CfiRegion {
    pub const fn total_size(&self) -> u32 {
        self.size * self.count
    }
}

/// Decoded CFI geometry and timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfiInfo {
    /// Data lines D0/D1 were swapped and the buffer was corrected
    pub d0d1_swapped: bool,
    /// Vcc range in millivolts
    pub vcc_min_mv: u16,
    pub vcc_max_mv: u16,
    /// Typical single-word program time in microseconds
    pub typ_word_program_us: u32,
    /// Typical buffered program time in microseconds (0 = unsupported)
    pub typ_buffer_program_us: u32,
    /// Typical sector erase time in milliseconds
    pub typ_sector_erase_ms: u32,
    /// Typical full chip erase time in milliseconds (0 = unsupported)
    pub typ_chip_erase_ms: u32,
    /// Worst-case multipliers for the four timings above
    pub max_timeout_multiplier: [u32; 4],
    /// Declared device size in bytes
    pub device_size: u32,
    /// Maximum bytes per buffered write (0 = buffered writes unsupported)
    pub buffer_size: u32,
    /// Erase sector regions in address order (already reversed for
    /// top-boot parts)
    pub regions: Vec<CfiRegion>,
    /// The PRI table flagged a top-boot layout
    pub top_boot: bool,
}

impl CfiInfo {
    pub fn supports_buffered_writes(&self) -> bool {
        self.buffer_size > 1
    }

    /// Worst-case sector erase budget
    pub fn max_sector_erase_ms(&self) -> u32 {
        self.typ_sector_erase_ms
            .saturating_mul(self.max_timeout_multiplier[2].max(1))
    }

    /// Worst-case chip erase budget
    pub fn max_chip_erase_ms(&self) -> u32 {
        self.typ_chip_erase_ms
            .saturating_mul(self.max_timeout_multiplier[3].max(1))
    }

    /// Human-readable dump, shown by `check-chip`
    pub fn describe(&self) -> String {
        use std::fmt::Write;
        let mut s = String::new();
        let _ = writeln!(s, "Device size:      {} bytes", self.device_size);
        let _ = writeln!(
            s,
            "Vcc range:        {:.1}V - {:.1}V",
            self.vcc_min_mv as f32 / 1000.0,
            self.vcc_max_mv as f32 / 1000.0
        );
        let _ = writeln!(s, "Word program:     {} us (typ)", self.typ_word_program_us);
        if self.supports_buffered_writes() {
            let _ = writeln!(s, "Buffered writes:  {} bytes per buffer", self.buffer_size);
        } else {
            let _ = writeln!(s, "Buffered writes:  not supported");
        }
        let _ = writeln!(s, "Sector erase:     {} ms (typ)", self.typ_sector_erase_ms);
        if self.typ_chip_erase_ms > 0 {
            let _ = writeln!(s, "Chip erase:       {} ms (typ)", self.typ_chip_erase_ms);
        }
        if self.d0d1_swapped {
            let _ = writeln!(s, "Note:             D0/D1 swapped (bootleg wiring)");
        }
        let _ = writeln!(s, "Erase regions:");
        for r in &self.regions {
            let _ = writeln!(s, "  {} x {} bytes", r.count, r.size);
        }
        s
    }
}

/// Swap bits 0 and 1 of a byte (bootleg D0/D1 wiring)
fn swap_d0d1(b: u8) -> u8 {
    (b & 0xFC) | ((b & 0x01) << 1) | ((b & 0x02) >> 1)
}

/// Low byte of CFI word `w`
fn word(buf: &[u8], w: usize) -> u8 {
    buf.get(w * 2).copied().unwrap_or(0xFF)
}

/// Little-endian u16 assembled from CFI words `w` and `w + 1`
fn word16(buf: &[u8], w: usize) -> u16 {
    u16::from_le_bytes([word(buf, w), word(buf, w + 1)])
}

/// BCD voltage nibbles to millivolts (high nibble volts, low nibble 100 mV)
fn bcd_voltage_mv(b: u8) -> u16 {
    (b >> 4) as u16 * 1000 + (b & 0x0F) as u16 * 100
}

/// Power-of-two timing exponent; 0 means "not supported"
fn pow2_or_zero(exp: u8) -> u32 {
    if exp == 0 || exp >= 32 {
        0
    } else {
        1 << exp
    }
}

/// Decode a raw CFI buffer into geometry
///
/// Accepts the normal `"QRY"` signature or the D0/D1-swapped `"RQZ"` form.
/// Returns `CfiError::NoCfi` when neither signature is present; the caller
/// then falls back to the descriptor's static sector map.
pub fn parse(raw: &[u8]) -> Result<CfiInfo, CfiError> {
    if raw.len() < 0x80 {
        return Err(CfiError::NoCfi);
    }

    let sig = [word(raw, 0x10), word(raw, 0x11), word(raw, 0x12)];
    let (buf, swapped): (Vec<u8>, bool) = if sig == *b"QRY" {
        (raw.to_vec(), false)
    } else if sig.map(swap_d0d1) == *b"QRY" {
        log::debug!("CFI signature reads \"RQZ\", un-swapping D0/D1");
        (raw.iter().map(|&b| swap_d0d1(b)).collect(), true)
    } else {
        return Err(CfiError::NoCfi);
    };
    let buf = buf.as_slice();

    let device_size_exp = word(buf, 0x27);
    if device_size_exp == 0 || device_size_exp > 28 {
        return Err(CfiError::Malformed("device size exponent out of range"));
    }
    let device_size = 1u32 << device_size_exp;

    let buffer_size_exp = word16(buf, 0x2A);
    let buffer_size = if buffer_size_exp == 0 || buffer_size_exp >= 16 {
        0
    } else {
        1u32 << buffer_size_exp
    };

    let region_count = word(buf, 0x2C) as usize;
    if region_count > 4 {
        return Err(CfiError::Malformed("more than 4 erase regions"));
    }
    let mut regions = Vec::with_capacity(region_count);
    for i in 0..region_count {
        let base = 0x2D + i * 4;
        let count = word16(buf, base) as u32 + 1;
        let size_256 = word16(buf, base + 2) as u32;
        // A size field of 0 encodes 128-byte sectors per the JEDEC spec
        let size = if size_256 == 0 { 128 } else { size_256 * 256 };
        regions.push(CfiRegion { size, count });
    }

    let covered: u32 = regions.iter().map(|r| r.total_size()).sum();
    if !regions.is_empty() && covered != device_size {
        log::warn!(
            "CFI erase regions cover 0x{:X} bytes but device claims 0x{:X}",
            covered,
            device_size
        );
    }

    // Primary extended query table: boot-sector ordering flag
    let mut top_boot = false;
    let pri = word16(buf, 0x15) as usize;
    if pri != 0 && [word(buf, pri), word(buf, pri + 1), word(buf, pri + 2)] == *b"PRI" {
        // 0x02 = bottom boot, 0x03 = top boot (sector table stored reversed)
        top_boot = word(buf, pri + 0x0F) == 0x03;
    }
    if top_boot {
        regions.reverse();
    }

    Ok(CfiInfo {
        d0d1_swapped: swapped,
        vcc_min_mv: bcd_voltage_mv(word(buf, 0x1B)),
        vcc_max_mv: bcd_voltage_mv(word(buf, 0x1C)),
        typ_word_program_us: pow2_or_zero(word(buf, 0x1F)),
        typ_buffer_program_us: pow2_or_zero(word(buf, 0x20)),
        typ_sector_erase_ms: pow2_or_zero(word(buf, 0x21)),
        typ_chip_erase_ms: pow2_or_zero(word(buf, 0x22)),
        max_timeout_multiplier: [
            pow2_or_zero(word(buf, 0x23)).max(1),
            pow2_or_zero(word(buf, 0x24)).max(1),
            pow2_or_zero(word(buf, 0x25)).max(1),
            pow2_or_zero(word(buf, 0x26)).max(1),
        ],
        device_size,
        buffer_size,
        regions,
        top_boot,
    })
}
