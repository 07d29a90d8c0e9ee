//! ROM header parsing
//!
//! Both parsers are best-effort: they never fail, they fill in whatever can
//! be decoded and attach correctness flags the orchestrator acts on.

pub mod agb;
pub mod db;
pub mod dmg;

use sha1::{Digest, Sha1};

/// SHA-1 of a byte region as lowercase hex
pub(crate) fn sha1_hex(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    let mut s = String::with_capacity(40);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Printable title bytes, trimmed at the first NUL
pub(crate) fn decode_title(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| {
            if (0x20..0x7F).contains(&b) {
                b as char
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_end()
        .to_string()
}
