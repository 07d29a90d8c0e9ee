//! NOR flash programming: geometry, delta tracking, and the command engine

pub mod delta;
pub mod engine;
pub mod sector_map;

pub use engine::{FlashBus, FlashEngine, ProgramStrategy};
pub use sector_map::{Sector, SectorCursor, SectorMap};

/// How many times a failing sector is erased and reprogrammed from scratch
/// before the run aborts. Tunable; raising it mostly helps marginal
/// cartridge contacts.
pub const SECTOR_RETRIES: u32 = 4;
