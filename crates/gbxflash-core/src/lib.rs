//! gbxflash-core - Cartridge flashing engine for DMG and AGB
//!
//! This crate holds everything between the serial link and the user
//! interface: header parsing, the cartridge catalog, mapper register
//! protocols, the NOR flash command engine and the transfer orchestrator.
//! It talks to hardware exclusively through the [`link::LinkPort`] trait,
//! so every layer can be driven against mock ports in tests.
//!
//! # Example
//!
//! ```ignore
//! use gbxflash_core::transfer::Session;
//!
//! fn show_cart<P: gbxflash_core::link::LinkPort>(port: P) {
//!     let mut session = Session::new(port);
//!     match session.read_info(None) {
//!         Ok(info) => println!("{:?} cartridge, {} bytes", info.platform, info.rom_size),
//!         Err(e) => println!("no cartridge: {e}"),
//!     }
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod cart;
pub mod cfi;
pub mod error;
pub mod flash;
pub mod header;
pub mod link;
pub mod mapper;
pub mod progress;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
