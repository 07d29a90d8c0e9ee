//! gbxflash - Game Boy / Game Boy Advance cartridge flasher
//!
//! Reads, writes and rewrites cartridge ROMs and saves through a USB
//! serial bridge. All cartridge knowledge lives in `gbxflash-core`; this
//! binary is argument parsing, file I/O and progress display.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use gbxflash_core::cart::Catalog;
use gbxflash_core::header::db::HeaderDatabase;
use gbxflash_core::transfer::{SaveOptions, Session};
use gbxflash_linkport::{open_serial, BridgeDevice, SerialTransport};
use std::path::{Path, PathBuf};

/// Fallback locations for the cartridge catalog
const CATALOG_PATHS: &[&str] = &["data/carts.json", "/usr/share/gbxflash/carts.json"];
/// Fallback locations for the ROM hash database
const HASH_DB_PATHS: &[&str] = &["data/hashdb.json", "/usr/share/gbxflash/hashdb.json"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.verbose {
        0 => {}
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    match run(cli) {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::ListPorts => return commands::list::list_ports(),
        Commands::ListCarts { ref platform } => {
            let catalog = load_catalog(cli.catalog.as_deref())?;
            let platform = platform
                .as_deref()
                .map(commands::parse_platform)
                .transpose()?;
            return commands::list::list_carts(&catalog, platform);
        }
        _ => {}
    }

    let mut session = open_session(cli.port.as_deref(), cli.baud)?;

    match cli.command {
        Commands::Info => {
            let db = load_hash_db(cli.hash_db.as_deref());
            commands::info::run_info(&mut session, db.as_ref())
        }
        Commands::Detect { platform, voltage } => {
            let catalog = load_catalog(cli.catalog.as_deref())?;
            let platform = commands::parse_platform(&platform)?;
            let voltage = voltage.as_deref().map(commands::parse_voltage).transpose()?;
            commands::detect::run_detect(&mut session, &catalog, platform, voltage)
        }
        Commands::CheckChip { cart } => {
            let catalog = load_catalog(cli.catalog.as_deref())?;
            commands::detect::run_check_chip(&mut session, &catalog, &cart)
        }
        Commands::BackupRom {
            output,
            mapper,
            size,
            fast_read,
        } => {
            let mapper = mapper.as_deref().map(commands::parse_mapper).transpose()?;
            commands::rom::run_backup(session, &output, mapper, size, fast_read)
        }
        Commands::FlashRom {
            input,
            cart,
            chip_erase,
            no_verify,
            no_delta,
            fix_header,
            voltage,
        } => {
            let catalog = load_catalog(cli.catalog.as_deref())?;
            let voltage = voltage.as_deref().map(commands::parse_voltage).transpose()?;
            let args = commands::rom::FlashArgs {
                cart,
                chip_erase,
                verify: !no_verify,
                delta: !no_delta,
                fix_header,
                voltage,
            };
            commands::rom::run_flash(session, &catalog, &input, &args)
        }
        Commands::BackupSave {
            output,
            save_type,
            mapper,
            rtc,
        } => {
            let opts = save_options(save_type.as_deref(), mapper.as_deref(), rtc)?;
            commands::save::run_backup(session, &output, opts)
        }
        Commands::RestoreSave {
            input,
            save_type,
            mapper,
            rtc,
            erase,
        } => {
            let mut opts = save_options(save_type.as_deref(), mapper.as_deref(), rtc)?;
            opts.erase = erase;
            commands::save::run_restore(session, &input, opts)
        }
        Commands::ListPorts | Commands::ListCarts { .. } => unreachable!(),
    }
}

fn save_options(
    save_type: Option<&str>,
    mapper: Option<&str>,
    rtc: bool,
) -> Result<SaveOptions, Box<dyn std::error::Error>> {
    Ok(SaveOptions {
        mapper_hint: mapper.map(commands::parse_mapper).transpose()?,
        save_type: save_type.map(commands::parse_save_type).transpose()?,
        include_rtc: rtc,
        erase: false,
    })
}

fn open_session(
    port: Option<&str>,
    baud: Option<u32>,
) -> Result<Session<BridgeDevice<SerialTransport>>, Box<dyn std::error::Error>> {
    let port = match port {
        Some(p) => p.to_string(),
        None => {
            let mut candidates = gbxflash_linkport::list_ports();
            match candidates.len() {
                0 => return Err("no serial ports found, pass --port".into()),
                1 => candidates.remove(0),
                _ => {
                    return Err(format!(
                        "several serial ports found ({}), pass --port",
                        candidates.join(", ")
                    )
                    .into())
                }
            }
        }
    };
    let device = open_serial(&port, baud)?;
    Ok(Session::new(device))
}

fn find_data_file(explicit: Option<&Path>, fallbacks: &[&str]) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    fallbacks
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

fn load_catalog(path: Option<&Path>) -> Result<Catalog, Box<dyn std::error::Error>> {
    let path = find_data_file(path, CATALOG_PATHS)
        .ok_or("no cartridge catalog found, pass --catalog")?;
    let catalog = Catalog::load_file(&path)?;
    log::info!(
        "Loaded {} cartridge types from {}",
        catalog.len(),
        path.display()
    );
    Ok(catalog)
}

fn load_hash_db(path: Option<&Path>) -> Option<HeaderDatabase> {
    let path = find_data_file(path, HASH_DB_PATHS)?;
    match HeaderDatabase::load_file(&path) {
        Ok(db) => {
            log::debug!("Loaded {} hash entries from {}", db.len(), path.display());
            Some(db)
        }
        Err(e) => {
            log::warn!("could not load hash database {}: {e}", path.display());
            None
        }
    }
}
