//! CLI command implementations
//!
//! Each long-running command moves the session into a worker thread via
//! `Session::spawn` and drives an indicatif progress bar from the event
//! channel on the main thread.

pub mod detect;
pub mod info;
pub mod list;
pub mod rom;
pub mod save;

use indicatif::{ProgressBar, ProgressStyle};

use gbxflash_core::header::agb::AgbSaveType;
use gbxflash_core::link::{PortMode, Voltage};
use gbxflash_core::mapper::MapperKind;
use gbxflash_core::progress::{ProgressEvent, Throughput};
use gbxflash_core::transfer::{Job, Outcome};

pub type CliError = Box<dyn std::error::Error>;
pub type CliResult<T> = Result<T, CliError>;

pub fn parse_platform(s: &str) -> CliResult<PortMode> {
    match s.to_ascii_uppercase().as_str() {
        "DMG" | "GB" | "GBC" => Ok(PortMode::Dmg),
        "AGB" | "GBA" => Ok(PortMode::Agb),
        other => Err(format!("unknown platform {other}, use DMG or AGB").into()),
    }
}

pub fn parse_voltage(s: &str) -> CliResult<Voltage> {
    match s {
        "3.3" | "3.3V" | "3.3v" => Ok(Voltage::V3_3),
        "5" | "5V" | "5v" => Ok(Voltage::V5),
        other => Err(format!("unknown voltage {other}, use 3.3V or 5V").into()),
    }
}

pub fn parse_mapper(s: &str) -> CliResult<MapperKind> {
    let kind = match s.to_ascii_uppercase().as_str() {
        "NONE" | "ROM" => MapperKind::None,
        "MBC1" => MapperKind::Mbc1,
        "MBC1M" => MapperKind::Mbc1Multi,
        "MBC2" => MapperKind::Mbc2,
        "MBC3" | "MBC30" => MapperKind::Mbc3,
        "MBC5" => MapperKind::Mbc5,
        "MBC6" => MapperKind::Mbc6,
        "MBC7" => MapperKind::Mbc7,
        "MMM01" => MapperKind::Mmm01,
        "HUC1" => MapperKind::Huc1,
        "HUC3" => MapperKind::Huc3,
        "TAMA5" => MapperKind::Tama5,
        "M161" => MapperKind::M161,
        "GBMEMORY" | "GB-MEMORY" => MapperKind::GbMemory,
        other => return Err(format!("unknown mapper {other}").into()),
    };
    Ok(kind)
}

pub fn parse_save_type(s: &str) -> CliResult<AgbSaveType> {
    let ty = match s.to_ascii_uppercase().as_str() {
        "NONE" => AgbSaveType::None,
        "SRAM_32K" | "SRAM" => AgbSaveType::Sram32K,
        "FLASH_64K" => AgbSaveType::Flash64K,
        "FLASH_128K" => AgbSaveType::Flash128K,
        "EEPROM_512" => AgbSaveType::Eeprom512,
        "EEPROM_8K" => AgbSaveType::Eeprom8K,
        other => return Err(format!("unknown save type {other}").into()),
    };
    Ok(ty)
}

fn bar(total: u64) -> CliResult<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({msg})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Drain a background job's event channel into a progress bar, then join
pub fn drive_job(job: Job) -> CliResult<Outcome> {
    let mut pb: Option<ProgressBar> = None;
    let mut throughput = Throughput::new();
    let mut last_pos = 0u64;

    for event in job.events.iter() {
        match event {
            ProgressEvent::Initialize { action, total_bytes } => {
                let b = bar(total_bytes as u64)?;
                b.set_message(action.describe().to_string());
                pb = Some(b);
                last_pos = 0;
            }
            ProgressEvent::Read { pos, len } | ProgressEvent::Write { pos, len } => {
                throughput.record(len);
                if let Some(b) = &pb {
                    b.set_position(pos as u64);
                    let eta = throughput
                        .eta(b.length().unwrap_or(0).saturating_sub(pos as u64))
                        .map(|d| format!(", {}s left", d.as_secs()))
                        .unwrap_or_default();
                    b.set_message(format!(
                        "{:.1} KiB/s{eta}",
                        throughput.median_bps() / 1024.0
                    ));
                }
                last_pos = pos as u64;
            }
            ProgressEvent::UpdatePos { pos } => {
                if let Some(b) = &pb {
                    b.set_position(pos as u64);
                }
                last_pos = pos as u64;
            }
            ProgressEvent::Erase { elapsed_ms } => {
                if let Some(b) = &pb {
                    b.set_message(format!("chip erase, {}s", elapsed_ms / 1000));
                }
            }
            ProgressEvent::SectorErase { index, count, .. } => {
                if let Some(b) = &pb {
                    b.set_message(format!("erasing sector {}/{count}", index + 1));
                }
            }
            ProgressEvent::Abort => {
                if let Some(b) = &pb {
                    b.abandon_with_message("aborted");
                }
            }
            ProgressEvent::Finished {
                bytes_transferred,
                verified,
            } => {
                if let Some(b) = &pb {
                    b.set_position(last_pos.max(bytes_transferred));
                    b.finish_with_message(if verified { "done, verified" } else { "done" });
                }
            }
        }
    }

    Ok(job.join()?)
}
