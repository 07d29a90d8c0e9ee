//! ROM backup and flash commands

use std::fs;
use std::path::{Path, PathBuf};

use gbxflash_core::cart::Catalog;
use gbxflash_core::link::LinkPort;
use gbxflash_core::mapper::MapperKind;
use gbxflash_core::transfer::{FlashOptions, Operation, Outcome, Session};

use super::{drive_job, CliResult};

pub fn run_backup<P: LinkPort + Send + 'static>(
    mut session: Session<P>,
    output: &Path,
    mapper_hint: Option<MapperKind>,
    rom_size: Option<u32>,
    fast_read: bool,
) -> CliResult<()> {
    let info = session.read_info(None)?;
    let job = session.spawn(Operation::BackupRom {
        platform: info.platform,
        mapper_hint,
        rom_size: rom_size.or(if info.rom_size > 0 {
            Some(info.rom_size)
        } else {
            None
        }),
        fast_read,
    });
    let data = match drive_job(job)? {
        Outcome::Rom(data) => data,
        other => return Err(format!("unexpected outcome {other:?}").into()),
    };
    fs::write(output, &data)?;
    println!("Wrote {} bytes to {}", data.len(), output.display());
    Ok(())
}

pub struct FlashArgs {
    pub cart: String,
    pub chip_erase: bool,
    pub verify: bool,
    pub delta: bool,
    pub fix_header: bool,
    pub voltage: Option<gbxflash_core::link::Voltage>,
}

pub fn run_flash<P: LinkPort + Send + 'static>(
    session: Session<P>,
    catalog: &Catalog,
    input: &Path,
    args: &FlashArgs,
) -> CliResult<()> {
    let cart = catalog
        .find_by_name(&args.cart)
        .ok_or_else(|| format!("no catalog entry named {:?}", args.cart))?
        .clone();
    let data = fs::read(input)?;
    println!(
        "Flashing {} ({} bytes) to {}",
        input.display(),
        data.len(),
        cart.name()
    );

    let manifest_target: Option<PathBuf> = args.delta.then(|| input.to_path_buf());
    let opts = FlashOptions {
        voltage_override: args.voltage,
        prefer_chip_erase: args.chip_erase,
        verify: args.verify,
        fix_header: args.fix_header,
    };
    let job = session.spawn(Operation::FlashRom {
        data,
        cart,
        opts,
        manifest_target,
    });
    let summary = match drive_job(job)? {
        Outcome::Flashed(s) => s,
        other => return Err(format!("unexpected outcome {other:?}").into()),
    };

    println!(
        "Done: {} sectors erased, {} unchanged, {} bytes written{}",
        summary.sectors_erased,
        summary.sectors_skipped,
        summary.bytes_written,
        if summary.verified { ", verified" } else { "" }
    );
    Ok(())
}
