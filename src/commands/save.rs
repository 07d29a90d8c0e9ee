//! Save RAM backup and restore commands

use std::fs;
use std::path::Path;

use gbxflash_core::link::LinkPort;
use gbxflash_core::transfer::{Operation, Outcome, SaveOptions, Session};

use super::{drive_job, CliResult};

pub fn run_backup<P: LinkPort + Send + 'static>(
    mut session: Session<P>,
    output: &Path,
    mut opts: SaveOptions,
) -> CliResult<()> {
    let info = session.read_info(None)?;
    if opts.save_type.is_none() {
        opts.save_type = info.save_type;
    }
    let job = session.spawn(Operation::BackupRam {
        platform: info.platform,
        opts,
    });
    let data = match drive_job(job)? {
        Outcome::Save(data) => data,
        other => return Err(format!("unexpected outcome {other:?}").into()),
    };
    if data.is_empty() {
        return Err("cartridge has no save memory".into());
    }
    fs::write(output, &data)?;
    println!("Wrote {} bytes to {}", data.len(), output.display());
    Ok(())
}

pub fn run_restore<P: LinkPort + Send + 'static>(
    mut session: Session<P>,
    input: &Path,
    mut opts: SaveOptions,
) -> CliResult<()> {
    let info = session.read_info(None)?;
    if opts.save_type.is_none() {
        opts.save_type = info.save_type;
    }
    let data = fs::read(input)?;
    let job = session.spawn(Operation::RestoreRam {
        platform: info.platform,
        data,
        opts,
    });
    match drive_job(job)? {
        Outcome::Restored => {}
        other => return Err(format!("unexpected outcome {other:?}").into()),
    }
    println!("Restored save from {}", input.display());
    Ok(())
}
