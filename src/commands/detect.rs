//! Flash chip detection commands

use gbxflash_core::cart::Catalog;
use gbxflash_core::link::{LinkPort, PortMode, Voltage};
use gbxflash_core::transfer::Session;

use super::CliResult;

pub fn run_detect<P: LinkPort>(
    session: &mut Session<P>,
    catalog: &Catalog,
    platform: PortMode,
    limit_voltage: Option<Voltage>,
) -> CliResult<()> {
    let found = session.auto_detect_flash(catalog, platform, limit_voltage)?;
    if found.is_empty() {
        println!("No catalog entry recognized this chip.");
        println!("A dump of `check-chip` output helps when adding a new entry.");
    } else {
        println!("Matching cartridge types:");
        for name in &found {
            println!("  {name}");
        }
    }
    Ok(())
}

pub fn run_check_chip<P: LinkPort>(
    session: &mut Session<P>,
    catalog: &Catalog,
    cart_name: &str,
) -> CliResult<()> {
    let cart = catalog
        .find_by_name(cart_name)
        .ok_or_else(|| format!("no catalog entry named {cart_name:?}"))?;

    let check = session.check_flash_chip(cart)?;
    print!("Flash ID: ");
    for b in &check.id {
        print!("{b:02X} ");
    }
    println!();
    let known = cart.flash_ids.iter().any(|k| check.id.starts_with(k));
    println!(
        "Catalog match: {}",
        if known { "yes" } else { "no" }
    );

    match &check.cfi {
        Some(info) => println!("{}", info.describe()),
        None => println!("No CFI table."),
    }
    Ok(())
}
