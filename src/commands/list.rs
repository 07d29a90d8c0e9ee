//! Listing commands

use gbxflash_core::cart::Catalog;
use gbxflash_core::link::PortMode;

use super::CliResult;

pub fn list_ports() -> CliResult<()> {
    let ports = gbxflash_linkport::list_ports();
    if ports.is_empty() {
        println!("No serial ports found.");
    } else {
        for p in ports {
            println!("{p}");
        }
    }
    Ok(())
}

pub fn list_carts(catalog: &Catalog, platform: Option<PortMode>) -> CliResult<()> {
    let mut shown = 0usize;
    for cart in catalog.entries() {
        if let Some(p) = platform {
            if cart.platform != p {
                continue;
            }
        }
        let platform = match cart.platform {
            PortMode::Dmg => "DMG",
            PortMode::Agb => "AGB",
        };
        println!(
            "{:<40} {} {:>5} {:>9} bytes",
            cart.name(),
            platform,
            cart.voltage.to_string(),
            cart.chip_size
        );
        shown += 1;
    }
    println!("{shown} cartridge types.");
    Ok(())
}
