//! Info command implementation

use gbxflash_core::header::db::HeaderDatabase;
use gbxflash_core::link::{LinkPort, PortMode};
use gbxflash_core::transfer::Session;

use super::CliResult;

pub fn run_info<P: LinkPort>(
    session: &mut Session<P>,
    db: Option<&HeaderDatabase>,
) -> CliResult<()> {
    let info = session.read_info(db)?;

    match info.platform {
        PortMode::Agb => println!("Platform:  Game Boy Advance"),
        PortMode::Dmg => println!("Platform:  Game Boy"),
    }
    if let Some(name) = &info.display_name {
        println!("Database:  {name}");
    }

    if let Some(h) = &info.agb {
        println!("Title:     {}", h.title);
        println!("Game code: {} (maker {})", h.game_code, h.maker_code);
        println!("Version:   {}", h.version);
        println!(
            "Header:    logo {}, checksum {}",
            ok(h.logo_correct),
            ok(h.checksum_correct)
        );
        println!("Save type: {}", h.save_type.describe());
        println!("ROM CRC32: {:08X}", h.rom_crc32);
    }

    if let Some(h) = &info.dmg {
        println!("Title:     {}", h.title);
        if let Some(kind) = h.mapper {
            println!(
                "Mapper:    {} (type 0x{:02X}{})",
                kind.describe(),
                h.cart_type,
                if h.has_rtc { ", RTC" } else { "" }
            );
        } else {
            println!("Mapper:    none (type 0x{:02X})", h.cart_type);
        }
        println!("ROM size:  {} bytes ({} banks)", h.rom_size, h.rom_banks);
        println!(
            "RAM size:  {} bytes{}",
            h.ram_size,
            if h.has_battery { ", battery" } else { "" }
        );
        println!(
            "Header:    logo {}, checksum {}, global checksum {}",
            ok(h.logo_correct),
            ok(h.header_checksum_correct),
            ok(h.rom_checksum_correct)
        );
        for rule in &h.overrides {
            println!("Override:  {rule}");
        }
    }

    println!("ROM size:  {} bytes", info.rom_size);
    if info.save_size > 0 {
        println!("Save size: {} bytes", info.save_size);
    }
    Ok(())
}

fn ok(good: bool) -> &'static str {
    if good {
        "ok"
    } else {
        "BAD"
    }
}
