//! Chip table listing.

use {
    crate::config::Config,
    anyhow::Result,
    console::style,
    hactarflash::ChipConfig,
    std::path::Path,
};

/// Table entry as printed by `--json`.
fn chip_json(config: &ChipConfig) -> serde_json::Value {
    let sectors: Vec<serde_json::Value> = config
        .sectors
        .iter()
        .map(|s| {
            serde_json::json!({
                "addr": format!("0x{:08X}", s.addr),
                "size": s.size,
            })
        })
        .collect();

    serde_json::json!({
        "pid": format!("0x{:03X}", config.pid),
        "usr_start_addr": format!("0x{:08X}", config.usr_start_addr),
        "flash_size": config.flash_size(),
        "sectors": sectors,
    })
}

/// Compress runs of equally sized sectors, e.g. `4 x 16K, 1 x 64K`.
fn describe_sectors(config: &ChipConfig) -> String {
    let mut runs: Vec<(usize, u32)> = Vec::new();
    for sector in &config.sectors {
        match runs.last_mut() {
            Some((count, size)) if *size == sector.size => *count += 1,
            _ => runs.push((1, sector.size)),
        }
    }

    runs.iter()
        .map(|(count, size)| format!("{count} x {}K", size / 1024))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Chip info command implementation.
pub(crate) fn cmd_chip_info(config: &Config, chip_config: Option<&Path>, json: bool) -> Result<()> {
    let store = config.chip_store(chip_config)?;

    if json {
        let chips: Vec<serde_json::Value> = store.iter().map(chip_json).collect();
        println!("{}", serde_json::to_string_pretty(&chips)?);
        return Ok(());
    }

    eprintln!("{}", style("STM32 chip table").bold().underlined());
    for chip in store.iter() {
        eprintln!(
            "\n  {} {}",
            style("PID").dim(),
            style(format!("0x{:03X}", chip.pid)).cyan().bold()
        );
        eprintln!("       User start: 0x{:08X}", chip.usr_start_addr);
        eprintln!("       Flash:      {} KiB", chip.flash_size() / 1024);
        eprintln!("       Sectors:    {}", describe_sectors(chip));
    }
    Ok(())
}
