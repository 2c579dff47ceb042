//! Port listing and Hactar discovery.

use {
    crate::{Cli, config::Config},
    anyhow::Result,
    console::style,
    hactarflash::{DetectedPort, discover_hactar_ports, discover_ports},
};

fn print_ports_json(ports: &[DetectedPort]) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(ports)?);
    Ok(())
}

fn print_port(port: &DetectedPort) {
    let device_type = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
    } else {
        String::new()
    };
    let vid_pid = match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };
    let product = port
        .product
        .as_deref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    eprintln!(
        "  {} {}{device_type}{vid_pid}{product}",
        style("•").green(),
        style(&port.name).cyan(),
    );
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = discover_ports();

    if json {
        return print_ports_json(&detected);
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    }
    for port in &detected {
        print_port(port);
    }

    let candidates = detected.iter().filter(|p| p.is_candidate()).count();
    if candidates > 0 {
        eprintln!(
            "\n{} {candidates} USB serial port(s) will be probed by `hactarflash scan`",
            style("→").green().bold()
        );
    }
    Ok(())
}

/// Scan command implementation.
pub(crate) fn cmd_scan(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let found = discover_hactar_ports(config.baud(cli.baud));

    if json {
        return print_ports_json(&found);
    }

    if found.is_empty() {
        eprintln!("{} No Hactar found", style("⚠").yellow());
        return Ok(());
    }

    eprintln!("{}", style("Hactar boards").bold().underlined());
    for port in &found {
        print_port(port);
    }
    Ok(())
}
