//! Serial port selection.
//!
//! An explicit port (flag, environment or config file) is used as given.
//! Otherwise every USB serial port is probed for a Hactar and all boards
//! that answer are used. When none answers, an interactive session may
//! still pick a port by hand; non-interactive mode fails instead.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    hactarflash::{DetectedPort, device::format_port_list, discover_hactar_ports, discover_ports},
    log::{debug, info},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port from the command line or environment.
    pub port: Option<String>,
    /// Console baud rate used for probing.
    pub baud: u32,
    /// Never prompt.
    pub non_interactive: bool,
}

fn device_not_found(message: &str) -> anyhow::Error {
    CliError::DeviceNotFound(message.to_string()).into()
}

/// Ports of the boards to work on, sorted by name.
pub fn select_ports(options: &SerialOptions, config: &Config) -> Result<Vec<String>> {
    if let Some(port) = config.port(options.port.as_deref()) {
        debug!("Using port {port}");
        return Ok(vec![port]);
    }

    info!("Searching for Hactar boards");
    let found = discover_hactar_ports(options.baud);
    if !found.is_empty() {
        return Ok(found.into_iter().map(|p| p.name).collect());
    }

    if options.non_interactive {
        return Err(device_not_found(
            "No Hactar found; pass --port to use a specific serial port",
        ));
    }

    let ports = discover_ports();
    if ports.is_empty() {
        return Err(device_not_found("No serial ports found"));
    }

    ensure_interactive_terminal()?;
    select_port_interactive(&ports).map(|port| vec![port])
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(CliError::Usage(
            "No Hactar answered and no terminal is available to pick a port; use --port".into(),
        )
        .into())
    }
}

/// Map a dialoguer failure to a CLI error.
pub fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Selection cancelled".into()).into()
            } else {
                CliError::Usage(format!("Prompt failed: {io_err}")).into()
            }
        },
    }
}

fn select_port_interactive(ports: &[DetectedPort]) -> Result<String> {
    eprintln!(
        "{} No Hactar answered; {} serial port(s) available",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = usize::from(console::Term::stderr().size().1);
    let max_item_width = term_width.saturating_sub(4);
    let items: Vec<String> = format_port_list(ports)
        .into_iter()
        .map(|line| console::truncate_str(&line, max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the port of your Hactar")
        .items(&items)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .get(index)
            .map(|p| p.name.clone())
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("Selection cancelled".into()).into()),
    }
}
