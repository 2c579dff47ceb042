//! hactarflash CLI - Command-line tool for flashing Hactar boards.
//!
//! ## Features
//!
//! - Flash the UI, network and management chips over the board's serial link
//! - Discover Hactar boards and flash several of them in parallel
//! - Put a chip into bootloader mode for an external tool
//! - Shell completion generation
//! - Environment variable and config file support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars and colors should be used.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures classified by exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// No device to talk to (exit 4).
    #[error("{0}")]
    DeviceNotFound(String),
    /// Stopped by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// hactarflash - Flash firmware onto Hactar boards.
///
/// Environment variables:
///   HACTARFLASH_PORT              - Default serial port
///   HACTARFLASH_BAUD              - Default baud rate (default: 115200)
///   HACTARFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "hactarflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    hactarflash flash -c ui --bin build/ui.bin\n  \
    hactarflash flash -c ui+net --bin build/ui.bin --bin build/net\n  \
    hactarflash flash -c mgmt --select-only -p /dev/ttyUSB0\n  \
    hactarflash scan")]
pub(crate) struct Cli {
    /// Serial port of the board (Hactar boards are discovered if omitted).
    #[arg(short, long, global = true, env = "HACTARFLASH_PORT")]
    pub port: Option<String>,

    /// Baud rate of the management console.
    #[arg(short, long, global = true, env = "HACTARFLASH_BAUD")]
    pub baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "HACTARFLASH_NON_INTERACTIVE")]
    pub non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Flash firmware onto one or more chips of the board.
    Flash {
        /// Chips to flash, in order: ui, net, mgmt (e.g. ui+net+mgmt).
        #[arg(short, long = "chips", value_name = "LIST")]
        chips: String,

        /// Firmware per chip, in the order of --chips. STM32 chips take a
        /// binary, net takes a build directory holding flasher_args.json.
        #[arg(long = "bin", value_name = "PATH")]
        bins: Vec<PathBuf>,

        /// Only put the chip into bootloader mode, for a third-party flasher.
        #[arg(long)]
        select_only: bool,

        /// Fail on the first error instead of re-selecting the chip.
        #[arg(long)]
        no_recover: bool,

        /// Attempts per phase before giving up.
        #[arg(long, value_name = "N")]
        attempts: Option<usize>,

        /// Read back every erased sector instead of sampling.
        #[arg(long)]
        full_erase_verify: bool,
    },

    /// Probe serial ports for Hactar boards.
    Scan {
        /// Output devices as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show the STM32 flash layouts used for erase planning.
    ChipInfo {
        /// JSON chip table replacing the built-in one.
        #[arg(long, value_name = "PATH")]
        chip_config: Option<PathBuf>,

        /// Output the table as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Map a failure to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::DeviceNotFound(_) => 4,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<hactarflash::Error>() {
        Some(hactarflash::Error::Config(_)) => 3,
        Some(hactarflash::Error::DeviceNotFound) => 4,
        Some(hactarflash::Error::Interrupted) => 130,
        _ => 1,
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    // A second Ctrl-C aborts without waiting for the current step.
    let handler = || {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
        eprintln!("Interrupted, stopping after the current step (Ctrl-C again to abort)");
    };
    if let Err(e) = ctrlc::set_handler(handler) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    hactarflash::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Flash {
            chips,
            bins,
            select_only,
            no_recover,
            attempts,
            full_erase_verify,
        } => {
            let args = commands::flash::FlashArgs {
                chips,
                bins,
                select_only: *select_only,
                no_recover: *no_recover,
                attempts: *attempts,
                full_erase_verify: *full_erase_verify,
            };
            commands::flash::cmd_flash(cli, &config, &args)
        },
        Commands::Scan { json } => commands::ports::cmd_scan(cli, &config, *json),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::ChipInfo { chip_config, json } => {
            commands::chip_info::cmd_chip_info(&config, chip_config.as_deref(), *json)
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if std::env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "hactarflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "hactarflash",
            "flash",
            "-c",
            "ui+net",
            "--bin",
            "ui.bin",
            "--bin",
            "build/net",
        ])
        .unwrap();
        match cli.command {
            Commands::Flash {
                chips,
                bins,
                select_only,
                no_recover,
                attempts,
                full_erase_verify,
            } => {
                assert_eq!(chips, "ui+net");
                assert_eq!(bins, vec![PathBuf::from("ui.bin"), PathBuf::from("build/net")]);
                assert!(!select_only);
                assert!(!no_recover);
                assert_eq!(attempts, None);
                assert!(!full_erase_verify);
            },
            _ => panic!("Expected Flash command"),
        }
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "hactarflash",
            "-p",
            "/dev/ttyUSB0",
            "-b",
            "230400",
            "flash",
            "--chips",
            "mgmt",
            "--select-only",
            "--no-recover",
            "--attempts",
            "2",
            "--full-erase-verify",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(230_400));
        match cli.command {
            Commands::Flash {
                select_only,
                no_recover,
                attempts,
                full_erase_verify,
                bins,
                ..
            } => {
                assert!(select_only);
                assert!(no_recover);
                assert_eq!(attempts, Some(2));
                assert!(full_erase_verify);
                assert!(bins.is_empty());
            },
            _ => panic!("Expected Flash command"),
        }
    }

    #[test]
    fn test_cli_flash_requires_chips() {
        assert!(Cli::try_parse_from(["hactarflash", "flash"]).is_err());
    }

    #[test]
    fn test_cli_parse_scan_and_list_ports() {
        let cli = Cli::try_parse_from(["hactarflash", "scan", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Scan { json: true }));

        let cli = Cli::try_parse_from(["hactarflash", "list-ports"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: false }));
    }

    #[test]
    fn test_cli_parse_chip_info() {
        let cli =
            Cli::try_parse_from(["hactarflash", "chip-info", "--chip-config", "chips.json"])
                .unwrap();
        match cli.command {
            Commands::ChipInfo { chip_config, json } => {
                assert_eq!(chip_config, Some(PathBuf::from("chips.json")));
                assert!(!json);
            },
            _ => panic!("Expected ChipInfo command"),
        }
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["hactarflash", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Zsh }
        ));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "hactarflash",
            "-vv",
            "--non-interactive",
            "--config",
            "custom.toml",
            "scan",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.non_interactive);
        assert!(!cli.quiet);
        assert_eq!(cli.config_path, Some(PathBuf::from("custom.toml")));
        assert_eq!(cli.baud, None);
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["hactarflash"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        let usage: anyhow::Error = CliError::Usage("bad".into()).into();
        assert_eq!(exit_code_for(&usage), 2);

        let cancelled: anyhow::Error = CliError::Cancelled("stop".into()).into();
        assert_eq!(exit_code_for(&cancelled), 130);

        let not_found: anyhow::Error = hactarflash::Error::DeviceNotFound.into();
        assert_eq!(exit_code_for(&not_found), 4);

        let interrupted: anyhow::Error = hactarflash::Error::Interrupted.into();
        assert_eq!(exit_code_for(&interrupted), 130);

        let config: anyhow::Error = CliError::Config("broken".into()).into();
        assert_eq!(exit_code_for(&config), 3);

        let other: anyhow::Error =
            hactarflash::Error::VerificationFailure("mismatch".into()).into();
        assert_eq!(exit_code_for(&other), 1);
    }

    #[test]
    fn test_exit_code_survives_context() {
        let err = anyhow::Error::from(hactarflash::Error::DeviceNotFound).context("flashing ui");
        assert_eq!(exit_code_for(&err), 4);
    }
}
