//! Flash command implementation.

use {
    crate::{
        Cli, CliError,
        config::Config,
        serial::{self, SerialOptions},
        use_fancy_output, was_interrupted,
    },
    anyhow::{Context, Result, anyhow},
    console::style,
    dialoguer::{Confirm, theme::ColorfulTheme},
    hactarflash::{
        Chip, ChipConfigStore, EraseVerify, FlashProgress, NativePort, RecoveryPolicy,
        SerialConfig, UploaderOptions, command, flasher, select::BootloaderPrompt,
    },
    indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::{error, info},
    std::{
        io::IsTerminal,
        path::PathBuf,
        sync::{Mutex, PoisonError},
        thread,
    },
};

/// Arguments of `hactarflash flash`.
pub(crate) struct FlashArgs<'a> {
    /// `ui+net+mgmt` style chip list.
    pub chips: &'a str,
    /// Firmware per chip, positionally matched to `chips`.
    pub bins: &'a [PathBuf],
    /// Stop after the chip-select handshake.
    pub select_only: bool,
    pub no_recover: bool,
    /// Overrides the configured attempt bound.
    pub attempts: Option<usize>,
    pub full_erase_verify: bool,
}

/// Everything one device thread needs.
struct DeviceJob<'a> {
    port: &'a str,
    baud: u32,
    plan: &'a [(Chip, Option<PathBuf>)],
    policy: &'a RecoveryPolicy,
    chip_store: &'a ChipConfigStore,
    erase_verify: EraseVerify,
    select_only: bool,
    non_interactive: bool,
    multi: &'a MultiProgress,
}

/// One operator prompt at a time across device threads.
static PROMPT_LOCK: Mutex<()> = Mutex::new(());

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".into()).into())
    } else {
        Ok(())
    }
}

/// Pair each chip with its firmware.
fn plan_chips(
    chips: &[Chip],
    bins: &[PathBuf],
    select_only: bool,
) -> Result<Vec<(Chip, Option<PathBuf>)>> {
    if select_only {
        if chips.len() != 1 {
            return Err(CliError::Usage("--select-only takes exactly one chip".into()).into());
        }
        return Ok(vec![(chips[0], None)]);
    }

    if bins.len() != chips.len() {
        return Err(CliError::Usage(format!(
            "{} chip(s) selected but {} firmware path(s) given; pass one --bin per chip",
            chips.len(),
            bins.len()
        ))
        .into());
    }

    for (chip, bin) in chips.iter().zip(bins) {
        let ok = if chip.is_stm32() {
            bin.is_file()
        } else {
            bin.is_dir()
        };
        if !ok {
            let expected = if chip.is_stm32() {
                "firmware binary"
            } else {
                "build directory"
            };
            return Err(CliError::Usage(format!(
                "{} is not a {expected} for {chip}",
                bin.display()
            ))
            .into());
        }
    }

    Ok(chips
        .iter()
        .copied()
        .zip(bins.iter().cloned().map(Some))
        .collect())
}

fn new_progress_bar(multi: &MultiProgress, port: &str, quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = multi.add(ProgressBar::new(0));
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:.bold} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_prefix(port.to_string());
    pb
}

/// Confirmation that the operator entered the management bootloader.
fn bootloader_prompt(port: &str, multi: &MultiProgress) -> BootloaderPrompt {
    let port = port.to_string();
    let multi = multi.clone();
    Box::new(move || {
        let _guard = PROMPT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let confirmed = multi.suspend(|| {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(format!(
                    "Put the management chip of the board on {port} into bootloader mode \
                     (hold BOOT, tap RESET). Ready?"
                ))
                .default(true)
                .interact_opt()
        });

        match confirmed {
            Ok(Some(true)) => Ok(()),
            Ok(_) => Err(hactarflash::Error::Interrupted),
            Err(dialoguer::Error::IO(e)) => Err(hactarflash::Error::Io(e)),
        }
    })
}

fn report_progress(pb: &ProgressBar, chip: Chip, progress: &FlashProgress) {
    pb.set_length(progress.total as u64);
    pb.set_position(progress.current as u64);
    pb.set_message(format!("{chip} {}", progress.phase));
}

/// Flash every planned chip of one board, in order.
fn flash_device(job: &DeviceJob<'_>, pb: &ProgressBar) -> Result<()> {
    for (chip, binary) in job.plan {
        ensure_not_interrupted()?;
        pb.set_message(format!("{chip} select"));

        let mut port = NativePort::open(&SerialConfig::new(job.port, job.baud))
            .with_context(|| format!("Failed to open {}", job.port))?;
        if *chip != Chip::Mgmt {
            command::silence_logs(&mut port)?;
        }

        let can_prompt = !job.non_interactive && std::io::stdin().is_terminal();
        let prompt = (*chip == Chip::Mgmt && can_prompt)
            .then(|| bootloader_prompt(job.port, job.multi));
        let options = UploaderOptions {
            binary: binary.clone(),
            chip_store: job.chip_store.clone(),
            erase_verify: job.erase_verify,
            prompt,
        };
        let mut uploader = chip.create_uploader_with_port(port, options)?;

        let result = if job.select_only {
            flasher::select_only(uploader.as_mut(), job.policy)
        } else {
            uploader.flash_firmware(job.policy, &mut |p| report_progress(pb, *chip, &p))
        };
        uploader.close();

        result.with_context(|| format!("Flashing {chip} on {} failed", job.port))?;
        info!("{}: {chip} done", job.port);
    }
    Ok(())
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, args: &FlashArgs<'_>) -> Result<()> {
    let chips = Chip::parse_list(args.chips).map_err(|e| CliError::Usage(e.to_string()))?;
    let plan = plan_chips(&chips, args.bins, args.select_only)?;
    let policy = config.recovery_policy(args.no_recover, args.attempts);
    let chip_store = config.chip_store(None)?;
    let erase_verify = config.erase_verify(args.full_erase_verify);
    let baud = config.baud(cli.baud);

    let options = SerialOptions {
        port: cli.port.clone(),
        baud,
        non_interactive: cli.non_interactive,
    };
    let ports = serial::select_ports(&options, config)?;
    ensure_not_interrupted()?;

    let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr());

    // One thread per board; boards never share a link.
    let results: Vec<(String, Result<()>)> = thread::scope(|scope| {
        let handles: Vec<_> = ports
            .iter()
            .map(|port| {
                let pb = new_progress_bar(&multi, port, cli.quiet);
                let job = DeviceJob {
                    port,
                    baud,
                    plan: &plan,
                    policy: &policy,
                    chip_store: &chip_store,
                    erase_verify,
                    select_only: args.select_only,
                    non_interactive: cli.non_interactive,
                    multi: &multi,
                };
                let handle = scope.spawn(move || {
                    let result = flash_device(&job, &pb);
                    match &result {
                        Ok(()) => pb.finish_with_message("done"),
                        Err(_) => pb.abandon_with_message("failed"),
                    }
                    result
                });
                (port.clone(), handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(port, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("Flashing thread for {port} panicked")));
                (port, result)
            })
            .collect()
    });

    let total = results.len();
    let mut failures: Vec<(String, anyhow::Error)> = Vec::new();
    for (port, result) in results {
        match result {
            Ok(()) => {
                if !cli.quiet {
                    eprintln!("{} {port}", style("✓").green().bold());
                }
            },
            Err(e) => {
                if total > 1 {
                    error!("{port}: {e:#}");
                }
                failures.push((port, e));
            },
        }
    }

    if failures.is_empty() {
        if !cli.quiet {
            let what = if args.select_only {
                "Bootloader mode entered"
            } else {
                "Flashing completed"
            };
            eprintln!("\n{} {what}", style("🎉").green().bold());
        }
        return Ok(());
    }

    if total == 1 {
        if let Some((_, err)) = failures.pop() {
            return Err(err);
        }
    }
    Err(anyhow!("{} of {total} device(s) failed", failures.len()))
}
