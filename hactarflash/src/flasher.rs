//! Flash orchestration and the recovery loop.
//!
//! A flash runs the chip-select handshake and then each [`Phase`] of the
//! uploader in order. When a phase fails with a recoverable error and the
//! policy allows it, the orchestrator waits, re-selects the chip and runs
//! the same phase again. Phases keep their own progress, so the retry
//! resumes where the failed attempt stopped.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hactarflash::{Chip, RecoveryPolicy, UploaderOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = UploaderOptions {
//!         binary: Some("build/ui.bin".into()),
//!         ..Default::default()
//!     };
//!     let mut uploader = Chip::Ui.create_uploader("/dev/ttyUSB0", 115200, options)?;
//!
//!     uploader.flash_firmware(&RecoveryPolicy::default(), &mut |p| {
//!         println!("{}: {}/{}", p.phase, p.current, p.total);
//!     })?;
//!     uploader.close();
//!     Ok(())
//! }
//! ```

use {
    crate::{
        error::{Error, Result},
        target::Uploader,
    },
    log::{info, warn},
    std::{fmt, thread, time::Duration},
};

/// Step of a firmware flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Chip-select handshake.
    Select,
    /// Bootloader synchronisation and identification.
    Sync,
    /// Sector erase and erase verification.
    Erase,
    /// Firmware transfer.
    Write,
    /// Read-back or digest comparison.
    Verify,
    /// Jump to the new firmware.
    Go,
    /// Leave the bootloader.
    Finish,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Select => "Select",
            Self::Sync => "Sync",
            Self::Erase => "Erase",
            Self::Write => "Write",
            Self::Verify => "Verify",
            Self::Go => "Go",
            Self::Finish => "Finish",
        };
        f.write_str(name)
    }
}

/// Progress report of a long-running phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashProgress {
    /// Phase reporting.
    pub phase: Phase,
    /// Units done.
    pub current: usize,
    /// Units in total.
    pub total: usize,
}

impl FlashProgress {
    /// Create a progress report.
    pub fn new(phase: Phase, current: usize, total: usize) -> Self {
        Self {
            phase,
            current,
            total,
        }
    }
}

/// When and how often to re-enter a failed phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Retry recoverable failures at all.
    pub recover: bool,
    /// Attempts per phase, including the first.
    pub max_attempts: usize,
    /// Wait after a failure before re-selecting.
    pub backoff: Duration,
    /// Wait after resetting the link, before the handshake.
    pub select_delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            recover: true,
            max_attempts: 5,
            backoff: Duration::from_secs(3),
            select_delay: Duration::from_secs(5),
        }
    }
}

impl RecoveryPolicy {
    /// Fail on the first error.
    pub fn disabled() -> Self {
        Self {
            recover: false,
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set whether to recover.
    #[must_use]
    pub fn with_recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    /// Set the attempt bound.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set both waits.
    #[must_use]
    pub fn with_delays(mut self, backoff: Duration, select_delay: Duration) -> Self {
        self.backoff = backoff;
        self.select_delay = select_delay;
        self
    }

    fn should_retry(&self, err: &Error, attempt: usize) -> bool {
        self.recover && err.is_recoverable() && attempt < self.max_attempts
    }
}

/// Sleep, bailing out if the embedding application asked to stop.
fn pause(duration: Duration) -> Result<()> {
    if crate::is_interrupted_requested() {
        return Err(Error::Interrupted);
    }
    if !duration.is_zero() {
        thread::sleep(duration);
    }
    if crate::is_interrupted_requested() {
        return Err(Error::Interrupted);
    }
    Ok(())
}

/// Run the chip-select handshake, retrying it under `policy`.
pub fn select_with_recovery<U: Uploader + ?Sized>(
    uploader: &mut U,
    policy: &RecoveryPolicy,
) -> Result<()> {
    let mut attempt = 1;
    loop {
        match uploader.flash_select() {
            Ok(()) => return Ok(()),
            Err(e) if policy.should_retry(&e, attempt) => {
                warn!(
                    "Selecting {} failed (attempt {attempt}/{}): {e}",
                    uploader.chip(),
                    policy.max_attempts
                );
                attempt += 1;
                pause(policy.backoff)?;
                uploader.reset_link()?;
                pause(policy.select_delay)?;
            },
            Err(e) => return Err(e),
        }
    }
}

/// Run `op` as `phase`, re-selecting the chip and re-running `op` after
/// recoverable failures.
pub fn run_phase<U, F>(uploader: &mut U, policy: &RecoveryPolicy, phase: Phase, mut op: F) -> Result<()>
where
    U: Uploader + ?Sized,
    F: FnMut(&mut U) -> Result<()>,
{
    let mut attempt = 1;
    loop {
        match op(uploader) {
            Ok(()) => return Ok(()),
            Err(e) if policy.should_retry(&e, attempt) => {
                warn!(
                    "{phase} failed (attempt {attempt}/{}): {e}",
                    policy.max_attempts
                );
                info!("{phase}: recovery mode");
                attempt += 1;
                pause(policy.backoff)?;
                uploader.reset_link()?;
                pause(policy.select_delay)?;
                select_with_recovery(uploader, policy)?;
            },
            Err(e) => return Err(e),
        }
    }
}

/// Select the chip and run every phase of `uploader`.
pub fn flash_with_recovery<U: Uploader + ?Sized>(
    uploader: &mut U,
    policy: &RecoveryPolicy,
    progress: &mut dyn FnMut(FlashProgress),
) -> Result<()> {
    info!("Flashing {}", uploader.chip());
    select_with_recovery(uploader, policy)?;

    for phase in uploader.phases() {
        run_phase(uploader, policy, phase, |u| u.run_phase(phase, &mut *progress))?;
    }

    info!("Flashing {}: complete", uploader.chip());
    Ok(())
}

/// Only put the chip into bootloader mode, for use with an external tool.
pub fn select_only<U: Uploader + ?Sized>(uploader: &mut U, policy: &RecoveryPolicy) -> Result<()> {
    select_with_recovery(uploader, policy)?;
    info!("{} is in bootloader mode", uploader.chip());
    Ok(())
}
