//! # hactarflash
//!
//! A library for flashing the chips of a Hactar board over its single
//! shared serial link.
//!
//! This crate provides:
//!
//! - STM32 USART bootloader (AN3155) engine for the management and UI MCUs
//! - ESP32S3 stub-loader engine over SLIP for the network co-processor
//! - Chip-select handshake through the management console
//! - Resumable erase/write/verify with an orchestrated recovery loop
//! - Hactar device discovery
//!
//! ## Example
//!
//! ```rust,no_run
//! use hactarflash::{Chip, RecoveryPolicy, UploaderOptions, discover_hactar_ports};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = discover_hactar_ports(115200)
//!         .into_iter()
//!         .next()
//!         .ok_or("no Hactar found")?;
//!
//!     let options = UploaderOptions {
//!         binary: Some("build/net".into()),
//!         ..Default::default()
//!     };
//!     let mut uploader = Chip::Net.create_uploader(&port.name, 115200, options)?;
//!     uploader.flash_firmware(&RecoveryPolicy::default(), &mut |p| {
//!         println!("{}: {}/{}", p.phase, p.current, p.total);
//!     })?;
//!     uploader.close();
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod command;
pub mod device;
pub mod error;
pub mod flasher;
pub mod host;
pub mod port;
pub mod protocol;
pub mod select;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker consulted by the recovery loop.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

/// Serialises tests that raise the interrupt flag or enter recovery.
#[cfg(test)]
pub(crate) fn interrupt_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// Re-exports for convenience
pub use {
    command::MgmtCommand,
    device::{DetectedPort, DeviceKind, TransportKind},
    error::{Error, Result},
    flasher::{FlashProgress, Phase, RecoveryPolicy},
    host::{discover_hactar_ports, discover_ports, probe_hactar},
    port::{NativePort, NativePortEnumerator, Parity, Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{BootloaderReply, SlipPacket},
    target::{
        Chip, ChipConfig, ChipConfigStore, EraseVerify, Esp32Uploader, FlashImage, FlashPlan,
        SectorInfo, Stm32Uploader, Uploader, UploaderOptions,
    },
};
