//! Chip-select handshake.
//!
//! Routes the shared link into one chip's bootloader:
//!
//! | Chip | Request      | Replies        | Link after |
//! |------|--------------|----------------|------------|
//! | mgmt | DTR/RTS low  | none           | 8E1        |
//! | ui   | `flash ui`   | `OK`, `READY`  | 8E1        |
//! | net  | `flash net`  | `OK`, `READY`  | 8N1        |
//!
//! A missing reply is reported as [`Error::HandshakeFailure`]; retrying the
//! handshake is left to the orchestrator.

use {
    crate::{
        command::{self, MgmtCommand, OK, READY},
        error::{Error, Result},
        port::{Parity, Port},
        protocol::transport::try_read,
        target::Chip,
    },
    log::{debug, info},
};

/// Single-byte reads allowed while waiting for each handshake byte.
pub const PATTERN_RETRIES: usize = 5;

/// Callback asking the operator to put the management chip into its
/// bootloader, run after the link has switched to even parity.
pub type BootloaderPrompt = Box<dyn FnMut() -> Result<()> + Send>;

/// Wait for `expected`, tolerating up to `retries` other bytes or silences.
pub fn wait_for_pattern<P: Port + ?Sized>(port: &mut P, expected: u8, retries: usize) -> Result<()> {
    let mut received = None;

    for _ in 0..retries {
        if let Some(bytes) = try_read(port, 1)? {
            if bytes[0] == expected {
                return Ok(());
            }
            debug!("Waiting for {expected:#04x}, got {:#04x}", bytes[0]);
            received = Some(bytes[0]);
        }
    }

    Err(Error::HandshakeFailure { expected, received })
}

/// Switch the link into `chip`'s bootloader mode.
pub fn select_chip<P: Port + ?Sized>(
    port: &mut P,
    chip: Chip,
    prompt: Option<&mut BootloaderPrompt>,
) -> Result<()> {
    match chip {
        Chip::Mgmt => select_mgmt(port, prompt),
        Chip::Ui => select_via_console(port, MgmtCommand::FlashUi, Parity::Even),
        Chip::Net => select_via_console(port, MgmtCommand::FlashNet, Parity::None),
    }
}

fn select_mgmt<P: Port + ?Sized>(port: &mut P, prompt: Option<&mut BootloaderPrompt>) -> Result<()> {
    port.set_dtr(false)?;
    port.set_rts(false)?;
    port.set_parity(Parity::Even)?;
    info!("Link switched to even parity for the management bootloader");

    if let Some(prompt) = prompt {
        prompt()?;
    }

    port.clear_buffers()
}

fn select_via_console<P: Port + ?Sized>(
    port: &mut P,
    request: MgmtCommand,
    bootloader_parity: Parity,
) -> Result<()> {
    // The management console only speaks 8N1.
    if port.parity() != Parity::None {
        port.set_parity(Parity::None)?;
    }

    command::send(port, request)?;
    wait_for_pattern(port, OK, PATTERN_RETRIES)?;
    debug!("'{request}' confirmed");
    wait_for_pattern(port, READY, PATTERN_RETRIES)?;
    info!("'{request}': bootloader ready");

    if bootloader_parity != Parity::None {
        port.set_parity(bootloader_parity)?;
    }
    port.clear_buffers()
}
