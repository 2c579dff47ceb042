//! Management console commands.
//!
//! The management firmware accepts `command_id(1) + length(4, LE)` frames.
//! Only the payload-less commands used around flashing are modelled here.

use {
    crate::{error::Result, port::Port, protocol::transport::try_read},
    byteorder::{LittleEndian, WriteBytesExt},
    log::{debug, trace},
    std::fmt,
};

/// Acknowledgement of a chip-select request.
pub const OK: u8 = 0x80;

/// The selected chip's bootloader is reachable.
pub const READY: u8 = 0x81;

/// Identity string answered to [`MgmtCommand::WhoAreYou`].
pub const HELLO: &[u8] = b"HELLO, I AM A HACTAR DEVICE";

/// Length of the `Ok\n` line preceding a text reply.
pub const OK_LINE_LEN: usize = 3;

/// Upper bound on bytes discarded by [`drain`].
const MAX_DRAIN_BYTES: usize = 64 * 1024;

/// Management console command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MgmtCommand {
    /// Firmware version.
    Version = 0,
    /// Identity probe.
    WhoAreYou = 1,
    /// Power-cycle the whole board.
    HardReset = 2,
    /// Reset the management chip.
    Reset = 3,
    /// Reset the UI chip.
    ResetUi = 4,
    /// Reset the network chip.
    ResetNet = 5,
    /// Put the UI chip into its bootloader.
    FlashUi = 6,
    /// Put the network chip into its bootloader.
    FlashNet = 7,
    /// Forward logs of both chips.
    EnableLogs = 8,
    /// Forward UI chip logs.
    EnableUiLogs = 9,
    /// Forward network chip logs.
    EnableNetLogs = 10,
    /// Stop forwarding logs.
    DisableLogs = 11,
    /// Stop forwarding UI chip logs.
    DisableUiLogs = 12,
    /// Stop forwarding network chip logs.
    DisableNetLogs = 13,
    /// Restore the default log routing.
    DefaultLogging = 14,
}

impl MgmtCommand {
    /// All commands in id order.
    pub const ALL: [Self; 15] = [
        Self::Version,
        Self::WhoAreYou,
        Self::HardReset,
        Self::Reset,
        Self::ResetUi,
        Self::ResetNet,
        Self::FlashUi,
        Self::FlashNet,
        Self::EnableLogs,
        Self::EnableUiLogs,
        Self::EnableNetLogs,
        Self::DisableLogs,
        Self::DisableUiLogs,
        Self::DisableNetLogs,
        Self::DefaultLogging,
    ];

    /// Command name as typed on the console.
    pub fn name(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::WhoAreYou => "who are you",
            Self::HardReset => "hard reset",
            Self::Reset => "reset",
            Self::ResetUi => "reset ui",
            Self::ResetNet => "reset net",
            Self::FlashUi => "flash ui",
            Self::FlashNet => "flash net",
            Self::EnableLogs => "enable logs",
            Self::EnableUiLogs => "enable ui logs",
            Self::EnableNetLogs => "enable net logs",
            Self::DisableLogs => "disable logs",
            Self::DisableUiLogs => "disable ui logs",
            Self::DisableNetLogs => "disable net logs",
            Self::DefaultLogging => "default logging",
        }
    }

    /// Look a command up by console name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Wire frame: id followed by a zero length.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn frame(self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(5);
        frame.push(self as u8);
        frame.write_u32::<LittleEndian>(0).unwrap();
        frame
    }
}

impl fmt::Display for MgmtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Send a command frame.
pub fn send<P: Port + ?Sized>(port: &mut P, command: MgmtCommand) -> Result<()> {
    debug!("Sending management command '{command}'");
    port.write_all_bytes(&command.frame())
}

/// Discard input until a read times out. Returns the number of bytes dropped.
pub fn drain<P: Port + ?Sized>(port: &mut P) -> Result<usize> {
    let mut dropped = 0;
    while dropped < MAX_DRAIN_BYTES {
        match try_read(port, 1)? {
            Some(_) => dropped += 1,
            None => break,
        }
    }
    trace!("Drained {dropped} bytes");
    Ok(dropped)
}

/// Stop log forwarding and wait for the line to go quiet.
pub fn silence_logs<P: Port + ?Sized>(port: &mut P) -> Result<usize> {
    send(port, MgmtCommand::DisableLogs)?;
    drain(port)
}
