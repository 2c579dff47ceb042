//! STM32 USART bootloader (AN3155) command codes and frame builders.
//!
//! ## Frame Format
//!
//! ```text
//! Command:   | opcode | ~opcode |
//! Address:   | a31..24 | a23..16 | a15..8 | a7..0 | XOR |
//! Write:     | N-1 | data (N bytes, N % 4 == 0) | XOR(N-1, data) |
//! Erase:     | 0x00 | 0x00 | s15..8 | s7..0 | XOR |
//! ```
//!
//! Sync (0x7F) is the only byte sent without its complement.

use std::fmt;

/// Largest transfer of a single ReadMemory/WriteMemory request.
pub const MAX_TRANSFER: usize = 256;

/// Padding byte used to round write chunks up to a word boundary.
pub const PAD_BYTE: u8 = 0xFF;

/// AN3155 commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Baud-rate detection byte.
    Sync = 0x7F,
    /// Version and supported commands.
    Get = 0x00,
    /// Version and read protection status.
    GetVersion = 0x01,
    /// Chip product id.
    GetId = 0x02,
    /// Read up to 256 bytes.
    ReadMemory = 0x11,
    /// Jump to user code.
    Go = 0x21,
    /// Write up to 256 bytes.
    WriteMemory = 0x31,
    /// Legacy one-byte-sector erase.
    Erase = 0x43,
    /// Two-byte-sector erase.
    ExtendedErase = 0x44,
    /// Enable write protection.
    WriteProtect = 0x63,
    /// Disable write protection.
    WriteUnprotect = 0x73,
    /// Enable readout protection.
    ReadoutProtect = 0x82,
    /// Disable readout protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    /// All known commands.
    pub const ALL: [Self; 13] = [
        Self::Sync,
        Self::Get,
        Self::GetVersion,
        Self::GetId,
        Self::ReadMemory,
        Self::Go,
        Self::WriteMemory,
        Self::Erase,
        Self::ExtendedErase,
        Self::WriteProtect,
        Self::WriteUnprotect,
        Self::ReadoutProtect,
        Self::ReadoutUnprotect,
    ];

    /// Look a command up by opcode.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as u8 == opcode)
    }

    /// The two-byte `[opcode, !opcode]` frame.
    pub fn frame(self) -> [u8; 2] {
        let op = self as u8;
        [op, !op]
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sync => "Sync",
            Self::Get => "Get",
            Self::GetVersion => "Get Version",
            Self::GetId => "Get ID",
            Self::ReadMemory => "Read Memory",
            Self::Go => "Go",
            Self::WriteMemory => "Write Memory",
            Self::Erase => "Erase",
            Self::ExtendedErase => "Extended Erase",
            Self::WriteProtect => "Write Protect",
            Self::WriteUnprotect => "Write Unprotect",
            Self::ReadoutProtect => "Readout Protect",
            Self::ReadoutUnprotect => "Readout Unprotect",
        };
        f.write_str(name)
    }
}

/// XOR of all bytes.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Big-endian address followed by its checksum.
pub fn address_frame(addr: u32) -> [u8; 5] {
    let a = addr.to_be_bytes();
    [a[0], a[1], a[2], a[3], xor_checksum(&a)]
}

/// Length byte of a ReadMemory request (`n - 1`) and its complement.
///
/// `n` must be in `1..=256`.
#[allow(clippy::cast_possible_truncation)]
pub fn read_length_frame(n: usize) -> [u8; 2] {
    let len = (n - 1) as u8;
    [len, !len]
}

/// Pad `chunk` to a multiple of four with 0xFF and wrap it as
/// `[len-1, data.., xor]`.
///
/// `chunk` must hold between 1 and 256 bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn write_chunk_frame(chunk: &[u8]) -> Vec<u8> {
    let padded_len = chunk.len().div_ceil(4) * 4;

    let mut frame = Vec::with_capacity(padded_len + 2);
    frame.push((padded_len - 1) as u8);
    frame.extend_from_slice(chunk);
    frame.resize(padded_len + 1, PAD_BYTE);
    frame.push(xor_checksum(&frame));
    frame
}

/// Single-sector ExtendedErase frame: count-1 (0), sector index, checksum.
pub fn erase_sector_frame(sector: u16) -> [u8; 5] {
    let [hi, lo] = sector.to_be_bytes();
    let body = [0x00, 0x00, hi, lo];
    [body[0], body[1], body[2], body[3], xor_checksum(&body)]
}

/// Reply to the Get command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderInfo {
    /// Bootloader protocol version (e.g. 0x31 for v3.1).
    pub version: u8,
    /// Opcodes the bootloader accepts.
    pub opcodes: Vec<u8>,
}

impl BootloaderInfo {
    /// Parse the bytes between the length byte and the final ACK.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (&version, opcodes) = bytes.split_first()?;
        Some(Self {
            version,
            opcodes: opcodes.to_vec(),
        })
    }

    /// Known commands among the advertised opcodes.
    pub fn commands(&self) -> Vec<Command> {
        self.opcodes
            .iter()
            .filter_map(|&op| Command::from_opcode(op))
            .collect()
    }

    /// Whether the bootloader advertises `command`.
    pub fn supports(&self, command: Command) -> bool {
        self.opcodes.contains(&(command as u8))
    }
}

impl fmt::Display for BootloaderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.version >> 4, self.version & 0x0F)
    }
}
