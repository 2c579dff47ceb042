//! Byte transport primitives shared by the bootloader engines.
//!
//! All reads are bounded by the port timeout. A request that is answered by
//! neither ACK nor NACK is re-sent in full up to the retry bound; a NACK is
//! returned immediately so the caller can re-synchronise instead.

use {
    crate::{
        error::{Error, Result},
        port::Port,
    },
    log::{debug, trace},
    std::io::ErrorKind,
};

/// Acknowledge byte of the STM32 bootloader.
pub const ACK: u8 = 0x79;

/// Negative acknowledge byte of the STM32 bootloader.
pub const NACK: u8 = 0x1F;

/// Default retry bound for a single request.
pub const DEFAULT_RETRIES: usize = 5;

/// Single-byte answer to a bootloader request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderReply {
    /// Request accepted (0x79).
    Ack,
    /// Request rejected (0x1F).
    Nack,
    /// Nothing arrived before the read timeout.
    Timeout,
    /// A byte that is neither ACK nor NACK.
    Invalid(u8),
}

impl BootloaderReply {
    /// Classify a received byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            ACK => Self::Ack,
            NACK => Self::Nack,
            other => Self::Invalid(other),
        }
    }

    /// Turn anything but an ACK into the matching typed error.
    pub fn into_result(self, context: &str) -> Result<()> {
        match self {
            Self::Ack => Ok(()),
            Self::Nack => Err(Error::ProtocolReject(context.to_string())),
            Self::Timeout => Err(Error::TransportTimeout(context.to_string())),
            Self::Invalid(byte) => Err(Error::Format(format!(
                "{context}: unexpected reply {byte:#04x}"
            ))),
        }
    }
}

/// Read up to `n` bytes. Returns `None` when nothing arrived at all.
///
/// Only timeouts are absorbed; any other I/O error is returned.
pub fn try_read<P: Port + ?Sized>(port: &mut P, n: usize) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;

    while filled < n {
        match port.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
            Err(e) => return Err(e.into()),
        }
    }

    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    trace!("RX {:02X?}", buf);
    Ok(Some(buf))
}

/// Read exactly `n` bytes or fail with [`Error::TransportTimeout`].
pub fn read_exact<P: Port + ?Sized>(port: &mut P, n: usize, context: &str) -> Result<Vec<u8>> {
    let data = try_read(port, n)?.unwrap_or_default();
    if data.len() < n {
        return Err(Error::TransportTimeout(format!(
            "{context}: expected {n} bytes, got {}",
            data.len()
        )));
    }
    Ok(data)
}

/// Read a single ACK/NACK byte.
pub fn read_reply<P: Port + ?Sized>(port: &mut P) -> Result<BootloaderReply> {
    Ok(match try_read(port, 1)? {
        Some(bytes) => BootloaderReply::from_byte(bytes[0]),
        None => BootloaderReply::Timeout,
    })
}

/// Send one byte (optionally followed by its complement) and wait for ACK.
pub fn write_byte_expect_ack<P: Port + ?Sized>(
    port: &mut P,
    byte: u8,
    complement: bool,
    retries: usize,
) -> Result<BootloaderReply> {
    if complement {
        write_bytes_expect_ack(port, &[byte, byte ^ 0xFF], retries)
    } else {
        write_bytes_expect_ack(port, &[byte], retries)
    }
}

/// Send `bytes` and wait for ACK, re-sending on silence or garbage.
pub fn write_bytes_expect_ack<P: Port + ?Sized>(
    port: &mut P,
    bytes: &[u8],
    retries: usize,
) -> Result<BootloaderReply> {
    let mut last = BootloaderReply::Timeout;

    for attempt in 1..=retries.max(1) {
        trace!("TX {:02X?}", bytes);
        port.write_all_bytes(bytes)?;

        match read_reply(port)? {
            reply @ (BootloaderReply::Ack | BootloaderReply::Nack) => return Ok(reply),
            other => {
                debug!("No ACK (attempt {attempt}/{retries}): {other:?}");
                last = other;
                port.clear_buffers()?;
            },
        }
    }

    Ok(last)
}
