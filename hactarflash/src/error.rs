//! Error types for hactarflash.

use std::io;
use thiserror::Error;

/// Result type for hactarflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for hactarflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed JSON in a chip table or image manifest.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No bytes arrived before the read timeout.
    #[error("Timeout: {0}")]
    TransportTimeout(String),

    /// The bootloader answered with NACK.
    #[error("Rejected by bootloader: {0}")]
    ProtocolReject(String),

    /// Malformed or undersized packet.
    #[error("Malformed packet: {0}")]
    Format(String),

    /// Read-back or MD5 comparison failed after writing.
    #[error("Verification failed: {0}")]
    VerificationFailure(String),

    /// The chip id reported by the bootloader has no configuration entry.
    #[error("No chip configuration for PID {pid:#06x}")]
    ConfigurationMissing {
        /// Product id returned by GetID.
        pid: u32,
    },

    /// The management firmware did not answer a chip-select request.
    #[error("Handshake failed: expected {expected:#04x}, got {}", describe_byte(.received))]
    HandshakeFailure {
        /// Byte we waited for.
        expected: u8,
        /// Last byte observed, if any.
        received: Option<u8>,
    },

    /// Firmware does not fit into the chip's flash.
    #[error("Firmware of {required} bytes does not fit into {available} bytes of flash")]
    InsufficientFlash {
        /// Firmware length.
        required: usize,
        /// Total size of all sectors.
        available: usize,
    },

    /// Invalid ESP32 image manifest.
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device not found.
    #[error("Device not found")]
    DeviceNotFound,

    /// The embedding application asked us to stop.
    #[error("Operation interrupted")]
    Interrupted,

    /// Unsupported chip or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

fn describe_byte(byte: &Option<u8>) -> String {
    byte.map_or_else(|| "nothing".to_string(), |b| format!("{b:#04x}"))
}

impl Error {
    /// Whether the orchestrator may retry the failed phase after
    /// re-selecting the chip.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Serial(_)
                | Self::TransportTimeout(_)
                | Self::ProtocolReject(_)
                | Self::HandshakeFailure { .. }
        )
    }
}
