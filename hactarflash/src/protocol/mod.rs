//! Wire protocols spoken over the shared link.

pub mod esp32;
pub mod slip;
pub mod stm32;
pub mod transport;

// Re-export common types
pub use slip::SlipPacket;
pub use transport::{ACK, BootloaderReply, NACK};
