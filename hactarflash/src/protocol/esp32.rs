//! ESP32 stub-loader opcodes and request payloads.
//!
//! Every request travels as a [`SlipPacket`](super::slip::SlipPacket). The
//! response echoes the request opcode and its trailing status byte is zero on
//! success.

use byteorder::{LittleEndian, WriteBytesExt};

/// Flash transfer block size.
pub const BLOCK_SIZE: usize = 0x400;

/// Resume granularity of an interrupted image write.
pub const PAGE_SIZE: usize = 0x1000;

/// Total flash of the Hactar's ESP32S3 module.
pub const FLASH_SIZE: u32 = 0x40_0000;

/// Stub-loader opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Start a flash write.
    FlashBegin = 0x02,
    /// One block of flash data.
    FlashData = 0x03,
    /// Finish the flash write.
    FlashEnd = 0x04,
    /// Autobaud synchronisation.
    Sync = 0x08,
    /// Flash geometry.
    SpiSetParams = 0x0B,
    /// Attach the SPI flash.
    SpiAttach = 0x0D,
    /// MD5 of a flash region.
    SpiFlashMd5 = 0x13,
}

impl Opcode {
    /// Numeric opcode.
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
fn words(values: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for &v in values {
        buf.write_u32::<LittleEndian>(v).unwrap();
    }
    buf
}

/// Sync payload: `07 07 12 20` followed by 32 × 0x55.
pub fn sync_payload() -> Vec<u8> {
    let mut payload = vec![0x07, 0x07, 0x12, 0x20];
    payload.extend_from_slice(&[0x55; 32]);
    payload
}

/// SpiAttach payload (default pins).
pub fn attach_spi_payload() -> Vec<u8> {
    vec![0; 8]
}

/// SpiSetParams payload: 4 MiB total, 64 KiB block, 4 KiB sector,
/// 256 B page, status mask 0xFFFF.
pub fn spi_params_payload() -> Vec<u8> {
    words(&[0, FLASH_SIZE, 64 * 1024, 4 * 1024, 256, 0xFFFF])
}

/// FlashBegin payload.
#[allow(clippy::cast_possible_truncation)]
pub fn flash_begin_payload(erase_size: u32, num_blocks: u32, offset: u32) -> Vec<u8> {
    words(&[erase_size, num_blocks, BLOCK_SIZE as u32, offset, 0])
}

/// FlashData payload: header plus `data` padded with 0xFF to a full block.
#[allow(clippy::cast_possible_truncation)]
pub fn flash_data_payload(sequence: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = words(&[BLOCK_SIZE as u32, sequence, 0, 0]);
    payload.extend_from_slice(data);
    payload.resize(16 + BLOCK_SIZE.max(data.len()), 0xFF);
    payload
}

/// FlashEnd payload; 0 reboots into the new image.
pub fn flash_end_payload(reboot_flag: u32) -> Vec<u8> {
    words(&[reboot_flag])
}

/// SpiFlashMd5 payload.
pub fn flash_md5_payload(address: u32, size: u32) -> Vec<u8> {
    words(&[address, size, 0, 0])
}

/// Whether a response payload reports success.
pub fn status_ok(payload: &[u8]) -> bool {
    payload.last() == Some(&0)
}

/// Length of the ASCII hex digest in an MD5 response.
pub const MD5_HEX_LEN: usize = 32;

/// Extract the digest of an MD5 response, restoring its byte order.
pub fn md5_digest(payload: &[u8]) -> Option<Vec<u8>> {
    let mut digest = payload.get(..MD5_HEX_LEN)?.to_vec();
    digest.reverse();
    Some(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_payload() {
        let payload = sync_payload();
        assert_eq!(payload.len(), 36);
        assert_eq!(&payload[..4], &[0x07, 0x07, 0x12, 0x20]);
        assert!(payload[4..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn test_spi_params_payload() {
        let payload = spi_params_payload();
        assert_eq!(payload.len(), 24);
        assert_eq!(&payload[4..8], &[0x00, 0x00, 0x40, 0x00]);
        assert_eq!(&payload[20..24], &[0xFF, 0xFF, 0x00, 0x00]);
    }

    #[test]
    fn test_flash_begin_payload() {
        let payload = flash_begin_payload(0x1234, 5, 0x10000);
        assert_eq!(
            payload,
            vec![
                0x34, 0x12, 0, 0, 5, 0, 0, 0, 0x00, 0x04, 0, 0, 0x00, 0x00, 0x01, 0x00, 0, 0, 0, 0
            ]
        );
    }

    #[test]
    fn test_flash_data_pads_last_block() {
        let payload = flash_data_payload(3, &[0xAA; 10]);
        assert_eq!(payload.len(), 16 + BLOCK_SIZE);
        assert_eq!(&payload[4..8], &[3, 0, 0, 0]);
        assert_eq!(&payload[16..26], &[0xAA; 10]);
        assert!(payload[26..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_status_ok() {
        assert!(status_ok(&[0x00, 0x00]));
        assert!(!status_ok(&[0x00, 0x01]));
        assert!(status_ok(&[0xAB, 0xCD, 0x00, 0x00]));
        assert!(!status_ok(&[]));
    }

    #[test]
    fn test_md5_digest_is_reversed() {
        let mut payload: Vec<u8> = b"0123456789abcdef0123456789abcdef".to_vec();
        payload.extend_from_slice(&[0, 0]);

        let digest = md5_digest(&payload).unwrap();
        assert_eq!(digest, b"fedcba9876543210fedcba9876543210".to_vec());
        assert!(md5_digest(&payload[..20]).is_none());
    }
}
