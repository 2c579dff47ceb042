//! SLIP framing for the ESP32 stub loader.
//!
//! ## Packet Format
//!
//! ```text
//! +-----+-----+-----+--------+----------+-----------+-----+
//! | END | Dir | Cmd | Length | Checksum |  Payload  | END |
//! +-----+-----+-----+--------+----------+-----------+-----+
//! | 1   | 1   | 1   | 2 (LE) | 4 (LE)   |  Length   | 1   |
//! +-----+-----+-----+--------+----------+-----------+-----+
//! ```
//!
//! Every header and payload byte equal to END or ESC is replaced by a two
//! byte escape sequence, so END only ever appears as a delimiter.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::transport::try_read,
    },
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    log::{debug, trace},
    std::time::{Duration, Instant},
};

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape introducer.
pub const ESC: u8 = 0xDB;
/// Escaped END.
pub const ESC_END: u8 = 0xDC;
/// Escaped ESC.
pub const ESC_ESC: u8 = 0xDD;

/// Unescaped header size.
pub const HEADER_LEN: usize = 8;

/// Seed of the payload checksum.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Direction byte of host requests.
pub const DIR_REQUEST: u8 = 0x00;
/// Direction byte of device responses.
pub const DIR_RESPONSE: u8 = 0x01;

/// XOR-fold of the payload, seeded with 0xEF.
pub fn checksum(payload: &[u8]) -> u32 {
    u32::from(payload.iter().fold(CHECKSUM_SEED, |acc, b| acc ^ b))
}

/// One stub-loader packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlipPacket {
    /// 0 for requests, 1 for responses.
    pub direction: u8,
    /// Command opcode.
    pub command: u8,
    /// Payload length as carried in the header.
    pub length: u16,
    /// Checksum field (requests) or value field (responses).
    pub checksum: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl SlipPacket {
    /// Create a packet; the length field follows the payload.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(direction: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            direction,
            command,
            // Payloads are bounded by the 0x400 block size plus a 16 byte prefix.
            length: payload.len() as u16,
            checksum: 0,
            payload,
        }
    }

    /// Create a host-to-device request.
    pub fn request(command: u8, payload: Vec<u8>) -> Self {
        Self::new(DIR_REQUEST, command, payload)
    }

    /// Unescaped header bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn header(&self, checksum: u32) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.push(self.direction);
        header.push(self.command);
        header.write_u16::<LittleEndian>(self.length).unwrap();
        header.write_u32::<LittleEndian>(checksum).unwrap();
        header
    }

    /// Encode into a delimited, escaped frame.
    ///
    /// With `with_checksum` the checksum field is recomputed from the
    /// payload; otherwise the stored field is sent as is.
    pub fn encode(&self, with_checksum: bool) -> Vec<u8> {
        let checksum = if with_checksum {
            checksum(&self.payload)
        } else {
            self.checksum
        };

        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + 8);
        out.push(END);
        for &byte in self.header(checksum).iter().chain(&self.payload) {
            match byte {
                END => out.extend_from_slice(&[ESC, ESC_END]),
                ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
                b => out.push(b),
            }
        }
        out.push(END);
        out
    }

    /// Decode a frame that starts and ends with END.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 || raw[0] != END || raw[raw.len() - 1] != END {
            return Err(Error::Format("SLIP frame is not delimited by END".into()));
        }

        let interior = unescape(&raw[1..raw.len() - 1])?;
        if interior.len() < HEADER_LEN {
            return Err(Error::Format(format!(
                "SLIP frame too short: {} bytes",
                interior.len()
            )));
        }

        let packet = Self {
            direction: interior[0],
            command: interior[1],
            length: LittleEndian::read_u16(&interior[2..4]),
            checksum: LittleEndian::read_u32(&interior[4..8]),
            payload: interior[HEADER_LEN..].to_vec(),
        };

        if usize::from(packet.length) != packet.payload.len() {
            debug!(
                "SLIP length field {} differs from payload length {}",
                packet.length,
                packet.payload.len()
            );
        }

        Ok(packet)
    }
}

fn unescape(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter();

    while let Some(&byte) = iter.next() {
        if byte != ESC {
            out.push(byte);
            continue;
        }
        match iter.next() {
            Some(&ESC_END) => out.push(END),
            Some(&ESC_ESC) => out.push(ESC),
            Some(&other) => {
                return Err(Error::Format(format!(
                    "Invalid SLIP escape sequence 0xDB {other:#04x}"
                )));
            },
            None => return Err(Error::Format("Truncated SLIP escape sequence".into())),
        }
    }

    Ok(out)
}

/// Read one raw frame (including both END bytes) from the port.
///
/// Bytes before the opening END are discarded. Returns `None` when the line
/// goes silent or `deadline` passes before the closing END arrives.
pub fn read_frame<P: Port + ?Sized>(
    port: &mut P,
    max_len: usize,
    deadline: Duration,
) -> Result<Option<Vec<u8>>> {
    let start = Instant::now();

    loop {
        if start.elapsed() > deadline {
            return Ok(None);
        }
        match try_read(port, 1)? {
            Some(b) if b[0] == END => break,
            Some(b) => trace!("Skipping {:#04x} before frame start", b[0]),
            None => return Ok(None),
        }
    }

    let mut frame = vec![END];
    loop {
        if start.elapsed() > deadline {
            return Ok(None);
        }
        let Some(b) = try_read(port, 1)? else {
            return Ok(None);
        };
        if b[0] == END {
            // Back-to-back END: the first one closed a previous empty frame.
            if frame.len() == 1 {
                continue;
            }
            frame.push(END);
            return Ok(Some(frame));
        }
        frame.push(b[0]);
        if frame.len() > max_len {
            return Err(Error::Format(format!(
                "SLIP frame exceeds {max_len} bytes"
            )));
        }
    }
}
