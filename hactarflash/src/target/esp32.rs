//! ESP32S3 stub-loader engine for the network co-processor.
//!
//! Images listed in the build directory's `flasher_args.json` are written in
//! a fixed order (bootloader, partition table, app) and each is checked by
//! MD5 before the next one starts. Progress is kept as
//! `(binary_idx, data_idx)`; a retried write restarts at the last 4 KiB page
//! boundary of the image that failed.

use {
    crate::{
        error::{Error, Result},
        flasher::{FlashProgress, Phase},
        port::{DEFAULT_TIMEOUT, Parity, Port},
        protocol::{
            SlipPacket,
            esp32::{self, BLOCK_SIZE, Opcode, PAGE_SIZE},
            slip,
        },
        select,
        target::{Chip, Uploader},
    },
    log::{debug, info, trace, warn},
    serde::Deserialize,
    std::{
        collections::HashMap,
        fs, mem,
        path::{Path, PathBuf},
        time::{Duration, Instant},
    },
};

/// Manifest written by the ESP-IDF build.
pub const MANIFEST_FILE: &str = "flasher_args.json";

/// Manifest entries flashed, in flashing order.
pub const MANIFEST_KEYS: [&str; 3] = ["bootloader", "partition-table", "app"];

/// Deadline for one response frame.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on a single sync burst.
const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw frame size limit; escaping can double a payload.
const MAX_FRAME_LEN: usize = BLOCK_SIZE * 2;

/// Sends of the sync packet before giving up.
const SYNC_RETRIES: usize = 10;

/// Sends of any other request before giving up.
const COMMAND_RETRIES: usize = 5;

/// One image of the manifest, loaded into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    /// Manifest key, e.g. `app`.
    pub name: String,
    /// Flash offset.
    pub offset: u32,
    /// Image bytes.
    pub data: Vec<u8>,
}

impl FlashImage {
    /// Lowercase hex MD5 of the image, as the stub reports it.
    pub fn md5_hex(&self) -> String {
        format!("{:x}", md5::compute(&self.data))
    }
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    file: PathBuf,
    offset: String,
}

fn parse_offset(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let hex = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u32::from_str_radix(hex, 16).ok()
}

/// Load the images listed in `dir/flasher_args.json`.
///
/// Unknown keys are ignored and missing ones skipped; a manifest naming none
/// of the expected images is an error.
pub fn load_manifest(dir: impl AsRef<Path>) -> Result<Vec<FlashImage>> {
    let dir = dir.as_ref();
    let path = dir.join(MANIFEST_FILE);
    debug!("Loading manifest {}", path.display());

    let manifest: HashMap<String, serde_json::Value> =
        serde_json::from_str(&fs::read_to_string(&path)?)?;

    let mut images = Vec::new();
    for key in MANIFEST_KEYS {
        let Some(value) = manifest.get(key) else {
            debug!("Manifest has no '{key}' entry");
            continue;
        };

        let entry: ManifestEntry = serde_json::from_value(value.clone())
            .map_err(|e| Error::Manifest(format!("'{key}': {e}")))?;
        let offset = parse_offset(&entry.offset).ok_or_else(|| {
            Error::Manifest(format!("'{key}': invalid offset '{}'", entry.offset))
        })?;
        let file = dir.join(&entry.file);
        let data = fs::read(&file)
            .map_err(|e| Error::Manifest(format!("'{key}': {}: {e}", file.display())))?;

        info!("Image {key}: {} bytes at {offset:#x}", data.len());
        images.push(FlashImage {
            name: key.to_string(),
            offset,
            data,
        });
    }

    if images.is_empty() {
        return Err(Error::Manifest(format!(
            "{} lists none of {MANIFEST_KEYS:?}",
            path.display()
        )));
    }
    Ok(images)
}

fn check_reply(reply: &SlipPacket, opcode: Opcode, context: &str) -> Result<()> {
    if reply.command != opcode.code() {
        return Err(Error::Format(format!(
            "{context}: got a response to {:#04x}",
            reply.command
        )));
    }
    if !esp32::status_ok(&reply.payload) {
        return Err(Error::ProtocolReject(context.to_string()));
    }
    Ok(())
}

/// Stub-loader engine.
///
/// Generic over the port type `P`, which must implement the `Port` trait.
pub struct Esp32Uploader<P: Port> {
    port: P,
    images: Vec<FlashImage>,
    binary_idx: usize,
    data_idx: usize,
    synced: bool,
    spi_ready: bool,
}

impl<P: Port> Esp32Uploader<P> {
    /// Create an uploader over an open port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            images: Vec::new(),
            binary_idx: 0,
            data_idx: 0,
            synced: false,
            spi_ready: false,
        }
    }

    /// Set the images written by [`Uploader::flash_firmware`].
    #[must_use]
    pub fn with_images(mut self, images: Vec<FlashImage>) -> Self {
        self.images = images;
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the uploader and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Write position as `(binary_idx, data_idx)`.
    pub fn cursor(&self) -> (usize, usize) {
        (self.binary_idx, self.data_idx)
    }

    /// Run `op`, requiring a fresh sync if it fails.
    fn staged<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = op(self);
        if result.is_err() {
            self.synced = false;
            self.spi_ready = false;
        }
        result
    }

    fn read_response(&mut self) -> Result<Option<SlipPacket>> {
        let Some(raw) = slip::read_frame(&mut self.port, MAX_FRAME_LEN, RESPONSE_TIMEOUT)? else {
            return Ok(None);
        };

        let packet = SlipPacket::decode(&raw)?;
        if usize::from(packet.length) > BLOCK_SIZE {
            return Err(Error::Format(format!(
                "Response of {} bytes is too large",
                packet.length
            )));
        }
        trace!("RX command {:#04x}, {} bytes", packet.command, packet.payload.len());
        Ok(Some(packet))
    }

    /// Send `request` until a response frame arrives.
    fn transact(
        &mut self,
        request: &SlipPacket,
        with_checksum: bool,
        retries: usize,
    ) -> Result<SlipPacket> {
        let frame = request.encode(with_checksum);

        for attempt in 1..=retries.max(1) {
            trace!("TX command {:#04x}, {} bytes", request.command, frame.len());
            self.port.write_all_bytes(&frame)?;

            if let Some(reply) = self.read_response()? {
                return Ok(reply);
            }
            debug!(
                "No response to {:#04x} (attempt {attempt}/{retries})",
                request.command
            );
        }

        Err(Error::TransportTimeout(format!(
            "No response to command {:#04x}",
            request.command
        )))
    }

    fn command(&mut self, opcode: Opcode, payload: Vec<u8>, context: &str) -> Result<SlipPacket> {
        let request = SlipPacket::request(opcode.code(), payload);
        let reply = self.transact(&request, false, COMMAND_RETRIES)?;
        check_reply(&reply, opcode, context)?;
        Ok(reply)
    }

    /// Sync with the stub and swallow the burst of echoed sync replies.
    pub fn sync(&mut self) -> Result<()> {
        self.staged(|s| {
            let request = SlipPacket::request(Opcode::Sync.code(), esp32::sync_payload());
            let mut reply = s.transact(&request, false, SYNC_RETRIES)?;

            let started = Instant::now();
            let mut replies = 0usize;
            loop {
                if reply.command == Opcode::Sync.code() {
                    replies += 1;
                } else {
                    debug!("Sync: skipping stale response to {:#04x}", reply.command);
                }

                if started.elapsed() > SYNC_TIMEOUT {
                    return Err(Error::TransportTimeout("Sync replies did not stop".into()));
                }
                match s.read_response()? {
                    Some(next) => reply = next,
                    None => break,
                }
            }

            if replies == 0 {
                return Err(Error::TransportTimeout("Sync: no SYNC response".into()));
            }
            debug!("Sync: {replies} replies");
            Ok(())
        })?;

        self.synced = true;
        info!("Sync: ESP32S3 stub answered");
        Ok(())
    }

    /// Attach the SPI flash.
    pub fn attach_spi(&mut self) -> Result<()> {
        self.staged(|s| {
            s.command(Opcode::SpiAttach, esp32::attach_spi_payload(), "Attach SPI")
                .map(drop)
        })?;
        debug!("SPI flash attached");
        Ok(())
    }

    /// Send the fixed flash geometry.
    pub fn set_spi_params(&mut self) -> Result<()> {
        self.staged(|s| {
            s.command(Opcode::SpiSetParams, esp32::spi_params_payload(), "Set SPI parameters")
                .map(drop)
        })?;
        debug!("SPI parameters set");
        Ok(())
    }

    fn ensure_ready(&mut self) -> Result<()> {
        if !self.synced {
            self.sync()?;
        }
        if !self.spi_ready {
            self.attach_spi()?;
            self.set_spi_params()?;
            self.spi_ready = true;
        }
        Ok(())
    }

    /// Start a flash write of `size` bytes at `offset`.
    pub fn flash_begin(&mut self, size: u32, num_blocks: u32, offset: u32) -> Result<()> {
        self.staged(|s| {
            s.command(
                Opcode::FlashBegin,
                esp32::flash_begin_payload(size, num_blocks, offset),
                "Flash begin",
            )
            .map(drop)
        })
    }

    /// Send one block; `data` is padded to a full block.
    pub fn flash_data(&mut self, sequence: u32, data: &[u8]) -> Result<()> {
        self.staged(|s| {
            let request =
                SlipPacket::request(Opcode::FlashData.code(), esp32::flash_data_payload(sequence, data));
            let reply = s.transact(&request, true, COMMAND_RETRIES)?;
            check_reply(&reply, Opcode::FlashData, &format!("Flash data block {sequence}"))
        })
    }

    /// Finish flashing. A missing reply is tolerated since the chip may
    /// already be rebooting.
    pub fn flash_end(&mut self, reboot_flag: u32) -> Result<()> {
        let request = SlipPacket::request(Opcode::FlashEnd.code(), esp32::flash_end_payload(reboot_flag));
        match self.transact(&request, false, COMMAND_RETRIES) {
            Ok(reply) => {
                if let Err(e) = check_reply(&reply, Opcode::FlashEnd, "Flash end") {
                    warn!("Failed to restart the network chip: {e}");
                }
            },
            Err(Error::TransportTimeout(_)) => warn!("No reply to flash end"),
            Err(e) => return Err(e),
        }
        info!("Flashing ESP32S3: complete");
        Ok(())
    }

    /// Compare the stub's MD5 of `image`'s flash region with our own.
    #[allow(clippy::cast_possible_truncation)]
    pub fn flash_md5(&mut self, image: &FlashImage) -> Result<()> {
        let reply = self.staged(|s| {
            s.command(
                Opcode::SpiFlashMd5,
                esp32::flash_md5_payload(image.offset, image.data.len() as u32),
                "Flash MD5",
            )
        })?;

        let remote = esp32::md5_digest(&reply.payload)
            .ok_or_else(|| Error::Format("MD5 response is too short".into()))?;
        let local = image.md5_hex();

        if remote != local.as_bytes() {
            return Err(Error::VerificationFailure(format!(
                "MD5 of {} differs: flash {}, image {local}",
                image.name,
                String::from_utf8_lossy(&remote)
            )));
        }

        info!("MD5 of {} verified", image.name);
        Ok(())
    }

    /// Write every image from the current cursor, verifying each by MD5.
    pub fn write_images(&mut self, progress: &mut dyn FnMut(FlashProgress)) -> Result<()> {
        if self.images.is_empty() {
            return Err(Error::Manifest("No images to flash".into()));
        }
        self.ensure_ready()?;

        let images = mem::take(&mut self.images);
        let result = self.write_from_cursor(&images, progress);
        self.images = images;
        result
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_from_cursor(
        &mut self,
        images: &[FlashImage],
        progress: &mut dyn FnMut(FlashProgress),
    ) -> Result<()> {
        let total: usize = images.iter().map(|i| i.data.len()).sum();

        while let Some(image) = images.get(self.binary_idx) {
            let done_before: usize = images[..self.binary_idx].iter().map(|i| i.data.len()).sum();
            let len = image.data.len();

            self.data_idx = (self.data_idx / PAGE_SIZE) * PAGE_SIZE;
            let send_size = len - self.data_idx;
            let offset = image.offset + self.data_idx as u32;

            if send_size > 0 {
                let num_blocks = send_size.div_ceil(BLOCK_SIZE);
                info!(
                    "Flashing {}: {send_size:#x} bytes at {offset:#x}",
                    image.name
                );
                self.flash_begin(send_size as u32, num_blocks as u32, offset)?;

                let mut sequence = 0u32;
                while self.data_idx < len {
                    let end = (self.data_idx + BLOCK_SIZE).min(len);
                    self.flash_data(sequence, &image.data[self.data_idx..end])?;

                    self.data_idx = end;
                    sequence += 1;
                    progress(FlashProgress::new(Phase::Write, done_before + end, total));
                }
            }

            self.flash_md5(image)?;
            self.data_idx = 0;
            self.binary_idx += 1;
        }

        Ok(())
    }
}

impl<P: Port> Uploader for Esp32Uploader<P> {
    fn chip(&self) -> Chip {
        Chip::Net
    }

    fn flash_select(&mut self) -> Result<()> {
        select::select_chip(&mut self.port, Chip::Net, None)
    }

    fn sync(&mut self) -> Result<()> {
        self.sync()
    }

    fn phases(&self) -> Vec<Phase> {
        vec![Phase::Sync, Phase::Write, Phase::Finish]
    }

    fn run_phase(&mut self, phase: Phase, progress: &mut dyn FnMut(FlashProgress)) -> Result<()> {
        match phase {
            Phase::Sync => self.ensure_ready(),
            Phase::Write => self.write_images(progress),
            Phase::Finish => self.flash_end(0),
            Phase::Select | Phase::Erase | Phase::Verify | Phase::Go => Ok(()),
        }
    }

    fn reset_link(&mut self) -> Result<()> {
        self.synced = false;
        self.spi_ready = false;
        self.port.set_timeout(DEFAULT_TIMEOUT)?;
        self.port.set_parity(Parity::None)
    }

    fn close(&mut self) {
        if let Err(e) = self.port.close() {
            warn!("Failed to close {}: {e}", self.port.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{MgmtCommand, OK, READY},
        flasher::{self, RecoveryPolicy},
        port::mock::MockPort,
        protocol::slip::DIR_RESPONSE,
    };

    fn response(opcode: Opcode, payload: Vec<u8>) -> Vec<u8> {
        SlipPacket::new(DIR_RESPONSE, opcode.code(), payload).encode(false)
    }

    fn ok(opcode: Opcode) -> Vec<u8> {
        response(opcode, vec![0, 0])
    }

    fn md5_response(data: &[u8]) -> Vec<u8> {
        let mut payload = format!("{:x}", md5::compute(data)).into_bytes();
        payload.reverse();
        payload.extend_from_slice(&[0, 0]);
        response(Opcode::SpiFlashMd5, payload)
    }

    fn sent(port: &MockPort) -> Vec<SlipPacket> {
        port.writes()
            .iter()
            .map(|w| SlipPacket::decode(w).unwrap())
            .collect()
    }

    fn image(len: usize, offset: u32) -> FlashImage {
        FlashImage {
            name: "app".into(),
            offset,
            data: (0..len).map(|i| (i % 253) as u8).collect(),
        }
    }

    /// Sync burst of two replies, then attach and parameter replies.
    fn script_ready(port: &MockPort) {
        port.reply(&ok(Opcode::Sync)).reply(&ok(Opcode::Sync)).silence();
        port.reply(&ok(Opcode::SpiAttach)).reply(&ok(Opcode::SpiSetParams));
    }

    #[test]
    fn test_sync_swallows_burst() {
        let port = MockPort::new();
        port.reply(&ok(Opcode::Sync))
            .reply(&ok(Opcode::Sync))
            .reply(&ok(Opcode::Sync))
            .silence();
        let mut uploader = Esp32Uploader::new(port.clone());

        uploader.sync().unwrap();
        assert_eq!(port.writes().len(), 1);
        assert_eq!(port.remaining_script(), 0);

        let request = &sent(&port)[0];
        assert_eq!(request.command, Opcode::Sync.code());
        assert_eq!(request.payload, esp32::sync_payload());
    }

    #[test]
    fn test_sync_without_reply() {
        let port = MockPort::new();
        let mut uploader = Esp32Uploader::new(port.clone());

        assert!(matches!(uploader.sync(), Err(Error::TransportTimeout(_))));
        assert_eq!(port.writes().len(), SYNC_RETRIES);
    }

    #[test]
    fn test_sync_skips_stale_response() {
        let port = MockPort::new();
        port.reply(&ok(Opcode::FlashData))
            .reply(&ok(Opcode::Sync))
            .reply(&ok(Opcode::Sync))
            .silence();
        let mut uploader = Esp32Uploader::new(port.clone());

        uploader.sync().unwrap();
        assert_eq!(port.writes().len(), 1);
        assert_eq!(port.remaining_script(), 0);
    }

    #[test]
    fn test_sync_with_only_stale_responses_is_recoverable() {
        let port = MockPort::new();
        port.reply(&ok(Opcode::FlashBegin)).silence();
        let mut uploader = Esp32Uploader::new(port.clone());

        let err = uploader.sync().unwrap_err();
        assert!(matches!(err, Error::TransportTimeout(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_attach_spi_status() {
        let port = MockPort::new();
        port.reply(&response(Opcode::SpiAttach, vec![1, 1]));
        let mut uploader = Esp32Uploader::new(port.clone());

        assert!(matches!(uploader.attach_spi(), Err(Error::ProtocolReject(_))));
    }

    #[test]
    fn test_md5_matches() {
        let port = MockPort::new();
        let image = image(3000, 0x1_0000);
        port.reply(&md5_response(&image.data));
        let mut uploader = Esp32Uploader::new(port.clone());

        uploader.flash_md5(&image).unwrap();

        let request = &sent(&port)[0];
        assert_eq!(request.command, Opcode::SpiFlashMd5.code());
        assert_eq!(request.payload, esp32::flash_md5_payload(0x1_0000, 3000));
    }

    #[test]
    fn test_md5_mismatch() {
        let port = MockPort::new();
        let image = image(3000, 0x1_0000);

        let mut payload = format!("{:x}", md5::compute(&image.data)).into_bytes();
        payload.reverse();
        payload[5] = if payload[5] == b'0' { b'1' } else { b'0' };
        payload.extend_from_slice(&[0, 0]);
        port.reply(&response(Opcode::SpiFlashMd5, payload));

        let mut uploader = Esp32Uploader::new(port.clone());
        assert!(matches!(
            uploader.flash_md5(&image),
            Err(Error::VerificationFailure(_))
        ));
    }

    #[test]
    fn test_flash_data_carries_checksum() {
        let port = MockPort::new();
        port.reply(&ok(Opcode::FlashData));
        let mut uploader = Esp32Uploader::new(port.clone());

        uploader.flash_data(7, &[0xC0, 0xDB, 0x01]).unwrap();

        let request = &sent(&port)[0];
        assert_eq!(request.payload.len(), 16 + BLOCK_SIZE);
        assert_eq!(request.checksum, slip::checksum(&request.payload));
        assert_eq!(&request.payload[4..8], &7u32.to_le_bytes());
    }

    #[test]
    fn test_write_resumes_at_page_boundary() {
        let port = MockPort::new();
        let image = image(0x2800, 0x1_0000);

        script_ready(&port);
        port.reply(&ok(Opcode::FlashBegin));
        for _ in 0..5 {
            port.reply(&ok(Opcode::FlashData));
        }
        for _ in 0..COMMAND_RETRIES {
            port.silence();
        }

        let mut uploader = Esp32Uploader::new(port.clone()).with_images(vec![image.clone()]);
        assert!(matches!(
            uploader.write_images(&mut |_| {}),
            Err(Error::TransportTimeout(_))
        ));
        assert_eq!(uploader.cursor(), (0, 0x1400));

        let first_attempt = port.writes().len();
        script_ready(&port);
        port.reply(&ok(Opcode::FlashBegin));
        for _ in 0..6 {
            port.reply(&ok(Opcode::FlashData));
        }
        port.reply(&md5_response(&image.data));

        uploader.write_images(&mut |_| {}).unwrap();
        assert_eq!(uploader.cursor(), (1, 0));
        assert_eq!(port.remaining_script(), 0);

        let resumed = sent(&port).split_off(first_attempt);
        let begin = resumed
            .iter()
            .find(|p| p.command == Opcode::FlashBegin.code())
            .unwrap();
        assert_eq!(begin.payload, esp32::flash_begin_payload(0x1800, 6, 0x1_1000));

        let first_block = resumed
            .iter()
            .find(|p| p.command == Opcode::FlashData.code())
            .unwrap();
        assert_eq!(
            first_block.payload,
            esp32::flash_data_payload(0, &image.data[0x1000..0x1400])
        );
    }

    #[test]
    fn test_recovery_resumes_write_at_page_boundary() {
        let _guard = crate::interrupt_guard();
        crate::test_set_interrupted(false);

        let port = MockPort::new();
        let image = image(0x2800, 0x1_0000);

        script_ready(&port);
        port.reply(&ok(Opcode::FlashBegin));
        for _ in 0..5 {
            port.reply(&ok(Opcode::FlashData));
        }
        // The sixth block goes unanswered.
        for _ in 0..COMMAND_RETRIES {
            port.silence();
        }
        // Re-selection through the management console, then the rest of
        // the image from the start of its second page.
        port.reply(&[OK]).reply(&[READY]);
        script_ready(&port);
        port.reply(&ok(Opcode::FlashBegin));
        for _ in 0..6 {
            port.reply(&ok(Opcode::FlashData));
        }
        port.reply(&md5_response(&image.data));

        let mut uploader = Esp32Uploader::new(port.clone()).with_images(vec![image.clone()]);
        let policy = RecoveryPolicy::default().with_delays(Duration::ZERO, Duration::ZERO);
        flasher::run_phase(&mut uploader, &policy, Phase::Write, |u| {
            u.write_images(&mut |_| {})
        })
        .unwrap();

        assert_eq!(uploader.cursor(), (1, 0));
        assert_eq!(port.remaining_script(), 0);

        let writes = port.writes();
        let select = MgmtCommand::FlashNet.frame();
        assert_eq!(writes.iter().filter(|w| **w == select).count(), 1);

        let packets: Vec<SlipPacket> = writes
            .iter()
            .filter_map(|w| SlipPacket::decode(w).ok())
            .collect();
        let begins: Vec<&SlipPacket> = packets
            .iter()
            .filter(|p| p.command == Opcode::FlashBegin.code())
            .collect();
        assert_eq!(begins.len(), 2);
        assert_eq!(begins[1].payload, esp32::flash_begin_payload(0x1800, 6, 0x1_1000));

        let resumed = packets
            .iter()
            .rposition(|p| p.command == Opcode::FlashBegin.code())
            .unwrap();
        assert_eq!(
            packets[resumed + 1].payload,
            esp32::flash_data_payload(0, &image.data[0x1000..0x1400])
        );
    }

    #[test]
    fn test_flash_end_tolerates_silence() {
        let port = MockPort::new();
        let mut uploader = Esp32Uploader::new(port.clone());

        uploader.flash_end(0).unwrap();
        assert_eq!(sent(&port)[0].payload, esp32::flash_end_payload(0));
    }

    #[test]
    fn test_flash_net_end_to_end() {
        let port = MockPort::new();
        let images = vec![
            FlashImage {
                name: "bootloader".into(),
                offset: 0x0,
                data: vec![0xE9; 100],
            },
            image(0x500, 0x1_0000),
        ];

        port.reply(&[OK]).reply(&[READY]);
        script_ready(&port);
        port.reply(&ok(Opcode::FlashBegin))
            .reply(&ok(Opcode::FlashData))
            .reply(&md5_response(&images[0].data));
        port.reply(&ok(Opcode::FlashBegin))
            .reply(&ok(Opcode::FlashData))
            .reply(&ok(Opcode::FlashData))
            .reply(&md5_response(&images[1].data));
        port.reply(&ok(Opcode::FlashEnd));

        let mut uploader = Esp32Uploader::new(port.clone()).with_images(images);
        let mut last = None;
        uploader
            .flash_firmware(&RecoveryPolicy::disabled(), &mut |p| last = Some(p))
            .unwrap();

        assert_eq!(port.remaining_script(), 0);
        assert_eq!(port.parity(), Parity::None);
        assert_eq!(last, Some(FlashProgress::new(Phase::Write, 0x564, 0x564)));
    }

    #[test]
    fn test_load_manifest_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.bin"), [1u8; 16]).unwrap();
        fs::create_dir(dir.path().join("bootloader")).unwrap();
        fs::write(dir.path().join("bootloader/bootloader.bin"), [2u8; 8]).unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{
                "flash_settings": {"flash_mode": "dio"},
                "app": {"file": "app.bin", "offset": "0x10000"},
                "bootloader": {"file": "bootloader/bootloader.bin", "offset": "0x0"}
            }"#,
        )
        .unwrap();

        let images = load_manifest(dir.path()).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].name, "bootloader");
        assert_eq!(images[0].offset, 0);
        assert_eq!(images[0].data, vec![2u8; 8]);
        assert_eq!(images[1].name, "app");
        assert_eq!(images[1].offset, 0x1_0000);
    }

    #[test]
    fn test_load_manifest_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join(MANIFEST_FILE);

        fs::write(&manifest, r#"{"flash_settings": {}}"#).unwrap();
        assert!(matches!(load_manifest(dir.path()), Err(Error::Manifest(_))));

        fs::write(&manifest, r#"{"app": {"file": "app.bin", "offset": "zz"}}"#).unwrap();
        assert!(matches!(load_manifest(dir.path()), Err(Error::Manifest(_))));

        fs::write(&manifest, r#"{"app": {"file": "missing.bin", "offset": "0x0"}}"#).unwrap();
        assert!(matches!(load_manifest(dir.path()), Err(Error::Manifest(_))));

        assert!(load_manifest(dir.path().join("nowhere")).is_err());
    }
}
