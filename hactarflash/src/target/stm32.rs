//! STM32 USART bootloader engine for the management and UI MCUs.
//!
//! ## Session states
//!
//! ```text
//! Unsynced --Sync(0x7F)--> Synced --GetID--> Identified(pid) --lookup--> Ready
//! ```
//!
//! Every operation first runs [`Stm32Uploader::check_init`], which repeats
//! only the missing steps. A NACK or timeout inside an operation drops the
//! session back to unsynced. Erase, write and verify progress lives in
//! [`UploadSession`], so re-running a phase after recovery picks up where
//! the failed attempt stopped.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hactarflash::{Chip, ChipConfigStore, NativePort, SerialConfig, Stm32Uploader};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!     let mut uploader = Stm32Uploader::new(port, Chip::Ui, ChipConfigStore::builtin());
//!
//!     let pid = uploader.get_id()?;
//!     let info = uploader.get()?;
//!     println!("PID {pid:#x}, bootloader {info}");
//!     Ok(())
//! }
//! ```

use {
    crate::{
        error::{Error, Result},
        flasher::{FlashProgress, Phase},
        port::{DEFAULT_TIMEOUT, Parity, Port},
        protocol::{
            stm32::{self, BootloaderInfo, Command, MAX_TRANSFER, PAD_BYTE},
            transport::{self, ACK, DEFAULT_RETRIES},
        },
        select::{self, BootloaderPrompt},
        target::{Chip, ChipConfig, ChipConfigStore, FlashPlan, Uploader},
    },
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{mem, time::Duration},
};

/// Reply timeout of a single sector erase.
const ERASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads of one region before a comparison is declared failed.
const COMPARE_READS: usize = 3;

/// How erased sectors are checked before writing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EraseVerify {
    /// Read back every erased sector on its own.
    #[default]
    Fast,
    /// Read back the whole erased span.
    Full,
}

/// Position inside the firmware image and the matching flash address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Offset into the firmware image.
    pub data_idx: usize,
    /// Flash address of `data_idx`.
    pub addr: u32,
}

impl Cursor {
    fn at(addr: u32) -> Self {
        Self { data_idx: 0, addr }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn advance(&mut self, n: usize) {
        self.data_idx += n;
        // Chunks never exceed 256 bytes.
        self.addr += n as u32;
    }
}

/// Progress of one flash attempt.
///
/// Survives failed phases so the orchestrator can resume them; replaced
/// only by [`Stm32Uploader::reset_session`].
#[derive(Debug, Clone, Default)]
pub struct UploadSession {
    /// The bootloader answered the last Sync and nothing failed since.
    pub synced: bool,
    /// Product id reported by GetID.
    pub pid: Option<u32>,
    /// Flash layout looked up from `pid`.
    pub chip_config: Option<ChipConfig>,
    /// Version and commands reported by Get, if it was issued.
    pub bootloader: Option<BootloaderInfo>,
    /// Sectors of the current erase plan.
    pub sectors_to_delete: Vec<u16>,
    /// Sectors whose erase was acknowledged.
    pub sectors_deleted: Vec<u16>,
    /// The erased span has been read back.
    pub erase_verified: bool,
    /// Next chunk to write.
    pub write_cursor: Option<Cursor>,
    /// Next chunk to read back.
    pub verify_cursor: Option<Cursor>,
}

/// One step of a [`FullVerify`] pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifyStatus {
    /// Start address of the chunk just compared.
    pub addr: u32,
    /// Share of the span verified so far.
    pub percent: f32,
    /// The chunk did not match.
    pub failed: bool,
}

/// Sequential read-back of a span, one chunk per item.
///
/// Ends after the last chunk, the first mismatch, or the first error.
pub struct FullVerify<'a, P: Port> {
    uploader: &'a mut Stm32Uploader<P>,
    expected: Vec<u8>,
    start: u32,
    offset: usize,
    finished: bool,
}

impl<P: Port> FullVerify<'_, P> {
    /// Bytes verified so far.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<P: Port> Iterator for FullVerify<'_, P> {
    type Item = Result<VerifyStatus>;

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn next(&mut self) -> Option<Self::Item> {
        let total = self.expected.len();
        if self.finished || self.offset >= total {
            return None;
        }

        let end = (self.offset + MAX_TRANSFER).min(total);
        let addr = self.start + self.offset as u32;

        match self
            .uploader
            .flash_compare(&self.expected[self.offset..end], addr)
        {
            Ok(matched) => {
                if matched {
                    self.offset = end;
                } else {
                    self.finished = true;
                }
                Some(Ok(VerifyStatus {
                    addr,
                    percent: self.offset as f32 * 100.0 / total as f32,
                    failed: !matched,
                }))
            },
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            },
        }
    }
}

/// AN3155 engine.
///
/// Generic over the port type `P`, which must implement the `Port` trait.
pub struct Stm32Uploader<P: Port> {
    port: P,
    chip: Chip,
    store: ChipConfigStore,
    firmware: Vec<u8>,
    erase_verify: EraseVerify,
    prompt: Option<BootloaderPrompt>,
    session: UploadSession,
}

impl<P: Port> Stm32Uploader<P> {
    /// Create an uploader for `chip` over an open port.
    pub fn new(port: P, chip: Chip, store: ChipConfigStore) -> Self {
        Self {
            port,
            chip,
            store,
            firmware: Vec::new(),
            erase_verify: EraseVerify::default(),
            prompt: None,
            session: UploadSession::default(),
        }
    }

    /// Set the erase check.
    #[must_use]
    pub fn with_erase_verify(mut self, erase_verify: EraseVerify) -> Self {
        self.erase_verify = erase_verify;
        self
    }

    /// Set the operator prompt run while selecting the management chip.
    #[must_use]
    pub fn with_prompt(mut self, prompt: BootloaderPrompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Set the firmware image written by [`Uploader::flash_firmware`].
    #[must_use]
    pub fn with_firmware(mut self, firmware: Vec<u8>) -> Self {
        self.firmware = firmware;
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

    /// Current session state.
    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    /// Forget all progress, including the chip identity.
    pub fn reset_session(&mut self) {
        self.session = UploadSession::default();
    }

    /// Run `op`, dropping the session back to unsynced if it fails.
    fn staged<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = op(self);
        if result.is_err() {
            self.session.synced = false;
        }
        result
    }

    fn send_expect_ack(&mut self, bytes: &[u8], retries: usize, context: &str) -> Result<()> {
        transport::write_bytes_expect_ack(&mut self.port, bytes, retries)?.into_result(context)
    }

    fn command(&mut self, command: Command, retries: usize) -> Result<()> {
        debug!("Sending {command}");
        self.send_expect_ack(&command.frame(), retries, &command.to_string())
    }

    fn config(&self) -> Result<&ChipConfig> {
        self.session
            .chip_config
            .as_ref()
            .ok_or_else(|| Error::Config("Chip has not been identified".into()))
    }

    /// Send the autobaud byte and wait for ACK.
    pub fn sync(&mut self) -> Result<()> {
        self.staged(|s| s.send_expect_ack(&[Command::Sync as u8], DEFAULT_RETRIES, "Sync"))?;
        self.session.synced = true;
        info!("Sync: {} bootloader answered", self.chip);
        Ok(())
    }

    /// Repeat whichever of Sync and GetID the session is missing.
    pub fn check_init(&mut self) -> Result<()> {
        if !self.session.synced {
            self.sync()?;
        }
        if self.session.chip_config.is_none() {
            self.get_id()?;
        }
        Ok(())
    }

    /// Read the product id and look up its flash layout.
    pub fn get_id(&mut self) -> Result<u32> {
        if !self.session.synced {
            self.sync()?;
        }

        let pid = self.staged(|s| {
            s.command(Command::GetId, DEFAULT_RETRIES)?;

            let mut len = transport::read_exact(&mut s.port, 1, "Get ID length")?[0];
            // Some bootloaders repeat the ACK before the length byte.
            if len == ACK {
                debug!("Get ID: skipping repeated ACK");
                len = transport::read_exact(&mut s.port, 1, "Get ID length")?[0];
            }

            let pid_bytes = transport::read_exact(&mut s.port, usize::from(len) + 1, "Get ID")?;
            transport::read_reply(&mut s.port)?.into_result("Get ID")?;

            Ok(pid_bytes
                .iter()
                .fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
        })?;
        info!("Chip ID: {pid:#x}");

        let config = self.store.get(pid)?.clone();
        self.session.pid = Some(pid);
        self.session.chip_config = Some(config);
        Ok(pid)
    }

    /// Read the bootloader version and supported commands.
    pub fn get(&mut self) -> Result<BootloaderInfo> {
        self.check_init()?;

        let info = self.staged(|s| {
            s.command(Command::Get, DEFAULT_RETRIES)?;
            // N counts the opcodes; the version byte comes on top.
            let n = transport::read_exact(&mut s.port, 1, "Get length")?[0];
            let bytes = transport::read_exact(&mut s.port, usize::from(n) + 1, "Get")?;
            transport::read_reply(&mut s.port)?.into_result("Get")?;
            BootloaderInfo::parse(&bytes).ok_or_else(|| Error::Format("Empty Get reply".into()))
        })?;

        let names: Vec<String> = info.commands().iter().map(ToString::to_string).collect();
        info!("Bootloader {info}: {}", names.join(", "));
        self.session.bootloader = Some(info.clone());
        Ok(info)
    }

    /// Read `len` bytes starting at `addr`, in requests of at most 256 bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_memory(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        self.check_init()?;

        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let n = (len - data.len()).min(MAX_TRANSFER);
            let chunk_addr = addr + data.len() as u32;
            let chunk = self.staged(|s| s.read_chunk(chunk_addr, n))?;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    fn read_chunk(&mut self, addr: u32, n: usize) -> Result<Vec<u8>> {
        self.command(Command::ReadMemory, DEFAULT_RETRIES)?;
        self.send_expect_ack(&stm32::address_frame(addr), 1, "Read Memory address")?;
        self.send_expect_ack(&stm32::read_length_frame(n), 1, "Read Memory length")?;
        transport::read_exact(&mut self.port, n, "Read Memory")
    }

    /// Compare flash at `addr` with `expected`, re-reading a few times
    /// before giving up.
    pub fn flash_compare(&mut self, expected: &[u8], addr: u32) -> Result<bool> {
        for attempt in 1..=COMPARE_READS {
            if self.read_memory(addr, expected.len())? == expected {
                return Ok(true);
            }
            debug!("Flash at {addr:#010x} differs (read {attempt}/{COMPARE_READS})");
        }
        Ok(false)
    }

    /// Erase `sectors` one at a time, skipping those already erased in this
    /// session.
    pub fn extended_erase(
        &mut self,
        sectors: &[u16],
        progress: &mut dyn FnMut(FlashProgress),
    ) -> Result<()> {
        if sectors.is_empty() {
            return Err(Error::Config("Cannot erase zero sectors".into()));
        }

        if self.session.sectors_to_delete != sectors {
            self.session.sectors_to_delete = sectors.to_vec();
            self.session.sectors_deleted.clear();
            self.session.erase_verified = false;
            self.session.write_cursor = None;
            self.session.verify_cursor = None;
        }

        let pending: Vec<u16> = sectors
            .iter()
            .copied()
            .filter(|s| !self.session.sectors_deleted.contains(s))
            .collect();
        if pending.is_empty() {
            debug!("Erase: sectors {sectors:?} already erased");
            return Ok(());
        }

        self.check_init()?;
        if pending.len() < sectors.len() {
            info!("Erase: resuming at sector {}", pending[0]);
        } else {
            info!("Erase: sectors {sectors:?}");
        }

        for sector in pending {
            self.staged(|s| s.erase_sector(sector))?;
            self.session.sectors_deleted.push(sector);
            debug!("Erased sector {sector}");
            progress(FlashProgress::new(
                Phase::Erase,
                self.session.sectors_deleted.len(),
                sectors.len(),
            ));
        }

        info!("Erase: {} sectors erased", sectors.len());
        Ok(())
    }

    fn erase_sector(&mut self, sector: u16) -> Result<()> {
        self.command(Command::ExtendedErase, 1)?;

        let previous = self.port.timeout();
        self.port.set_timeout(ERASE_TIMEOUT)?;
        let reply =
            transport::write_bytes_expect_ack(&mut self.port, &stm32::erase_sector_frame(sector), 1);
        self.port.set_timeout(previous)?;

        reply?.into_result(&format!("Erase sector {sector}"))
    }

    /// Check that every erased sector reads back as 0xFF, one sector at a
    /// time.
    #[allow(clippy::cast_possible_truncation)]
    pub fn fast_erase_verify(&mut self, progress: &mut dyn FnMut(FlashProgress)) -> Result<()> {
        self.check_init()?;

        let sectors: Vec<(u16, u32, usize)> = {
            let config = self.config()?;
            self.session
                .sectors_deleted
                .iter()
                .filter_map(|&idx| config.sector(idx).map(|s| (idx, s.addr, s.size as usize)))
                .collect()
        };

        let blank = [PAD_BYTE; MAX_TRANSFER];
        for (done, &(idx, addr, size)) in sectors.iter().enumerate() {
            let mut offset = 0;
            while offset < size {
                let n = (size - offset).min(MAX_TRANSFER);
                // Sector sizes fit the 32-bit address space.
                let chunk_addr = addr + offset as u32;
                if !self.flash_compare(&blank[..n], chunk_addr)? {
                    return Err(Error::VerificationFailure(format!(
                        "Sector {idx} is not erased at {chunk_addr:#010x}"
                    )));
                }
                offset += n;
            }
            progress(FlashProgress::new(Phase::Erase, done + 1, sectors.len()));
        }

        info!("Erase verify: {} sectors blank", sectors.len());
        Ok(())
    }

    /// Sequential read-back of `expected` starting at `start`.
    pub fn full_verify(&mut self, start: u32, expected: Vec<u8>) -> FullVerify<'_, P> {
        FullVerify {
            uploader: self,
            expected,
            start,
            offset: 0,
            finished: false,
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn full_erase_verify(&mut self, progress: &mut dyn FnMut(FlashProgress)) -> Result<()> {
        self.check_init()?;

        let (start, total) = {
            let config = self.config()?;
            let sectors: Vec<_> = self
                .session
                .sectors_deleted
                .iter()
                .filter_map(|&idx| config.sector(idx))
                .collect();
            let start = sectors.iter().map(|s| s.addr).min().unwrap_or(config.usr_start_addr);
            let total: usize = sectors.iter().map(|s| s.size as usize).sum();
            (start, total)
        };

        for status in self.full_verify(start, vec![PAD_BYTE; total]) {
            let status = status?;
            if status.failed {
                return Err(Error::VerificationFailure(format!(
                    "Erased flash at {:#010x} is not blank",
                    status.addr
                )));
            }
            progress(FlashProgress::new(Phase::Erase, status.percent as usize, 100));
        }

        info!("Erase verify: {total} bytes blank");
        Ok(())
    }

    /// Write `data` at `start` in 256-byte chunks, resuming from the
    /// session's write cursor.
    pub fn write_memory(
        &mut self,
        data: &[u8],
        start: u32,
        progress: &mut dyn FnMut(FlashProgress),
    ) -> Result<()> {
        self.check_init()?;

        let mut cursor = *self.session.write_cursor.get_or_insert(Cursor::at(start));
        if cursor.data_idx > 0 && cursor.data_idx < data.len() {
            info!("Write: resuming at {:#010x}", cursor.addr);
        } else if cursor.data_idx == 0 {
            info!("Write: {} bytes at {start:#010x}", data.len());
        }

        while cursor.data_idx < data.len() {
            let end = (cursor.data_idx + MAX_TRANSFER).min(data.len());
            let chunk = &data[cursor.data_idx..end];

            self.staged(|s| s.write_chunk(cursor.addr, chunk))?;

            cursor.advance(chunk.len());
            self.session.write_cursor = Some(cursor);
            progress(FlashProgress::new(Phase::Write, cursor.data_idx, data.len()));
        }

        Ok(())
    }

    fn write_chunk(&mut self, addr: u32, chunk: &[u8]) -> Result<()> {
        self.command(Command::WriteMemory, 1)?;
        self.send_expect_ack(&stm32::address_frame(addr), 1, "Write Memory address")?;
        self.send_expect_ack(
            &stm32::write_chunk_frame(chunk),
            1,
            &format!("Write Memory at {addr:#010x}"),
        )
    }

    /// Read back `data` at `start`, resuming from the session's verify
    /// cursor.
    pub fn verify_write(
        &mut self,
        data: &[u8],
        start: u32,
        progress: &mut dyn FnMut(FlashProgress),
    ) -> Result<()> {
        self.check_init()?;

        let mut cursor = *self.session.verify_cursor.get_or_insert(Cursor::at(start));
        while cursor.data_idx < data.len() {
            let end = (cursor.data_idx + MAX_TRANSFER).min(data.len());
            let expected = &data[cursor.data_idx..end];

            if !self.flash_compare(expected, cursor.addr)? {
                return Err(Error::VerificationFailure(format!(
                    "Flash differs from firmware at {:#010x}",
                    cursor.addr
                )));
            }

            cursor.advance(expected.len());
            self.session.verify_cursor = Some(cursor);
            progress(FlashProgress::new(Phase::Verify, cursor.data_idx, data.len()));
        }

        info!("Verify: {} bytes match", data.len());
        Ok(())
    }

    /// Jump to `addr`. The UI chip is restarted by the management chip
    /// instead.
    pub fn go(&mut self, addr: u32) -> Result<()> {
        if self.chip != Chip::Mgmt {
            return Err(Error::Unsupported(format!(
                "Go is not issued to the {} chip",
                self.chip
            )));
        }

        self.check_init()?;
        self.staged(|s| {
            s.command(Command::Go, 1)?;
            s.send_expect_ack(&stm32::address_frame(addr), 1, "Go address")
        })?;
        info!("Jumped to {addr:#010x}");
        Ok(())
    }

    /// Sectors covering the loaded firmware.
    pub fn plan(&mut self) -> Result<FlashPlan> {
        self.check_init()?;
        let len = self.firmware.len();
        self.config()?.plan(len)
    }

    fn erase_phase(&mut self, progress: &mut dyn FnMut(FlashProgress)) -> Result<()> {
        let plan = self.plan()?;
        self.extended_erase(plan.sectors(), progress)?;

        if !self.session.erase_verified {
            match self.erase_verify {
                EraseVerify::Fast => self.fast_erase_verify(progress)?,
                EraseVerify::Full => self.full_erase_verify(progress)?,
            }
            self.session.erase_verified = true;
        }
        Ok(())
    }

    fn write_phase(&mut self, progress: &mut dyn FnMut(FlashProgress)) -> Result<()> {
        self.check_init()?;
        let start = self.config()?.usr_start_addr;

        let firmware = mem::take(&mut self.firmware);
        let result = self.write_memory(&firmware, start, progress);
        self.firmware = firmware;
        result
    }

    fn verify_phase(&mut self, progress: &mut dyn FnMut(FlashProgress)) -> Result<()> {
        self.check_init()?;
        let start = self.config()?.usr_start_addr;

        let firmware = mem::take(&mut self.firmware);
        let result = self.verify_write(&firmware, start, progress);
        self.firmware = firmware;
        result
    }
}

impl<P: Port> Uploader for Stm32Uploader<P> {
    fn chip(&self) -> Chip {
        self.chip
    }

    fn flash_select(&mut self) -> Result<()> {
        select::select_chip(&mut self.port, self.chip, self.prompt.as_mut())
    }

    fn sync(&mut self) -> Result<()> {
        self.sync()
    }

    fn phases(&self) -> Vec<Phase> {
        let mut phases = vec![Phase::Sync, Phase::Erase, Phase::Write, Phase::Verify];
        if self.chip == Chip::Mgmt {
            phases.push(Phase::Go);
        }
        phases
    }

    fn run_phase(&mut self, phase: Phase, progress: &mut dyn FnMut(FlashProgress)) -> Result<()> {
        match phase {
            Phase::Sync => {
                let plan = self.plan()?;
                debug!("Firmware spans sectors {:?}", plan.sectors());
                Ok(())
            },
            Phase::Erase => self.erase_phase(progress),
            Phase::Write => self.write_phase(progress),
            Phase::Verify => self.verify_phase(progress),
            Phase::Go => {
                self.check_init()?;
                let addr = self.config()?.usr_start_addr;
                self.go(addr)
            },
            Phase::Select | Phase::Finish => Ok(()),
        }
    }

    fn reset_link(&mut self) -> Result<()> {
        self.session.synced = false;
        self.port.set_timeout(DEFAULT_TIMEOUT)?;
        self.port.set_parity(Parity::None)
    }

    fn close(&mut self) {
        if let Err(e) = self.port.close() {
            warn!("Failed to close {}: {e}", self.port.name());
        }
    }
}
