//! Flash targets of a Hactar board.
//!
//! The three chips share one serial link and are reached through the
//! [`Uploader`] trait:
//!
//! - `mgmt`: STM32 management MCU, ROM bootloader entered by hand.
//! - `ui`: STM32 UI MCU, bootloader entered through the management console.
//! - `net`: ESP32S3 network co-processor, stub loader entered the same way.

pub mod esp32;
pub mod stm32;

use {
    crate::{
        error::{Error, Result},
        flasher::{FlashProgress, Phase, RecoveryPolicy},
        port::{NativePort, Port, SerialConfig},
        select::BootloaderPrompt,
    },
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{collections::BTreeMap, fmt, fs, path::Path, str::FromStr, thread, time::Duration},
};

pub use {
    esp32::{Esp32Uploader, FlashImage},
    stm32::{EraseVerify, Stm32Uploader},
};

/// A chip on the Hactar board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chip {
    /// STM32 management MCU.
    Mgmt,
    /// STM32 UI MCU.
    Ui,
    /// ESP32S3 network co-processor.
    Net,
}

impl Chip {
    /// All chips, in the order they are usually flashed.
    pub const ALL: [Self; 3] = [Self::Ui, Self::Net, Self::Mgmt];

    /// Get the chip from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "mgmt" | "management" => Some(Self::Mgmt),
            "ui" => Some(Self::Ui),
            "net" | "esp32" | "esp32s3" => Some(Self::Net),
            _ => None,
        }
    }

    /// Parse a `ui+net+mgmt` style list, keeping order and dropping repeats.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let mut chips = Vec::new();
        for name in list.split('+').filter(|s| !s.trim().is_empty()) {
            let chip = Self::from_name(name)
                .ok_or_else(|| Error::Unsupported(format!("Unknown chip '{}'", name.trim())))?;
            if !chips.contains(&chip) {
                chips.push(chip);
            }
        }
        if chips.is_empty() {
            return Err(Error::Config("No chip selected".into()));
        }
        Ok(chips)
    }

    /// Short name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Mgmt => "mgmt",
            Self::Ui => "ui",
            Self::Net => "net",
        }
    }

    /// Whether the chip runs the STM32 ROM bootloader.
    pub fn is_stm32(self) -> bool {
        matches!(self, Self::Mgmt | Self::Ui)
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Chip {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| Error::Unsupported(format!("Unknown chip '{s}'")))
    }
}

/// One erasable flash sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorInfo {
    /// Absolute start address.
    pub addr: u32,
    /// Size in bytes.
    pub size: u32,
}

/// Flash layout of one STM32 part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipConfig {
    /// Product id reported by GetID.
    #[serde(skip)]
    pub pid: u32,
    /// Where user firmware starts.
    pub usr_start_addr: u32,
    /// Sectors in address order.
    pub sectors: Vec<SectorInfo>,
}

impl ChipConfig {
    /// Total size of all sectors.
    pub fn flash_size(&self) -> usize {
        self.sectors.iter().map(|s| s.size as usize).sum()
    }

    /// Smallest prefix of sectors that holds `firmware_len` bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn plan(&self, firmware_len: usize) -> Result<FlashPlan> {
        if firmware_len == 0 {
            return Err(Error::Config("Firmware image is empty".into()));
        }

        let mut covered = 0usize;
        let mut sectors = Vec::new();
        for (idx, sector) in self.sectors.iter().enumerate() {
            if covered >= firmware_len {
                break;
            }
            covered += sector.size as usize;
            // Sector tables never exceed u16::MAX entries.
            sectors.push(idx as u16);
        }

        if covered < firmware_len {
            return Err(Error::InsufficientFlash {
                required: firmware_len,
                available: self.flash_size(),
            });
        }

        Ok(FlashPlan::Sectors(sectors))
    }

    /// Sector by index.
    pub fn sector(&self, idx: u16) -> Option<&SectorInfo> {
        self.sectors.get(usize::from(idx))
    }
}

/// What will be erased and written for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashPlan {
    /// STM32: sector indices, starting at sector 0.
    Sectors(Vec<u16>),
    /// ESP32: one FlashBegin window.
    Blocks {
        /// Flash offset of the first byte sent.
        offset: u32,
        /// Bytes to erase and send.
        size: u32,
        /// Number of FlashData blocks.
        block_count: u32,
    },
}

impl FlashPlan {
    /// Sector indices of an STM32 plan.
    pub fn sectors(&self) -> &[u16] {
        match self {
            Self::Sectors(sectors) => sectors,
            Self::Blocks { .. } => &[],
        }
    }
}

/// Chip configurations keyed by product id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipConfigStore {
    configs: BTreeMap<u32, ChipConfig>,
}

impl Default for ChipConfigStore {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ChipConfigStore {
    /// Parts fitted to Hactar boards.
    pub fn builtin() -> Self {
        let mut configs = BTreeMap::new();

        // STM32F405/407: 4 x 16K, 1 x 64K, 7 x 128K.
        let mut sectors = Vec::with_capacity(12);
        let mut addr = 0x0800_0000;
        for size in [0x4000; 4]
            .into_iter()
            .chain([0x1_0000])
            .chain([0x2_0000; 7])
        {
            sectors.push(SectorInfo { addr, size });
            addr += size;
        }
        configs.insert(
            0x413,
            ChipConfig {
                pid: 0x413,
                usr_start_addr: 0x0800_0000,
                sectors,
            },
        );

        // STM32F07x: 64 x 2K pages.
        let sectors = (0..64)
            .map(|i| SectorInfo {
                addr: 0x0800_0000 + i * 0x800,
                size: 0x800,
            })
            .collect();
        configs.insert(
            0x448,
            ChipConfig {
                pid: 0x448,
                usr_start_addr: 0x0800_0000,
                sectors,
            },
        );

        Self { configs }
    }

    /// Parse a JSON table keyed by decimal or `0x` hex product id.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, ChipConfig> = serde_json::from_str(json)?;

        let mut configs = BTreeMap::new();
        for (key, mut config) in raw {
            let pid = parse_pid(&key)
                .ok_or_else(|| Error::Config(format!("Invalid chip id key '{key}'")))?;
            if config.sectors.is_empty() {
                return Err(Error::Config(format!("Chip {pid:#x} has no sectors")));
            }
            config.pid = pid;
            configs.insert(pid, config);
        }

        Ok(Self { configs })
    }

    /// Load a JSON table from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading chip configurations from {}", path.display());
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Look up a product id.
    pub fn get(&self, pid: u32) -> Result<&ChipConfig> {
        self.configs
            .get(&pid)
            .ok_or(Error::ConfigurationMissing { pid })
    }

    /// All entries in product id order.
    pub fn iter(&self) -> impl Iterator<Item = &ChipConfig> {
        self.configs.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

fn parse_pid(key: &str) -> Option<u32> {
    let key = key.trim();
    match key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => key.parse().ok(),
    }
}

/// Per-chip flashing engine.
///
/// A flash is a fixed sequence of [`Phase`]s. Each phase resumes from the
/// uploader's own progress state, so the orchestrator can re-run a phase
/// after re-selecting the chip without repeating completed work.
pub trait Uploader: Send {
    /// Chip this uploader drives.
    fn chip(&self) -> Chip;

    /// Run the chip-select handshake.
    fn flash_select(&mut self) -> Result<()>;

    /// Synchronise with the bootloader.
    fn sync(&mut self) -> Result<()>;

    /// Phases of a full flash, in order.
    fn phases(&self) -> Vec<Phase>;

    /// Run (or resume) one phase.
    fn run_phase(&mut self, phase: Phase, progress: &mut dyn FnMut(FlashProgress)) -> Result<()>;

    /// Return the link to its console settings before re-selection.
    fn reset_link(&mut self) -> Result<()>;

    /// Select, then run every phase under the recovery policy.
    fn flash_firmware(
        &mut self,
        policy: &RecoveryPolicy,
        progress: &mut dyn FnMut(FlashProgress),
    ) -> Result<()> {
        crate::flasher::flash_with_recovery(self, policy, progress)
    }

    /// Close the uploader and release the port.
    ///
    /// Safe to call more than once.
    fn close(&mut self);
}

/// Inputs for [`Chip::create_uploader`].
#[derive(Default)]
pub struct UploaderOptions {
    /// STM32: firmware binary. ESP32: build directory holding
    /// `flasher_args.json`. Not needed for select-only runs.
    pub binary: Option<std::path::PathBuf>,
    /// STM32 flash layouts.
    pub chip_store: ChipConfigStore,
    /// STM32 erase verification mode.
    pub erase_verify: EraseVerify,
    /// Operator prompt for entering the management bootloader.
    pub prompt: Option<BootloaderPrompt>,
}

impl fmt::Debug for UploaderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploaderOptions")
            .field("binary", &self.binary)
            .field("chip_store", &self.chip_store.len())
            .field("erase_verify", &self.erase_verify)
            .field("prompt", &self.prompt.is_some())
            .finish()
    }
}

impl Chip {
    /// Open `port_name` and create the matching uploader.
    pub fn create_uploader(
        &self,
        port_name: &str,
        baud: u32,
        options: UploaderOptions,
    ) -> Result<Box<dyn Uploader>> {
        let port = open_with_retry(port_name, baud)?;
        self.create_uploader_with_port(port, options)
    }

    /// Create the matching uploader over an existing port.
    pub fn create_uploader_with_port<P: Port + 'static>(
        &self,
        port: P,
        options: UploaderOptions,
    ) -> Result<Box<dyn Uploader>> {
        match self {
            Self::Mgmt | Self::Ui => {
                let mut uploader = Stm32Uploader::new(port, *self, options.chip_store)
                    .with_erase_verify(options.erase_verify);
                if let Some(prompt) = options.prompt {
                    uploader = uploader.with_prompt(prompt);
                }
                if let Some(path) = options.binary {
                    uploader = uploader.with_firmware(fs::read(&path)?);
                }
                Ok(Box::new(uploader))
            },
            Self::Net => {
                let mut uploader = Esp32Uploader::new(port);
                if let Some(dir) = options.binary {
                    uploader = uploader.with_images(esp32::load_manifest(&dir)?);
                }
                Ok(Box::new(uploader))
            },
        }
    }
}

fn open_with_retry(port_name: &str, baud: u32) -> Result<NativePort> {
    const MAX_OPEN_PORT_ATTEMPTS: usize = 3;
    const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

    let mut last_error = None;

    for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
        match NativePort::open(&SerialConfig::new(port_name, baud)) {
            Ok(port) => {
                if attempt > 1 {
                    debug!("Port opened on attempt {attempt}");
                }
                return Ok(port);
            },
            Err(e) => {
                warn!(
                    "Failed to open port {port_name} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}"
                );
                last_error = Some(e);

                if attempt < MAX_OPEN_PORT_ATTEMPTS {
                    thread::sleep(OPEN_RETRY_DELAY);
                }
            },
        }
    }

    Err(last_error.unwrap_or(Error::DeviceNotFound))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_config(count: u32, size: u32) -> ChipConfig {
        ChipConfig {
            pid: 0x999,
            usr_start_addr: 0x0800_0000,
            sectors: (0..count)
                .map(|i| SectorInfo {
                    addr: 0x0800_0000 + i * size,
                    size,
                })
                .collect(),
        }
    }

    #[test]
    fn test_chip_from_name() {
        assert_eq!(Chip::from_name("UI"), Some(Chip::Ui));
        assert_eq!(Chip::from_name("mgmt"), Some(Chip::Mgmt));
        assert_eq!(Chip::from_name("net"), Some(Chip::Net));
        assert_eq!(Chip::from_name("radio"), None);
        assert!("esp32s3".parse::<Chip>().is_ok());
    }

    #[test]
    fn test_parse_chip_list() {
        assert_eq!(
            Chip::parse_list("ui+net+mgmt").unwrap(),
            vec![Chip::Ui, Chip::Net, Chip::Mgmt]
        );
        assert_eq!(Chip::parse_list("net+net").unwrap(), vec![Chip::Net]);
        assert!(Chip::parse_list("ui+gpu").is_err());
        assert!(Chip::parse_list("").is_err());
    }

    #[test]
    fn test_plan_covers_firmware() {
        let config = uniform_config(4, 256);

        assert_eq!(config.plan(600).unwrap(), FlashPlan::Sectors(vec![0, 1, 2]));
        assert_eq!(config.plan(512).unwrap().sectors(), &[0, 1]);
        assert_eq!(config.plan(1).unwrap().sectors(), &[0]);
        assert_eq!(config.plan(1024).unwrap().sectors(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_plan_rejects_oversized_and_empty() {
        let config = uniform_config(4, 256);

        assert!(matches!(
            config.plan(1025),
            Err(Error::InsufficientFlash {
                required: 1025,
                available: 1024
            })
        ));
        assert!(config.plan(0).is_err());
    }

    #[test]
    fn test_builtin_store() {
        let store = ChipConfigStore::builtin();

        let f4 = store.get(0x413).unwrap();
        assert_eq!(f4.sectors.len(), 12);
        assert_eq!(f4.flash_size(), 1024 * 1024);
        assert_eq!(f4.sectors[5].addr, 0x0802_0000);

        let f0 = store.get(0x448).unwrap();
        assert_eq!(f0.flash_size(), 128 * 1024);

        assert!(matches!(
            store.get(0x410),
            Err(Error::ConfigurationMissing { pid: 0x410 })
        ));
    }

    #[test]
    fn test_store_from_json() {
        let json = r#"{
            "1043": {"usr_start_addr": 134217728, "sectors": [{"addr": 134217728, "size": 16384}]},
            "0x448": {"usr_start_addr": 134217728, "sectors": [{"addr": 134217728, "size": 2048}]}
        }"#;

        let store = ChipConfigStore::from_json(json).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(0x413).unwrap().pid, 0x413);
        assert_eq!(store.get(0x448).unwrap().sectors[0].size, 2048);
    }

    #[test]
    fn test_store_rejects_bad_keys() {
        let json = r#"{"f4": {"usr_start_addr": 0, "sectors": [{"addr": 0, "size": 1}]}}"#;
        assert!(matches!(ChipConfigStore::from_json(json), Err(Error::Config(_))));

        let json = r#"{"1043": {"usr_start_addr": 0, "sectors": []}}"#;
        assert!(matches!(ChipConfigStore::from_json(json), Err(Error::Config(_))));
    }

    #[test]
    fn test_store_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stm32.json");
        fs::write(
            &path,
            r#"{"1043": {"usr_start_addr": 134217728, "sectors": [{"addr": 134217728, "size": 16384}]}}"#,
        )
        .unwrap();

        let store = ChipConfigStore::from_file(&path).unwrap();
        assert!(store.get(1043).is_ok());
    }
}
