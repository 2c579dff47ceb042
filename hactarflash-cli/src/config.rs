//! Configuration file support for hactarflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (HACTARFLASH_*)
//! 3. Local config file (./hactarflash.toml)
//! 4. Global config file (~/.config/hactarflash/config.toml)
//!
//! ```toml
//! [connection]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [flash]
//! recover = true
//! attempts = 5
//! backoff_ms = 3000
//! erase_verify = "fast"
//! chip_config = "chips.json"
//! ```

use {
    crate::CliError,
    anyhow::{Context, Result},
    directories::ProjectDirs,
    hactarflash::{ChipConfigStore, EraseVerify, RecoveryPolicy, port::DEFAULT_BAUD},
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "hactarflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Console baud rate.
    pub baud: Option<u32>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Re-select and resume after recoverable failures.
    pub recover: Option<bool>,
    /// Attempts per phase.
    pub attempts: Option<usize>,
    /// Wait after a failure before re-selecting, in milliseconds.
    pub backoff_ms: Option<u64>,
    /// Erase verification mode.
    pub erase_verify: Option<EraseVerify>,
    /// JSON chip table replacing the built-in one.
    pub chip_config: Option<PathBuf>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash settings.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    ///
    /// Unreadable files are reported and skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_lenient(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_lenient(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a file named on the command line.
    ///
    /// Unlike [`Config::load`], a missing or malformed file is an error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        let config = Self::parse(&content).map_err(|e| {
            CliError::Config(format!("Invalid config file {}: {e}", path.display()))
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn load_lenient(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {e}", path.display());
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {e}", path.display());
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "hactarflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        let flash = other.flash;
        if flash.recover.is_some() {
            self.flash.recover = flash.recover;
        }
        if flash.attempts.is_some() {
            self.flash.attempts = flash.attempts;
        }
        if flash.backoff_ms.is_some() {
            self.flash.backoff_ms = flash.backoff_ms;
        }
        if flash.erase_verify.is_some() {
            self.flash.erase_verify = flash.erase_verify;
        }
        if flash.chip_config.is_some() {
            self.flash.chip_config = flash.chip_config;
        }
    }

    /// Port from the command line, else from the config files.
    pub fn port(&self, cli_port: Option<&str>) -> Option<String> {
        cli_port
            .map(str::to_string)
            .or_else(|| self.connection.port.clone())
    }

    /// Baud rate from the command line, else the config files, else 115200.
    pub fn baud(&self, cli_baud: Option<u32>) -> u32 {
        cli_baud
            .or(self.connection.baud)
            .unwrap_or(DEFAULT_BAUD)
    }

    /// Recovery policy with command-line overrides applied.
    pub fn recovery_policy(&self, no_recover: bool, attempts: Option<usize>) -> RecoveryPolicy {
        let mut policy = RecoveryPolicy::default();
        if let Some(backoff_ms) = self.flash.backoff_ms {
            policy.backoff = Duration::from_millis(backoff_ms);
        }

        let recover = !no_recover && self.flash.recover.unwrap_or(true);
        if !recover {
            return RecoveryPolicy::disabled();
        }

        match attempts.or(self.flash.attempts) {
            Some(n) => policy.with_max_attempts(n),
            None => policy,
        }
    }

    /// Erase verification mode; `full` on the command line wins.
    pub fn erase_verify(&self, full: bool) -> EraseVerify {
        if full {
            EraseVerify::Full
        } else {
            self.flash.erase_verify.unwrap_or_default()
        }
    }

    /// Chip table from `path`, else the configured file, else the built-in one.
    pub fn chip_store(&self, path: Option<&Path>) -> Result<ChipConfigStore> {
        match path.or(self.flash.chip_config.as_deref()) {
            Some(path) => ChipConfigStore::from_file(path)
                .with_context(|| format!("Failed to load chip table {}", path.display())),
            None => Ok(ChipConfigStore::builtin()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.port.is_none());
        assert!(config.connection.baud.is_none());
        assert_eq!(config.flash, FlashConfig::default());
        assert_eq!(config.baud(None), 115_200);
        assert_eq!(config.erase_verify(false), EraseVerify::Fast);
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
            [connection]
            port = "/dev/ttyUSB1"
            baud = 230400

            [flash]
            recover = false
            attempts = 3
            backoff_ms = 250
            erase_verify = "full"
            chip_config = "chips.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.baud(None), 230_400);
        assert_eq!(config.flash.recover, Some(false));
        assert_eq!(config.flash.attempts, Some(3));
        assert_eq!(config.flash.erase_verify, Some(EraseVerify::Full));
        assert_eq!(config.flash.chip_config, Some(PathBuf::from("chips.json")));
    }

    #[test]
    fn test_parse_rejects_unknown_erase_mode() {
        assert!(Config::parse("[flash]\nerase_verify = \"sometimes\"\n").is_err());
    }

    #[test]
    fn test_merge_overrides_only_set_values() {
        let mut base = Config::default();
        base.connection.port = Some("/dev/ttyUSB0".into());
        base.connection.baud = Some(115_200);
        base.flash.attempts = Some(5);

        let mut other = Config::default();
        other.connection.baud = Some(921_600);
        other.flash.erase_verify = Some(EraseVerify::Full);

        base.merge(other);

        assert_eq!(base.connection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.connection.baud, Some(921_600));
        assert_eq!(base.flash.attempts, Some(5));
        assert_eq!(base.flash.erase_verify, Some(EraseVerify::Full));
    }

    #[test]
    fn test_cli_values_win() {
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyUSB0".into());
        config.connection.baud = Some(57_600);

        assert_eq!(config.port(Some("COM3")).as_deref(), Some("COM3"));
        assert_eq!(config.port(None).as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.baud(Some(9_600)), 9_600);
        assert_eq!(config.baud(None), 57_600);
        assert_eq!(config.erase_verify(true), EraseVerify::Full);
    }

    #[test]
    fn test_recovery_policy() {
        let mut config = Config::default();
        let policy = config.recovery_policy(false, None);
        assert!(policy.recover);
        assert_eq!(policy.max_attempts, RecoveryPolicy::default().max_attempts);

        config.flash.attempts = Some(2);
        config.flash.backoff_ms = Some(10);
        let policy = config.recovery_policy(false, None);
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.backoff, Duration::from_millis(10));
        assert_eq!(config.recovery_policy(false, Some(7)).max_attempts, 7);

        let policy = config.recovery_policy(true, Some(7));
        assert!(!policy.recover);
        assert_eq!(policy.max_attempts, 1);

        config.flash.recover = Some(false);
        assert!(!config.recovery_policy(false, None).recover);
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[connection]\nport = \"COM7\"\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("COM7"));
    }

    #[test]
    fn test_load_from_path_errors_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "invalid toml [[[").unwrap();

        for path in [broken, dir.path().join("missing.toml")] {
            let err = Config::load_from_path(&path).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<CliError>(),
                Some(CliError::Config(_))
            ));
        }
    }

    #[test]
    fn test_chip_store_sources() {
        let config = Config::default();
        assert_eq!(config.chip_store(None).unwrap(), ChipConfigStore::builtin());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chips.json");
        fs::write(
            &path,
            r#"{"0x450": {"usr_start_addr": 134217728, "sectors": [{"addr": 134217728, "size": 131072}]}}"#,
        )
        .unwrap();

        let store = config.chip_store(Some(&path)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(0x450).unwrap().flash_size(), 0x2_0000);

        assert!(config.chip_store(Some(&dir.path().join("none.json"))).is_err());
    }
}
