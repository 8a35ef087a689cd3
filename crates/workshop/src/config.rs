//! Workshop configuration.
//!
//! Defaults, then an optional TOML file (`--config`), then flags and
//! `WORKSHOP_*` environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use yubikey_device_kit::KitOptions;
use yubikey_device_kit::yubikey::pcsc_transport::DEFAULT_READER_FILTERS;

/// The path the workshop starts with.
pub const DEFAULT_DERIVATION_PATH: &str = "44'/60'/0'/0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Everything the workshop needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkshopConfig {
    /// Initial content of the derivation path field.
    pub derivation_path: String,
    /// Initial content of the transaction field (hex RLP, may be empty).
    pub transaction: String,
    /// PIN verified before signing. Without it, PIN-protected slots refuse
    /// to sign.
    pub pin: Option<String>,
    /// Reader name fragments that identify a YubiKey.
    pub reader_filters: Vec<String>,
    pub discovery_poll_interval_ms: u64,
    pub discovery_timeout_ms: u64,
    pub session_poll_interval_ms: u64,
}

impl Default for WorkshopConfig {
    fn default() -> Self {
        Self {
            derivation_path: DEFAULT_DERIVATION_PATH.to_string(),
            transaction: String::new(),
            pin: None,
            reader_filters: DEFAULT_READER_FILTERS.iter().map(ToString::to_string).collect(),
            discovery_poll_interval_ms: 500,
            discovery_timeout_ms: 30_000,
            session_poll_interval_ms: 1_000,
        }
    }
}

impl WorkshopConfig {
    /// Reads a TOML file; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses TOML text.
    ///
    /// # Errors
    ///
    /// Returns the TOML error for malformed text or unknown keys.
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Options for the device kit.
    #[must_use]
    pub fn kit_options(&self) -> KitOptions {
        KitOptions {
            discovery_poll_interval: Duration::from_millis(self.discovery_poll_interval_ms),
            discovery_timeout: Duration::from_millis(self.discovery_timeout_ms),
            session_poll_interval: Duration::from_millis(self.session_poll_interval_ms),
            pin: self.pin.clone(),
        }
    }
}

/// Command line of the workshop binary.
#[derive(Debug, Parser)]
#[command(name = "yubikey-evm-workshop", version, about)]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, short, env = "WORKSHOP_CONFIG")]
    pub config: Option<PathBuf>,

    /// PIV PIN used before signing.
    #[arg(long, env = "WORKSHOP_PIN", hide_env_values = true)]
    pub pin: Option<String>,

    /// Initial derivation path.
    #[arg(long, env = "WORKSHOP_DERIVATION_PATH")]
    pub derivation_path: Option<String>,

    /// Initial unsigned transaction (hex RLP).
    #[arg(long, env = "WORKSHOP_TRANSACTION")]
    pub transaction: Option<String>,

    /// Reader name fragment; repeat or separate with commas.
    #[arg(long = "reader", env = "WORKSHOP_READERS", value_delimiter = ',')]
    pub readers: Vec<String>,

    /// Seconds to wait for a device during discovery.
    #[arg(long, env = "WORKSHOP_DISCOVERY_TIMEOUT")]
    pub discovery_timeout_secs: Option<u64>,

    /// More logging (-v debug, -vv trace). `RUST_LOG` wins.
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Builds the effective configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `--config` names an unreadable file.
    pub fn resolve(&self) -> Result<WorkshopConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => WorkshopConfig::load(path)?,
            None => WorkshopConfig::default(),
        };

        if let Some(pin) = &self.pin {
            config.pin = Some(pin.clone());
        }
        if let Some(path) = &self.derivation_path {
            config.derivation_path.clone_from(path);
        }
        if let Some(tx) = &self.transaction {
            config.transaction.clone_from(tx);
        }
        if !self.readers.is_empty() {
            config.reader_filters.clone_from(&self.readers);
        }
        if let Some(secs) = self.discovery_timeout_secs {
            config.discovery_timeout_ms = secs.saturating_mul(1_000);
        }

        Ok(config)
    }
}
