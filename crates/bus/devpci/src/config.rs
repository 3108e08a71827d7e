//! Runtime configuration.
//!
//! Every key is optional. A file can be named with `DEVPCI_CONFIG`:
//!
//! ```toml
//! backend = "native"
//! proc_devices = "/proc/bus/pci/devices"
//! sysfs_devices = "/sys/bus/pci/devices"
//! dev_dir = "/dev"
//! disconnect_poll_ms = 100
//! wait_retry_ms = 50
//! wait_retry_max_ms = 500
//! ```
//!
//! `DEVPCI_BACKEND` overrides `backend`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::PciError;
use crate::isr::IsrTiming;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "DEVPCI_CONFIG";

/// Environment variable overriding the default backend.
pub const BACKEND_ENV: &str = "DEVPCI_BACKEND";

/// devpci settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Backend selected when none is named explicitly.
    pub backend: String,
    /// Textual bus listing read by the native backend.
    pub proc_devices: PathBuf,
    /// Root of the per-device sysfs attribute directories.
    pub sysfs_devices: PathBuf,
    /// Directory holding the `uioN` device nodes.
    pub dev_dir: PathBuf,
    /// Disconnect polling interval in milliseconds.
    pub disconnect_poll_ms: u64,
    /// First sleep after a failed interrupt wait, in milliseconds.
    pub wait_retry_ms: u64,
    /// Bound of the doubling wait retry sleep, in milliseconds.
    pub wait_retry_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: "native".into(),
            proc_devices: "/proc/bus/pci/devices".into(),
            sysfs_devices: "/sys/bus/pci/devices".into(),
            dev_dir: "/dev".into(),
            disconnect_poll_ms: 100,
            wait_retry_ms: 50,
            wait_retry_max_ms: 500,
        }
    }
}

impl Config {
    /// Parses a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Reads a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, PciError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            log::error!("devpci: reading {}: {err}", path.display());
            PciError::InitFailed
        })?;
        Self::from_toml(&text).map_err(|err| {
            log::error!("devpci: parsing {}: {err}", path.display());
            PciError::InitFailed
        })
    }

    /// Loads the process configuration from the environment.
    pub fn load() -> Result<Self, PciError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(backend) = std::env::var(BACKEND_ENV).ok().filter(|b| !b.is_empty()) {
            config.backend = backend;
        }
        Ok(config)
    }

    /// Interrupt thread timing derived from the millisecond settings.
    #[must_use]
    pub fn timing(&self) -> IsrTiming {
        IsrTiming {
            disconnect_poll: Duration::from_millis(self.disconnect_poll_ms),
            retry: Duration::from_millis(self.wait_retry_ms),
            retry_max: Duration::from_millis(self.wait_retry_max_ms.max(self.wait_retry_ms)),
        }
    }
}
