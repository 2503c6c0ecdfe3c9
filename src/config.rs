use crate::scheduler::PollTiming;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub grace_period_ms: u64,
    // used when bbswitch does not report a bus id
    pub device_index: usize,
    pub history_seconds: f64,
    pub bbswitch_path: PathBuf,
    pub modules_path: PathBuf,
    pub sysfs_pci_path: PathBuf,
    pub pci_ids_path: PathBuf,
    pub nvidia_device: PathBuf,
    pub bbswitchd_socket: PathBuf,
    pub switch_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            grace_period_ms: 5000,
            device_index: 0,
            history_seconds: 60.0,
            bbswitch_path: PathBuf::from("/proc/acpi/bbswitch"),
            modules_path: PathBuf::from("/proc/modules"),
            sysfs_pci_path: PathBuf::from("/sys/bus/pci/devices"),
            pci_ids_path: PathBuf::from("/usr/share/hwdata/pci.ids"),
            nvidia_device: PathBuf::from("/dev/nvidia0"),
            bbswitchd_socket: PathBuf::from("/var/run/bbswitchd.sock"),
            switch_timeout_ms: 30_000,
        }
    }
}

impl MonitorConfig {
    /// Loads the config from a JSON file; `None` gives the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("poll_interval_ms"));
        }
        if self.grace_period_ms == 0 {
            return Err(ConfigError::Zero("grace_period_ms"));
        }
        if self.switch_timeout_ms == 0 {
            return Err(ConfigError::Zero("switch_timeout_ms"));
        }
        if self.history_seconds <= 0.0 {
            return Err(ConfigError::Zero("history_seconds"));
        }
        Ok(())
    }

    pub fn timing(&self) -> PollTiming {
        PollTiming {
            interval: Duration::from_millis(self.poll_interval_ms),
            grace_period: Duration::from_millis(self.grace_period_ms),
        }
    }

    pub fn switch_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_timeout_ms)
    }
}
