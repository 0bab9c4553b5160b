//! Configuration types for dmp
//!
//! The gateway reads a TOML file shaped like:
//!
//! ```toml
//! [nbd]
//! listen = "0.0.0.0:10809"
//!
//! [stat]
//! listen = "127.0.0.1:9400"
//!
//! [dispatch]
//! workers = 4
//! queue_depth = 1024
//!
//! [logging]
//! level = "info"
//!
//! [[volumes]]
//! name = "dmp1"
//! device = "/dev/loop0"
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

/// Root configuration for the gateway
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// NBD front-end configuration
    #[serde(default)]
    pub nbd: NbdConfig,
    /// Statistics endpoint configuration
    #[serde(default)]
    pub stat: StatConfig,
    /// Request dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Volumes registered at startup
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
            .map_err(|e| Error::configuration(format!("{}: {e}", path.display())))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.workers == 0 {
            return Err(Error::configuration("dispatch.workers must be at least 1"));
        }
        if self.dispatch.queue_depth == 0 {
            return Err(Error::configuration(
                "dispatch.queue_depth must be at least 1",
            ));
        }
        for (i, volume) in self.volumes.iter().enumerate() {
            if self.volumes[..i].iter().any(|v| v.name == volume.name) {
                return Err(Error::configuration(format!(
                    "duplicate volume name: {}",
                    volume.name
                )));
            }
        }
        Ok(())
    }
}

/// NBD listener configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NbdConfig {
    /// TCP address the NBD server binds
    #[serde(default = "default_nbd_listen")]
    pub listen: SocketAddr,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            listen: default_nbd_listen(),
        }
    }
}

/// Statistics endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatConfig {
    /// HTTP address serving the statistics report
    #[serde(default = "default_stat_listen")]
    pub listen: SocketAddr,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            listen: default_stat_listen(),
        }
    }
}

/// Dispatch worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of worker threads performing device I/O
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Requests that may wait in the hand-off queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A volume to register at startup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume name (also the NBD export name)
    pub name: String,
    /// Underlying device: a path or `MAJOR:MINOR`
    pub device: String,
    /// Volume length in 512-byte sectors (0 = whole device)
    #[serde(default)]
    pub len_sectors: u64,
    /// Open the device read-only
    #[serde(default)]
    pub read_only: bool,
    /// Open block devices exclusively
    #[serde(default)]
    pub exclusive: bool,
}

/// Parses the `NAME=DEVICE` form accepted on the command line.
impl FromStr for VolumeConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, device) = s
            .split_once('=')
            .ok_or_else(|| Error::invalid_argument(format!("expected NAME=DEVICE, got '{s}'")))?;
        let (name, device) = (name.trim(), device.trim());
        if name.is_empty() || device.is_empty() {
            return Err(Error::invalid_argument(format!(
                "empty volume name or device in '{s}'"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            device: device.to_string(),
            len_sectors: 0,
            read_only: false,
            exclusive: false,
        })
    }
}

fn default_nbd_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 10809))
}

fn default_stat_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9400))
}

const fn default_workers() -> usize {
    4
}

const fn default_queue_depth() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}
