//! Configuration management for the BLE session.
//!
//! This module handles loading and saving configuration from disk,
//! including timeouts, connection limits and known-device aliases.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   error::{Error, Result},
   session::connection::ConnectionConfig,
   types::DeviceId,
};

/// Main configuration structure for the session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_ms: u64,

   #[serde(default = "default_discovery_timeout")]
   pub discovery_timeout_ms: u64,

   #[serde(default = "default_disconnect_timeout")]
   pub disconnect_timeout_ms: u64,

   #[serde(default = "default_auto_discover")]
   pub auto_discover_services: bool,

   #[serde(default = "default_max_connections")]
   pub max_connections: usize,

   #[serde(default = "default_advertisement_max_age")]
   pub advertisement_max_age_sec: u64,

   #[serde(default = "default_terminal_grace")]
   pub terminal_grace_sec: u64,

   #[serde(default = "default_housekeeping_interval")]
   pub housekeeping_interval_sec: u64,

   #[serde(default)]
   pub aliases: Vec<DeviceAlias>,
}

/// Friendly name for a device that does not advertise one.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceAlias {
   pub id: String,
   pub name: String,
}

const fn default_connect_timeout() -> u64 {
   10_000
}

const fn default_discovery_timeout() -> u64 {
   15_000
}

const fn default_disconnect_timeout() -> u64 {
   5_000
}

const fn default_auto_discover() -> bool {
   true
}

const fn default_max_connections() -> usize {
   7
}

const fn default_advertisement_max_age() -> u64 {
   60
}

const fn default_terminal_grace() -> u64 {
   30
}

const fn default_housekeeping_interval() -> u64 {
   5
}

impl Default for Config {
   fn default() -> Self {
      Self {
         connect_timeout_ms: default_connect_timeout(),
         discovery_timeout_ms: default_discovery_timeout(),
         disconnect_timeout_ms: default_disconnect_timeout(),
         auto_discover_services: default_auto_discover(),
         max_connections: default_max_connections(),
         advertisement_max_age_sec: default_advertisement_max_age(),
         terminal_grace_sec: default_terminal_grace(),
         housekeeping_interval_sec: default_housekeeping_interval(),
         aliases: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there if missing.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Writes the configuration to `path`, creating parent directories.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BLECENTRAL_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(config_dir) = dirs::config_dir() {
         config_dir
      } else {
         return Err(Error::ConfigDirNotFound);
      };

      Ok(config_dir.join("blecentral").join("config.toml"))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   pub const fn advertisement_max_age(&self) -> Duration {
      Duration::from_secs(self.advertisement_max_age_sec)
   }

   pub const fn terminal_grace(&self) -> Duration {
      Duration::from_secs(self.terminal_grace_sec)
   }

   pub fn housekeeping_interval(&self) -> Duration {
      Duration::from_secs(self.housekeeping_interval_sec.max(1))
   }

   /// Per-connection settings handed to every state machine.
   pub const fn connection_config(&self) -> ConnectionConfig {
      ConnectionConfig {
         auto_discover: self.auto_discover_services,
         discovery_timeout: Duration::from_millis(self.discovery_timeout_ms),
         disconnect_timeout: Duration::from_millis(self.disconnect_timeout_ms),
      }
   }

   /// Configured aliases keyed by device identity.
   pub fn aliases(&self) -> impl Iterator<Item = (DeviceId, SmolStr)> + '_ {
      self
         .aliases
         .iter()
         .map(|alias| (DeviceId::from(alias.id.as_str()), SmolStr::from(alias.name.as_str())))
   }
}
