//! Configuration management for the headset bridge.
//!
//! This module handles loading and saving the link timing and retry
//! parameters from disk.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::sco::VoiceSetting,
   error::{HeadsetError, Result},
};

/// Main configuration structure for the bridge.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Receive timeout on the control channel; bounds how long the
   /// supervisor goes without re-checking its stop signal.
   #[serde(default = "default_control_timeout")]
   pub control_timeout_ms: u64,

   /// How long after the control session starts before audio is
   /// attempted without the peer having sent AT+CMER.
   #[serde(default = "default_audio_grace")]
   pub audio_grace_ms: u64,

   #[serde(default = "default_retry_cooldown")]
   pub retry_cooldown_ms: u64,

   /// Consecutive failed cycles before the supervisor gives up.
   /// Unset means retry forever.
   #[serde(default)]
   pub retry_limit: Option<u32>,

   #[serde(default)]
   pub voice_setting: VoiceSetting,
}

const fn default_control_timeout() -> u64 {
   1000
}

const fn default_audio_grace() -> u64 {
   10_000
}

const fn default_retry_cooldown() -> u64 {
   1000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         control_timeout_ms: default_control_timeout(),
         audio_grace_ms: default_audio_grace(),
         retry_cooldown_ms: default_retry_cooldown(),
         retry_limit: None,
         voice_setting: VoiceSetting::default(),
      }
   }
}

impl Config {
   /// Loads configuration from the default location, creating it if absent.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing defaults there if it does not exist.
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

   /// Saves the configuration to `path`.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("HFP_BRIDGE_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }
      let config_dir = dirs::config_dir().ok_or(HeadsetError::ConfigDirNotFound)?;
      Ok(config_dir.join("hfp-bridge").join("config.toml"))
   }

   pub const fn control_timeout(&self) -> Duration {
      Duration::from_millis(self.control_timeout_ms)
   }

   pub const fn audio_grace(&self) -> Duration {
      Duration::from_millis(self.audio_grace_ms)
   }

   pub const fn retry_cooldown(&self) -> Duration {
      Duration::from_millis(self.retry_cooldown_ms)
   }
}
