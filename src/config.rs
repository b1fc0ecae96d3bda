//! Configuration management for the link service.
//!
//! This module handles loading and saving configuration from disk,
//! including timeouts, tracking limits and the connection policy.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use bluer::Address;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   error::{LinkError, Result},
   profile::Profile,
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// Budget for a connect or disconnect to be confirmed.
   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_ms: u64,

   /// Budget for an audio channel to open or close.
   #[serde(default = "default_audio_timeout")]
   pub audio_timeout_ms: u64,

   /// Peers tracked concurrently per profile.
   #[serde(default = "default_max_tracked_peers")]
   pub max_tracked_peers: usize,

   /// Connecting or connected peers allowed at once on an audio profile.
   /// With a limit of one, a newly connected peer also becomes active.
   #[serde(default = "default_max_connected_audio_devices")]
   pub max_connected_audio_devices: usize,

   /// Window in which one device is made active on every profile it joins.
   #[serde(default = "default_correlation_window")]
   pub correlation_window_ms: u64,

   #[serde(default = "default_profiles")]
   pub profiles: Vec<Profile>,

   /// Refuse every connection while set.
   #[serde(default)]
   pub quiet_mode: bool,

   #[serde(default)]
   pub blocked_devices: Vec<BlockedDevice>,

   /// Adapter name such as `hci0`; the default adapter when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<SmolStr>,
}

/// A device refused on some or all profiles.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BlockedDevice {
   pub address: String,
   /// Profiles the block applies to; all of them when empty.
   #[serde(default)]
   pub profiles: Vec<Profile>,
}

const fn default_connect_timeout() -> u64 {
   30_000
}

const fn default_audio_timeout() -> u64 {
   30_000
}

const fn default_max_tracked_peers() -> usize {
   10
}

const fn default_max_connected_audio_devices() -> usize {
   5
}

const fn default_correlation_window() -> u64 {
   6_000
}

fn default_profiles() -> Vec<Profile> {
   vec![
      Profile::A2dp,
      Profile::Headset,
      Profile::HearingAid,
      Profile::HidHost,
   ]
}

impl Default for Config {
   fn default() -> Self {
      Self {
         connect_timeout_ms: default_connect_timeout(),
         audio_timeout_ms: default_audio_timeout(),
         max_tracked_peers: default_max_tracked_peers(),
         max_connected_audio_devices: default_max_connected_audio_devices(),
         correlation_window_ms: default_correlation_window(),
         profiles: default_profiles(),
         quiet_mode: false,
         blocked_devices: vec![],
         adapter: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         let config: Self = toml::from_str(&contents)?;
         config.validate()?;
         Ok(config)
      } else {
         // Create default config
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

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
      let config_dir = if let Ok(btlinkd_home) = env::var("BTLINKD_HOME") {
         PathBuf::from(btlinkd_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(LinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("btlinkd").join("config.toml"))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   pub const fn audio_timeout(&self) -> Duration {
      Duration::from_millis(self.audio_timeout_ms)
   }

   pub const fn correlation_window(&self) -> Duration {
      Duration::from_millis(self.correlation_window_ms)
   }

   pub fn is_enabled(&self, profile: Profile) -> bool {
      self.profiles.contains(&profile)
   }

   /// Checks that every blocked device names a valid address.
   pub fn validate(&self) -> Result<()> {
      for device in &self.blocked_devices {
         device.peer()?;
      }
      Ok(())
   }

   /// Checks if `peer` is blocked for `profile`.
   pub fn is_blocked(&self, profile: Profile, peer: Address) -> bool {
      self.blocked_devices.iter().any(|d| {
         d.peer().is_ok_and(|a| a == peer)
            && (d.profiles.is_empty() || d.profiles.contains(&profile))
      })
   }
}

impl BlockedDevice {
   pub fn peer(&self) -> Result<Address> {
      self
         .address
         .parse()
         .map_err(|_| LinkError::InvalidAddress(self.address.clone()))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_file_writes_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("btlinkd").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert!(path.exists());
      assert_eq!(config.connect_timeout(), Duration::from_secs(30));
      assert_eq!(config.correlation_window(), Duration::from_secs(6));
      assert_eq!(config.max_tracked_peers, 10);
      assert_eq!(config.profiles.len(), 4);
   }

   #[test]
   fn test_partial_file_keeps_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         r#"
quiet_mode = true
connect_timeout_ms = 500
profiles = ["a2dp", "hid_host"]

[[blocked_devices]]
address = "00:11:22:33:44:55"
profiles = ["hid_host"]
"#,
      )
      .unwrap();

      let config = Config::load_from(&path).unwrap();
      assert!(config.quiet_mode);
      assert_eq!(config.connect_timeout(), Duration::from_millis(500));
      assert_eq!(config.audio_timeout_ms, 30_000);
      assert!(config.is_enabled(Profile::A2dp));
      assert!(!config.is_enabled(Profile::Headset));
      let peer = Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
      assert!(config.is_blocked(Profile::HidHost, peer));
      assert!(!config.is_blocked(Profile::A2dp, peer));
      assert_eq!(config.max_connected_audio_devices, 5);
   }

   #[test]
   fn test_save_round_trip() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      let config = Config {
         adapter: Some("hci1".into()),
         blocked_devices: vec![BlockedDevice {
            address: "aa:bb:cc:dd:ee:ff".into(),
            profiles: vec![],
         }],
         ..Config::default()
      };
      config.save_to(&path).unwrap();

      let loaded = Config::load_from(&path).unwrap();
      assert_eq!(loaded.adapter.as_deref(), Some("hci1"));
      let peer = Address::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
      assert!(loaded.is_blocked(Profile::Headset, peer));
   }

   #[test]
   fn test_malformed_blocked_address_is_reported() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         r#"
[[blocked_devices]]
address = "00:11:22:33:44"
"#,
      )
      .unwrap();
      assert!(matches!(
         Config::load_from(&path),
         Err(LinkError::InvalidAddress(a)) if a == "00:11:22:33:44"
      ));
   }

   #[test]
   fn test_invalid_toml_is_reported() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "connect_timeout_ms = \"soon\"").unwrap();
      assert!(matches!(
         Config::load_from(&path),
         Err(LinkError::TomlParse(_))
      ));
   }
}
