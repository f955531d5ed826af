//! Configuration management for the case daemon.
//!
//! Settings live in a TOML file. A handful of them can also be read and
//! changed at runtime through the `config` command, by their short names.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
   error::{CaseCommsError, Result},
   wire::Scheme,
};

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub scheme: Scheme,

   /// Period of the protocol tick, in milliseconds.
   #[serde(default = "default_tick_ms")]
   pub tick_ms: u64,

   /// Seconds between status exchanges while the lid is closed.
   #[serde(default = "default_status_time_closed")]
   pub status_time_closed: u32,

   /// Seconds between status exchanges once the lid has been open a while.
   /// Zero disables them.
   #[serde(default)]
   pub status_time_open: u32,

   #[serde(default)]
   pub shipping_mode: bool,

   #[serde(default = "default_battery_cutoff_mv")]
   pub battery_cutoff_mv: u16,

   /// Stored as a hex string: TOML integers stop at `i64::MAX`.
   #[serde(default = "default_serial", with = "serial_hex")]
   pub serial: u64,

   #[serde(default)]
   pub board_id: u32,

   /// Cell voltage reported by the simulated case battery.
   #[serde(default = "default_case_battery_mv")]
   pub case_battery_mv: u16,
}

const fn default_tick_ms() -> u64 {
   10
}

const fn default_status_time_closed() -> u32 {
   60
}

const fn default_battery_cutoff_mv() -> u16 {
   3200
}

const fn default_serial() -> u64 {
   u64::MAX
}

const fn default_case_battery_mv() -> u16 {
   4000
}

mod serial_hex {
   use serde::{Deserialize, Deserializer, Serializer, de::Error};

   pub fn serialize<S: Serializer>(serial: &u64, s: S) -> Result<S::Ok, S::Error> {
      s.serialize_str(&format!("{serial:016X}"))
   }

   pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
      let text = String::deserialize(d)?;
      u64::from_str_radix(text.trim_start_matches("0x"), 16).map_err(D::Error::custom)
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         scheme: Scheme::default(),
         tick_ms: default_tick_ms(),
         status_time_closed: default_status_time_closed(),
         status_time_open: 0,
         shipping_mode: false,
         battery_cutoff_mv: default_battery_cutoff_mv(),
         serial: default_serial(),
         board_id: 0,
         case_battery_mv: default_case_battery_mv(),
      }
   }
}

/// Settings reachable through the `config` command.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   strum::Display,
   strum::EnumString,
   strum::EnumIter,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ConfigKey {
   Serial,
   Stc,
   Sto,
   Bco,
   Id,
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
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

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("CASECOMMS_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(CaseCommsError::ConfigDirNotFound);
      };

      Ok(config_dir.join("casecommsd").join("config.toml"))
   }

   pub fn get(&self, key: ConfigKey) -> String {
      match key {
         ConfigKey::Serial => format!("{:016X}", self.serial),
         ConfigKey::Stc => self.status_time_closed.to_string(),
         ConfigKey::Sto => self.status_time_open.to_string(),
         ConfigKey::Bco => self.battery_cutoff_mv.to_string(),
         ConfigKey::Id => self.board_id.to_string(),
      }
   }

   /// Parses and applies a value. The serial number is hexadecimal, the
   /// status times must be at least one second.
   pub fn set(&mut self, key: ConfigKey, value: &str) -> Result<()> {
      let invalid = || CaseCommsError::InvalidConfigValue {
         key: key.into(),
         value: value.to_owned(),
      };
      match key {
         ConfigKey::Serial => {
            self.serial = u64::from_str_radix(value, 16).map_err(|_| invalid())?;
         },
         ConfigKey::Stc | ConfigKey::Sto => {
            let secs = value.parse::<u32>().ok().filter(|&s| s >= 1).ok_or_else(invalid)?;
            if key == ConfigKey::Stc {
               self.status_time_closed = secs;
            } else {
               self.status_time_open = secs;
            }
         },
         ConfigKey::Bco => self.battery_cutoff_mv = value.parse().map_err(|_| invalid())?,
         ConfigKey::Id => self.board_id = value.parse().map_err(|_| invalid())?,
      }
      Ok(())
   }

   /// `name : value` per line, or all values on one comma-separated line.
   pub fn display(&self, verbose: bool) -> Vec<String> {
      use strum::IntoEnumIterator;

      if verbose {
         ConfigKey::iter()
            .map(|key| format!("{:<6} : {}", key.to_string(), self.get(key)))
            .collect()
      } else {
         vec![ConfigKey::iter().map(|key| self.get(key)).collect::<Vec<_>>().join(",")]
      }
   }
}
