//! Error types for the case daemon.
//!
//! Protocol layers report trouble through events and log lines; this type
//! covers everything around them: D-Bus, configuration, the earbud
//! registry and command handling.

use thiserror::Error;

use crate::store;

/// Main error type for the daemon.
#[derive(Error, Debug)]
pub enum CaseCommsError {
   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Registry error: {0}")]
   Registry(#[from] store::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Invalid value {value:?} for {key}")]
   InvalidConfigValue { key: &'static str, value: String },

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `CaseCommsError`.
pub type Result<T> = std::result::Result<T, CaseCommsError>;
