//! Earbud registry using heed (LMDB).
//!
//! Remembers what the case last learned about each earbud slot: address,
//! battery and pairing state, and how often and when it last answered.

use std::{
   borrow::Cow,
   path::{Path, PathBuf},
   sync::Arc,
   time::SystemTime,
};

use heed::{Database, Env, EnvOpenOptions, types::SerdeBincode};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ccp::BtAddress, event::EarbudInfo, wire::Earbud};

/// Errors that can occur in registry operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create registry directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

pub type Result<T> = std::result::Result<T, Error>;

struct KeyCodec;

impl<'a> heed::BytesEncode<'a> for KeyCodec {
   type EItem = Earbud;
   fn bytes_encode(item: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      Ok(Cow::Owned(vec![*item as u8]))
   }
}

impl<'a> heed::BytesDecode<'a> for KeyCodec {
   type DItem = Earbud;
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      match bytes {
         [b] => Earbud::from_repr(*b).ok_or_else(|| invalid_key().into()),
         _ => Err(invalid_key().into()),
      }
   }
}

fn invalid_key() -> std::io::Error {
   std::io::Error::new(std::io::ErrorKind::InvalidData, "Invalid earbud key")
}

fn unix_now() -> u64 {
   SystemTime::UNIX_EPOCH.elapsed().map_or(0, |d| d.as_secs())
}

/// What is known about the earbud in one slot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EarbudRecord {
   pub address: Option<BtAddress>,
   pub battery: Option<u8>,
   pub charging: bool,
   pub peer_paired: bool,
   pub status_count: u32,
   /// Unix timestamp of the last answer.
   pub last_seen: u64,
}

#[derive(Debug)]
struct Db {
   env: Env,
   /// Earbud slot -> `EarbudRecord`
   earbuds: Database<KeyCodec, SerdeBincode<EarbudRecord>>,
}

/// Thread-safe handle to the registry.
#[derive(Clone, Debug)]
pub struct Registry {
   db: Arc<Db>,
}

impl Registry {
   /// Opens or creates the registry at its default location.
   pub fn open() -> Result<Self> {
      Self::open_at(&Self::db_path()?)
   }

   pub fn open_at(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(1024 * 1024)
            .max_dbs(1)
            .open(path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let earbuds = env
         .create_database(&mut wtxn, Some("earbuds"))
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      debug!("Earbud registry open at {}", path.display());
      Ok(Self {
         db: Arc::new(Db { env, earbuds }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("CASECOMMS_DB_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/casecommsd/earbuds.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("casecommsd").join("earbuds.db"))
   }

   pub fn get(&self, earbud: Earbud) -> Result<Option<EarbudRecord>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      self.db.earbuds.get(&rtxn, &earbud).map_err(Error::DatabaseOperation)
   }

   /// Every slot that has a record, left first.
   pub fn all(&self) -> Result<Vec<(Earbud, EarbudRecord)>> {
      let mut out = Vec::new();
      for earbud in Earbud::BOTH {
         if let Some(record) = self.get(earbud)? {
            out.push((earbud, record));
         }
      }
      Ok(out)
   }

   fn update(&self, earbud: Earbud, f: impl FnOnce(&mut EarbudRecord)) -> Result<EarbudRecord> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;

      let mut record = self
         .db
         .earbuds
         .get(&wtxn, &earbud)
         .map_err(Error::DatabaseOperation)?
         .unwrap_or_default();
      f(&mut record);
      record.last_seen = unix_now();

      self
         .db
         .earbuds
         .put(&mut wtxn, &earbud, &record)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      Ok(record)
   }

   pub fn record_status(&self, earbud: Earbud, info: &EarbudInfo) -> Result<EarbudRecord> {
      self.update(earbud, |r| {
         r.battery = Some(info.battery);
         r.charging = info.charging;
         r.peer_paired = info.peer_paired;
         r.status_count = r.status_count.saturating_add(1);
      })
   }

   pub fn record_address(&self, earbud: Earbud, address: BtAddress) -> Result<EarbudRecord> {
      self.update(earbud, |r| r.address = Some(address))
   }

   /// Registry contents as JSON, keyed by earbud side.
   pub fn to_json(&self) -> Result<serde_json::Value> {
      let map = self
         .all()?
         .into_iter()
         .map(|(earbud, record)| {
            let value = serde_json::json!({
               "address": record.address.map(|a| a.to_string()),
               "battery": record.battery,
               "charging": record.charging,
               "peer_paired": record.peer_paired,
               "status_count": record.status_count,
               "last_seen": record.last_seen,
            });
            (earbud.to_str().to_owned(), value)
         })
         .collect::<serde_json::Map<_, _>>();
      Ok(serde_json::Value::Object(map))
   }
}
