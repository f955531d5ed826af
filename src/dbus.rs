use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::service::CaseManager;

pub struct CaseService {
   manager: CaseManager,
}

impl CaseService {
   pub const fn new(manager: CaseManager) -> Self {
      Self { manager }
   }
}

fn failed(e: impl ToString) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.casecomms.Case")]
impl CaseService {
   /// Case and earbud state as JSON.
   async fn get_status(&self) -> zbus::fdo::Result<String> {
      let snapshot = self.manager.status().await.map_err(failed)?;
      serde_json::to_string(&snapshot).map_err(failed)
   }

   /// What the registry remembers about each earbud, as JSON.
   async fn get_earbuds(&self) -> zbus::fdo::Result<String> {
      let earbuds = self.manager.earbuds().await.map_err(failed)?;
      Ok(earbuds.to_string())
   }

   /// Runs a command line and returns its immediate output. Reports that
   /// arrive later come through `CommandOutput`.
   async fn run_command(&self, command: String) -> zbus::fdo::Result<Vec<String>> {
      if command.trim().is_empty() {
         return Err(zbus::fdo::Error::InvalidArgs("Empty command".into()));
      }
      self.manager.run_command(command).await.map_err(failed)
   }

   async fn set_lid(&self, open: bool) -> zbus::fdo::Result<()> {
      info!("Lid {} over D-Bus", if open { "opened" } else { "closed" });
      self.manager.set_lid(open).await.map_err(failed)
   }

   async fn set_charger(&self, connected: bool) -> zbus::fdo::Result<()> {
      info!(
         "Charger {} over D-Bus",
         if connected { "connected" } else { "disconnected" }
      );
      self.manager.set_charger(connected).await.map_err(failed)
   }

   // Signals
   #[zbus(signal)]
   pub async fn lid_changed(emitter: &SignalEmitter<'_>, open: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn charger_changed(emitter: &SignalEmitter<'_>, connected: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn earbud_status(
      emitter: &SignalEmitter<'_>,
      earbud: &str,
      status: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn earbud_address(
      emitter: &SignalEmitter<'_>,
      earbud: &str,
      address: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn earbud_absent(emitter: &SignalEmitter<'_>, earbud: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn shipping_mode(emitter: &SignalEmitter<'_>, active: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn command_output(emitter: &SignalEmitter<'_>, line: &str) -> zbus::Result<()>;

   #[zbus(property)]
   async fn lid_open(&self) -> bool {
      self.manager.status().await.is_ok_and(|s| s.lid_open)
   }

   #[zbus(property)]
   async fn in_shipping_mode(&self) -> bool {
      self
         .manager
         .status()
         .await
         .is_ok_and(|s| s.in_shipping_mode)
   }
}
