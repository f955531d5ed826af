//! Case manager.
//!
//! A single tokio task owns the case application and the simulated earbuds
//! behind it. It runs the protocol tick, the once-a-second housekeeping and
//! every command, so the state machines never need locking. Everybody else
//! talks to it through [`CaseManager`].

use std::{path::PathBuf, time::Duration};

use log::{info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time::{self, MissedTickBehavior},
};

use crate::{
   case::{CaseApp, CaseSnapshot},
   cli,
   config::Config,
   error::{CaseCommsError, Result},
   event::EventSender,
   sim::{SimBus, SimCase},
   store::Registry,
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;
const MS_PER_SECOND: u64 = 1000;

#[derive(Debug)]
enum ManagerCommand {
   RunCommand(String, oneshot::Sender<Vec<String>>),
   GetStatus(oneshot::Sender<CaseSnapshot>),
   GetEarbuds(oneshot::Sender<Result<serde_json::Value>>),
   SetLid(bool),
   SetCharger(bool),
}

/// Handle to the case manager task.
#[derive(Clone, Debug)]
pub struct CaseManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl CaseManager {
   /// Starts the manager. Configuration changes are written to
   /// `config_path` when given.
   pub fn new(
      config: Config,
      config_path: Option<PathBuf>,
      registry: Option<Registry>,
      event_tx: EventSender,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(config, config_path, registry, event_tx, command_rx).run());
      Self { inbox: command_tx }
   }

   async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| CaseCommsError::ManagerShutdown)?;
      rx.await.map_err(|_| CaseCommsError::ManagerShutdown)
   }

   /// Runs a text command and returns what it printed.
   pub async fn run_command(&self, line: String) -> Result<Vec<String>> {
      self.request(|tx| ManagerCommand::RunCommand(line, tx)).await
   }

   pub async fn status(&self) -> Result<CaseSnapshot> {
      self.request(ManagerCommand::GetStatus).await
   }

   /// Registry contents as JSON.
   pub async fn earbuds(&self) -> Result<serde_json::Value> {
      self.request(ManagerCommand::GetEarbuds).await?
   }

   pub async fn set_lid(&self, open: bool) -> Result<()> {
      self
         .inbox
         .send(ManagerCommand::SetLid(open))
         .await
         .map_err(|_| CaseCommsError::ManagerShutdown)
   }

   pub async fn set_charger(&self, connected: bool) -> Result<()> {
      self
         .inbox
         .send(ManagerCommand::SetCharger(connected))
         .await
         .map_err(|_| CaseCommsError::ManagerShutdown)
   }
}

struct ManagerActor {
   app: CaseApp<SimCase, SimBus>,
   config_path: Option<PathBuf>,
   registry: Option<Registry>,
   command_rx: mpsc::Receiver<ManagerCommand>,
   tick: Duration,
   ticks_per_second: u64,
   ticks: u64,
}

impl ManagerActor {
   fn new(
      config: Config,
      config_path: Option<PathBuf>,
      registry: Option<Registry>,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let tick_ms = config.tick_ms.clamp(1, MS_PER_SECOND);
      let hw = SimCase::new(config.case_battery_mv);
      let bus = SimBus::new(config.scheme);
      Self {
         app: CaseApp::new(hw, bus, config, event_tx),
         config_path,
         registry,
         command_rx,
         tick: Duration::from_millis(tick_ms),
         ticks_per_second: MS_PER_SECOND / tick_ms,
         ticks: 0,
      }
   }

   async fn run(mut self) {
      info!(
         "Case manager starting up, {} tick {}ms",
         self.app.config().scheme,
         self.tick.as_millis()
      );

      let mut tick_interval = time::interval(self.tick);
      tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
         select! {
             _ = tick_interval.tick() => {
                 self.on_tick();
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Case manager shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
         }
      }
   }

   fn on_tick(&mut self) {
      self.app.periodic();
      self.ticks += 1;
      if self.ticks % self.ticks_per_second == 0 {
         self.app.tick();
      }
      self.save_config();
   }

   fn save_config(&mut self) {
      if !self.app.take_config_dirty() {
         return;
      }
      let Some(path) = &self.config_path else {
         return;
      };
      if let Err(e) = self.app.config().save_to(path) {
         warn!("Failed to save configuration: {e}");
      }
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::RunCommand(line, reply) => {
            info!("> {line}");
            let lines = cli::execute(&mut self.app, &line).into_lines();
            self.save_config();
            let _ = reply.send(lines);
         },
         ManagerCommand::GetStatus(reply) => {
            let _ = reply.send(self.app.snapshot());
         },
         ManagerCommand::GetEarbuds(reply) => {
            let json = match &self.registry {
               Some(registry) => registry.to_json().map_err(CaseCommsError::from),
               None => Ok(serde_json::json!({})),
            };
            let _ = reply.send(json);
         },
         ManagerCommand::SetLid(open) => {
            if self.app.hardware().lid != open {
               self.app.hardware_mut().lid = open;
               self.app.event_occurred();
            }
         },
         ManagerCommand::SetCharger(connected) => {
            if self.app.hardware().charger != connected {
               self.app.hardware_mut().charger = connected;
               self.app.event_occurred();
            }
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use super::*;
   use crate::event::{CaseEvent, recorder::Recorder};

   fn manager(config: Config, config_path: Option<PathBuf>) -> (CaseManager, Arc<Recorder>) {
      let recorder = Arc::new(Recorder::default());
      let manager = CaseManager::new(config, config_path, None, recorder.clone());
      (manager, recorder)
   }

   #[tokio::test(start_paused = true)]
   async fn test_lid_open_reaches_both_earbuds() {
      let (manager, recorder) = manager(Config::default(), None);
      manager.set_lid(true).await.unwrap();
      time::sleep(Duration::from_secs(10)).await;

      let status = manager.status().await.unwrap();
      assert!(status.lid_open);
      assert!(status.earbuds.iter().all(|e| e.present && e.valid));
      assert!(recorder.take().contains(&CaseEvent::LidChanged(true)));
      assert_eq!(manager.earbuds().await.unwrap(), serde_json::json!({}));
   }

   #[tokio::test(start_paused = true)]
   async fn test_commands_and_config_saving() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      let (manager, _) = manager(Config::default(), Some(path.clone()));

      assert_eq!(manager.run_command("AT+LID?".to_owned()).await.unwrap(), vec!["0", "OK"]);
      assert_eq!(manager.run_command("config stc 5".to_owned()).await.unwrap(), vec!["OK"]);
      assert_eq!(manager.run_command("bogus".to_owned()).await.unwrap(), vec!["ERROR"]);

      let saved = Config::load_from(&path).unwrap();
      assert_eq!(saved.status_time_closed, 5);
   }

   #[tokio::test(start_paused = true)]
   async fn test_status_timer_runs_on_seconds() {
      let (manager, _) = manager(Config::default(), None);
      time::sleep(Duration::from_millis(2500)).await;
      let status = manager.status().await.unwrap();
      assert!(status.run_time >= 2);
      assert!(status.run_time <= 3);
   }
}
