//! Charger case comms D-Bus service
//!
//! Runs the case side of the charger-case link against a pair of simulated
//! earbuds and exposes it over D-Bus: state queries, the case command set,
//! and signals for lid, charger and earbud changes.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use dbus::CaseService;
use event::{CaseEvent, EventBus};
use service::CaseManager;
use store::Registry;

mod battery;
mod case;
mod ccp;
mod cli;
mod config;
mod dbus;
mod earbud;
mod error;
mod event;
mod service;
mod sim;
mod store;
mod wire;

use crate::{dbus::CaseServiceSignals, error::Result};

const OBJECT_PATH: &str = "/org/casecomms/case";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting case comms D-Bus service...");

   // Load configuration
   let config_path = config::Config::config_path()?;
   let config = config::Config::load_from(&config_path)?;
   info!(
      "Loaded configuration: {}, status every {}s",
      config.scheme, config.status_time_closed
   );

   let registry = match Registry::open() {
      Ok(registry) => Some(registry),
      Err(e) => {
         warn!("Earbud registry unavailable: {e}");
         None
      },
   };

   // Create event channel
   let event_bus = EventProcessor::new(registry.clone());

   let manager = CaseManager::new(config, Some(config_path), registry, event_bus.clone());

   // Create D-Bus service
   let service = CaseService::new(manager);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.casecomms")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("Case comms D-Bus service started at org.casecomms");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down case comms service...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<CaseEvent>,
   notifier: Notify,
   registry: Option<Registry>,
}

impl EventProcessor {
   fn new(registry: Option<Registry>) -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
         registry,
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<CaseEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn record(&self, event: &CaseEvent) {
      let Some(registry) = &self.registry else {
         return;
      };
      let result = match event {
         CaseEvent::EarbudStatus(earbud, info) => registry.record_status(*earbud, info),
         CaseEvent::EarbudAddress(earbud, address) => registry.record_address(*earbud, *address),
         _ => return,
      };
      if let Err(e) = result {
         warn!("Failed to update earbud registry: {e}");
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<CaseService>, event: CaseEvent) -> Result<()> {
      self.record(&event);
      match event {
         CaseEvent::LidChanged(open) => {
            iface.lid_changed(open).await?;
            iface.get().await.lid_open_changed(iface.signal_emitter()).await?;
         },
         CaseEvent::ChargerChanged(connected) => {
            iface.charger_changed(connected).await?;
         },
         CaseEvent::EarbudStatus(earbud, info) => {
            iface
               .earbud_status(earbud.to_str(), &info.to_json().to_string())
               .await?;
         },
         CaseEvent::EarbudAddress(earbud, address) => {
            iface
               .earbud_address(earbud.to_str(), &address.to_string())
               .await?;
         },
         CaseEvent::EarbudAbsent(earbud) => {
            iface.earbud_absent(earbud.to_str()).await?;
         },
         CaseEvent::ShippingMode(active) => {
            iface.shipping_mode(active).await?;
            iface
               .get()
               .await
               .in_shipping_mode_changed(iface.signal_emitter())
               .await?;
         },
         CaseEvent::Output(line) => {
            iface.command_output(&line).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, CaseService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: CaseEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
