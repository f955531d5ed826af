//! Event handling for case state changes.
//!
//! The case application raises these as lid, charger and earbud state
//! changes; the daemon turns them into D-Bus signals and registry updates.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use smol_str::SmolStr;

use crate::{ccp::BtAddress, wire::Earbud};

/// Decoded simple status answer from an earbud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EarbudInfo {
   pub peer_paired: bool,
   pub charge_rate: bool,
   pub battery: u8,
   pub charging: bool,
}

impl EarbudInfo {
   pub fn to_json(self) -> serde_json::Value {
      json!({
          "battery": u32::from(self.battery),
          "charging": self.charging,
          "peer_paired": self.peer_paired,
          "charge_rate": self.charge_rate,
      })
   }
}

/// Events that can be emitted by the case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseEvent {
   LidChanged(bool),
   ChargerChanged(bool),
   EarbudStatus(Earbud, EarbudInfo),
   EarbudAddress(Earbud, BtAddress),
   EarbudAbsent(Earbud),
   ShippingMode(bool),
   /// Asynchronous command report line, e.g. `LOOPBACK (L): OK`.
   Output(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: CaseEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
