//! What an earbud knows about the case it sits in.

use std::collections::VecDeque;

use log::{info, warn};
use serde::Serialize;

/// Battery state byte as exchanged with the case: percentage in bits 6..0,
/// charging flag in bit 7.
pub const BATTERY_STATUS_UNKNOWN: u8 = 0x7F;
pub const BATTERY_CHARGING: u8 = 0x80;
const BATTERY_PERCENTAGE: u8 = 0x7F;

pub const fn battery_percentage(state: u8) -> u8 {
   state & BATTERY_PERCENTAGE
}

pub const fn battery_is_charging(state: u8) -> bool {
   state & BATTERY_CHARGING != 0
}

/// Unknown, or a percentage that makes sense.
pub const fn battery_state_is_valid(state: u8) -> bool {
   state == BATTERY_STATUS_UNKNOWN || battery_percentage(state) <= 100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
pub enum LidState {
   Closed,
   Open,
   #[default]
   Unknown,
}

/// Notifications for the rest of the earbud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithCaseEvent {
   Lid(LidState),
   Power {
      case_battery: u8,
      peer_battery: u8,
      local_battery: u8,
      charger_connected: bool,
   },
   /// Shipping mode was accepted and the charger has now gone.
   PowerOff,
}

#[derive(Debug)]
pub struct WithCase {
   lid: LidState,
   case_battery: u8,
   peer_battery: u8,
   case_charger_connected: bool,
   shipping_mode_pending: bool,
   events: VecDeque<WithCaseEvent>,
}

impl Default for WithCase {
   fn default() -> Self {
      Self {
         lid: LidState::Unknown,
         case_battery: BATTERY_STATUS_UNKNOWN,
         peer_battery: BATTERY_STATUS_UNKNOWN,
         case_charger_connected: false,
         shipping_mode_pending: false,
         events: VecDeque::new(),
      }
   }
}

impl WithCase {
   pub fn new() -> Self {
      Self::default()
   }

   pub const fn lid(&self) -> LidState {
      self.lid
   }

   pub const fn case_battery(&self) -> u8 {
      self.case_battery
   }

   pub const fn peer_battery(&self) -> u8 {
      self.peer_battery
   }

   pub const fn case_charger_connected(&self) -> bool {
      self.case_charger_connected
   }

   pub const fn shipping_mode_pending(&self) -> bool {
      self.shipping_mode_pending
   }

   pub fn poll_event(&mut self) -> Option<WithCaseEvent> {
      self.events.pop_front()
   }

   pub fn lid_event(&mut self, lid: LidState) {
      info!("Case lid {lid}");
      if lid != self.lid {
         self.lid = lid;
         self.events.push_back(WithCaseEvent::Lid(lid));
      }
   }

   /// Battery states from a full case status. Nothing is kept unless all
   /// three make sense; the local state is only passed on.
   pub fn power_event(&mut self, case_battery: u8, peer_battery: u8, local_battery: u8, charger_connected: bool) {
      info!(
         "Case [{}% chg {} conn {}] peer [{}% chg {}] local [{}% chg {}]",
         battery_percentage(case_battery),
         battery_is_charging(case_battery),
         charger_connected,
         battery_percentage(peer_battery),
         battery_is_charging(peer_battery),
         battery_percentage(local_battery),
         battery_is_charging(local_battery),
      );
      if ![case_battery, peer_battery, local_battery].into_iter().all(battery_state_is_valid) {
         warn!("Invalid battery state from case");
         return;
      }
      self.case_battery = case_battery;
      self.peer_battery = peer_battery;
      self.case_charger_connected = charger_connected;
      self.events.push_back(WithCaseEvent::Power {
         case_battery,
         peer_battery,
         local_battery,
         charger_connected,
      });
   }

   /// The earbud was taken out of the case: the last lid state can no
   /// longer be trusted.
   pub fn left_case(&mut self) {
      self.lid = LidState::Unknown;
      self.events.push_back(WithCaseEvent::Lid(LidState::Unknown));
      if self.shipping_mode_pending {
         info!("Shipping mode cancelled");
         self.shipping_mode_pending = false;
      }
   }

   pub fn charger_detached(&mut self) {
      info!("Charger detached, shipping mode pending {}", self.shipping_mode_pending);
      if self.shipping_mode_pending {
         self.events.push_back(WithCaseEvent::PowerOff);
      }
   }

   /// Shipping mode command from the case. It can only be honoured while the
   /// charger is connected, as its removal is the cue to power off. Returns
   /// whether the command was accepted.
   pub fn shipping_mode_cmd(&mut self, charger_connected: bool) -> bool {
      self.shipping_mode_pending = charger_connected;
      self.shipping_mode_pending
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn drain(w: &mut WithCase) -> Vec<WithCaseEvent> {
      std::iter::from_fn(|| w.poll_event()).collect()
   }

   #[test]
   fn test_battery_validity() {
      assert!(battery_state_is_valid(BATTERY_STATUS_UNKNOWN));
      assert!(battery_state_is_valid(100));
      assert!(battery_state_is_valid(0x80 | 100));
      assert!(!battery_state_is_valid(101));
      assert!(!battery_state_is_valid(0xFF));
   }

   #[test]
   fn test_lid_notifies_on_change() {
      let mut w = WithCase::new();
      w.lid_event(LidState::Open);
      w.lid_event(LidState::Open);
      w.lid_event(LidState::Closed);
      assert_eq!(drain(&mut w), vec![WithCaseEvent::Lid(LidState::Open), WithCaseEvent::Lid(LidState::Closed)]);
   }

   #[test]
   fn test_power_event_validation() {
      let mut w = WithCase::new();
      w.power_event(0x64, 0x65, 0x80 | 50, true);
      assert!(drain(&mut w).is_empty());
      assert_eq!(w.case_battery(), BATTERY_STATUS_UNKNOWN);

      w.power_event(0xE4, BATTERY_STATUS_UNKNOWN, 0x80 | 50, true);
      assert_eq!(w.case_battery(), 0xE4);
      assert!(w.case_charger_connected());
      assert_eq!(
         drain(&mut w),
         vec![WithCaseEvent::Power {
            case_battery: 0xE4,
            peer_battery: BATTERY_STATUS_UNKNOWN,
            local_battery: 0x80 | 50,
            charger_connected: true,
         }]
      );
   }

   #[test]
   fn test_shipping_mode() {
      let mut w = WithCase::new();
      assert!(!w.shipping_mode_cmd(false));
      w.charger_detached();
      assert!(drain(&mut w).is_empty());

      assert!(w.shipping_mode_cmd(true));
      w.charger_detached();
      assert_eq!(drain(&mut w), vec![WithCaseEvent::PowerOff]);
   }

   #[test]
   fn test_leaving_case_cancels_shipping() {
      let mut w = WithCase::new();
      w.lid_event(LidState::Closed);
      assert!(w.shipping_mode_cmd(true));
      drain(&mut w);

      w.left_case();
      assert_eq!(w.lid(), LidState::Unknown);
      assert!(!w.shipping_mode_pending());
      w.charger_detached();
      assert_eq!(drain(&mut w), vec![WithCaseEvent::Lid(LidState::Unknown)]);
   }
}
