//! Case application.
//!
//! Drives the earbuds from the case side: a short status broadcast on every
//! lid or charger change, periodic status exchanges on a timer, and the
//! longer sequences started by commands (extended status, factory reset,
//! loopback tests, shipping mode). Each earbud has its own state machine,
//! advanced once per protocol tick, which queues work in ALERT and waits
//! for the message layer's verdict in the `Sent*` states.

use log::{debug, info};
use rand::{RngCore, SeedableRng, rngs::StdRng};
use serde::Serialize;
use smol_str::SmolStr;

use crate::{
   battery::BatteryMonitor,
   ccp::{BATTERY_UNKNOWN, Ccp, CcpEvent, MAX_MSG_SIZE, StatusBroadcast},
   cli::{CliResult, Reply},
   config::Config,
   event::{CaseEvent, EarbudInfo, EventSender},
   wire::{ChargerComms, Earbud},
};

/// Ticks to leave a freshly reset earbud alone before asking for status.
pub const RESET_DELAY_TICKS: u16 = 100;
/// Status requests tried after a reset before giving up on the earbud.
pub const RESET_POLLS: u8 = 3;
/// Case battery percentage under which the charge-rate flag is raised.
pub const LOW_BATTERY_THRESHOLD: u8 = 10;
/// Earbud battery percentage considered fully charged.
pub const HIGH_BATTERY_THRESHOLD: u8 = 100;
pub const LOOPBACK_SEED: u64 = 1234;
/// Ticks the lid must stay open before shipping mode is left.
pub const SHIPPING_TIME: u8 = 25;
/// Seconds of lid-open time after which the open status period applies.
pub const STATUS_MAX_OPEN_TIME: u16 = 600;
/// Status period once both earbuds are charged and the lid is closed.
pub const STATUS_TIME_CHARGED: u32 = 86400;

/// Sensors of the case itself.
pub trait CaseHardware {
   fn lid_open(&self) -> bool;
   fn charger_connected(&self) -> bool;
   fn charging(&self) -> bool;
   /// Cell voltage as the battery monitor would measure it right now.
   fn battery_mv(&self) -> u16;
}

/// Per-earbud sequence state.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CaseState {
   #[default]
   Idle,
   Alert,
   SentStatusRequest,
   StatusBroadcast,
   SentReset,
   ResetDelay,
   Resetting,
   SentLoopback,
   SentShippingMode,
   SentXstatusRequest,
   ShippingDone,
}

/// Parameters of a loopback test.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoopbackRequest {
   /// Messages to exchange; zero runs a single exchange without a rate report.
   pub iterations: u16,
   /// Payload length, defaults to the largest the link allows.
   pub len: Option<usize>,
   /// Pattern repeated to fill the payload instead of pseudo-random data.
   pub data: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Loopback {
   iterations: u16,
   count: u16,
   nacks: u16,
   generated: bool,
   data: [u8; MAX_MSG_SIZE],
   len: usize,
   start_tick: u64,
   rng: Option<StdRng>,
}

impl Loopback {
   fn sent(&self) -> &[u8] {
      &self.data[..self.len]
   }
}

#[derive(Debug, Default)]
struct Slot {
   state: CaseState,
   state_time: u16,
   present: bool,
   valid: bool,
   ack: bool,
   give_up: bool,
   abort: bool,
   status_wanted: bool,
   xstatus_wanted: bool,
   reset_wanted: bool,
   loopback_wanted: bool,
   ship_wanted: bool,
   info: EarbudInfo,
   info_type: u8,
   reset_attempts: u8,
   loopback: Loopback,
   /// A command is waiting for this earbud's outcome to be reported.
   reporting: bool,
}

impl Slot {
   fn enter(&mut self, state: CaseState) {
      self.state = state;
      self.state_time = 0;
   }

   /// Makes sure a queued request gets picked up.
   fn wake(&mut self) {
      if self.state == CaseState::Idle {
         self.enter(CaseState::Alert);
      }
   }
}

#[derive(Debug, Clone, Serialize)]
pub struct EarbudSnapshot {
   pub earbud: Earbud,
   pub state: CaseState,
   pub present: bool,
   pub valid: bool,
   pub battery: Option<u8>,
   pub charging: bool,
   pub peer_paired: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseSnapshot {
   pub lid_open: bool,
   pub lid_open_time: u16,
   pub charger_connected: bool,
   pub in_shipping_mode: bool,
   pub comms_enabled: bool,
   pub battery_mv: u16,
   pub battery_percent: u8,
   pub next_status_in: Option<u32>,
   pub run_time: u32,
   pub earbuds: [EarbudSnapshot; 2],
}

pub struct CaseApp<H, C> {
   hw: H,
   ccp: Ccp<C>,
   config: Config,
   config_dirty: bool,
   events: EventSender,
   battery: BatteryMonitor,
   battery_cmd: bool,
   slots: [Slot; 2],
   ticks: u64,
   run_time: u32,
   lid_now: bool,
   lid_before: bool,
   chg_now: bool,
   chg_before: bool,
   event_pending: bool,
   comms_enabled: bool,
   in_shipping_mode: bool,
   shipping_lid_count: u8,
   dfu_planned: bool,
   status_timer: bool,
   status_countdown: u32,
   lid_open_time: u16,
}

impl<H: CaseHardware, C: ChargerComms> CaseApp<H, C> {
   pub fn new(hw: H, comms: C, config: Config, events: EventSender) -> Self {
      let mut app = Self {
         hw,
         ccp: Ccp::new(config.scheme, comms),
         config,
         config_dirty: false,
         events,
         battery: BatteryMonitor::new(),
         battery_cmd: false,
         slots: Default::default(),
         ticks: 0,
         run_time: 0,
         lid_now: false,
         lid_before: false,
         chg_now: false,
         chg_before: false,
         event_pending: true,
         comms_enabled: false,
         in_shipping_mode: false,
         shipping_lid_count: 0,
         dfu_planned: false,
         status_timer: false,
         status_countdown: 0,
         lid_open_time: 0,
      };
      for slot in &mut app.slots {
         slot.info.battery = BATTERY_UNKNOWN;
      }

      if app.config.shipping_mode {
         info!("Starting in shipping mode");
         app.in_shipping_mode = true;
      } else {
         app.start();
      }
      app
   }

   pub const fn hardware(&self) -> &H {
      &self.hw
   }

   /// Changing lid or charger state must be followed by
   /// [`event_occurred`](Self::event_occurred).
   pub const fn hardware_mut(&mut self) -> &mut H {
      &mut self.hw
   }

   pub const fn comms(&self) -> &C {
      self.ccp.comms()
   }

   pub const fn comms_mut(&mut self) -> &mut C {
      self.ccp.comms_mut()
   }

   pub const fn config(&self) -> &Config {
      &self.config
   }

   /// Edits the configuration; the change is flagged for saving.
   pub fn config_mut(&mut self) -> &mut Config {
      self.config_dirty = true;
      &mut self.config
   }

   /// Whether the configuration changed since the last call.
   pub fn take_config_dirty(&mut self) -> bool {
      std::mem::take(&mut self.config_dirty)
   }

   pub const fn in_shipping_mode(&self) -> bool {
      self.in_shipping_mode
   }

   pub const fn lid_open(&self) -> bool {
      self.lid_now
   }

   pub const fn status_countdown(&self) -> u32 {
      self.status_countdown
   }

   pub fn state(&self, earbud: Earbud) -> CaseState {
      self.slots[earbud.index()].state
   }

   pub fn earbud(&self, earbud: Earbud) -> EarbudSnapshot {
      let slot = &self.slots[earbud.index()];
      EarbudSnapshot {
         earbud,
         state: slot.state,
         present: slot.present,
         valid: slot.valid,
         battery: (slot.info.battery != BATTERY_UNKNOWN).then_some(slot.info.battery),
         charging: slot.info.charging,
         peer_paired: slot.info.peer_paired,
      }
   }

   pub fn snapshot(&self) -> CaseSnapshot {
      CaseSnapshot {
         lid_open: self.lid_now,
         lid_open_time: self.lid_open_time,
         charger_connected: self.chg_now,
         in_shipping_mode: self.in_shipping_mode,
         comms_enabled: self.comms_enabled,
         battery_mv: self.battery.mv(),
         battery_percent: self.battery.percent(),
         next_status_in: self.status_timer.then_some(self.status_countdown),
         run_time: self.run_time,
         earbuds: Earbud::BOTH.map(|e| self.earbud(e)),
      }
   }

   /// Flags a lid or charger change, handled on the next tick.
   pub fn event_occurred(&mut self) {
      self.event_pending = true;
   }

   fn start(&mut self) {
      self.in_shipping_mode = false;
      self.comms_enabled = true;
      self.status_timer = true;
      self.event_pending = true;
      self.battery.request(false);
   }

   fn report(&self, line: impl Into<SmolStr>) {
      let line = line.into();
      info!("{line}");
      self.events.emit(CaseEvent::Output(line));
   }

   fn schedule_status(&mut self, secs: u32) {
      if secs == 0 {
         self.status_timer = false;
      } else {
         self.status_timer = true;
         self.status_countdown = secs;
      }
   }

   /// Once-a-second housekeeping: status timer and lid-open time.
   pub fn tick(&mut self) {
      self.run_time = self.run_time.wrapping_add(1);
      self.status_countdown = self.status_countdown.saturating_sub(1);

      if self.lid_now {
         if self.lid_open_time < STATUS_MAX_OPEN_TIME {
            self.lid_open_time += 1;
         }
      } else {
         self.lid_open_time = 0;
      }

      if self.status_timer && self.status_countdown == 0 {
         self.start_status_sequence(false);
         let secs = if self.lid_now && self.lid_open_time >= STATUS_MAX_OPEN_TIME {
            self.config.status_time_open
         } else {
            self.config.status_time_closed
         };
         self.schedule_status(secs);
      }
   }

   /// Reads the case battery and asks both earbuds for their status.
   pub fn start_status_sequence(&mut self, led: bool) {
      if self.dfu_planned {
         return;
      }
      self.battery.request(led);
      if self.comms_enabled {
         for slot in &mut self.slots {
            slot.status_wanted = true;
            slot.wake();
         }
      }
   }

   /// Marks a firmware update as planned, which holds off new status
   /// sequences. Returns whether both earbuds are idle.
   #[cfg_attr(not(test), allow(dead_code))]
   pub fn allow_dfu(&mut self) -> bool {
      self.dfu_planned = true;
      self.slots.iter().all(|s| s.state == CaseState::Idle)
   }

   #[cfg_attr(not(test), allow(dead_code))]
   pub fn dfu_finished(&mut self) {
      self.dfu_planned = false;
   }

   /// Protocol tick.
   pub fn periodic(&mut self) {
      self.ticks += 1;

      if let Some(reading) = self.battery.periodic(self.hw.battery_mv(), self.config.battery_cutoff_mv) {
         debug!("Case battery {}mV ({}%)", reading.mv, reading.percent);
         if std::mem::take(&mut self.battery_cmd) {
            self.report(format!("{},{}", reading.mv, reading.percent));
            self.report("OK");
         }
      }

      if self.comms_enabled {
         self.ccp.periodic();
         while let Some(event) = self.ccp.poll_event() {
            self.on_ccp_event(event);
         }
      }

      for slot in &mut self.slots {
         slot.state_time = slot.state_time.saturating_add(1);
      }

      if self.event_pending {
         self.handle_case_event();
      } else {
         for earbud in Earbud::BOTH {
            self.step(earbud);
            let slot = &mut self.slots[earbud.index()];
            slot.ack = false;
            slot.abort = false;
            slot.give_up = false;
         }
      }

      if self.in_shipping_mode && self.lid_now {
         self.shipping_lid_count = self.shipping_lid_count.saturating_add(1);
         if self.shipping_lid_count > SHIPPING_TIME {
            self.report("Leaving shipping mode");
            self.config.shipping_mode = false;
            self.config_dirty = true;
            self.lid_before = false;
            self.start();
            self.events.emit(CaseEvent::ShippingMode(false));
         }
      }

      if self.slots.iter().all(|s| s.state == CaseState::ShippingDone) {
         let reporting = self.slots[Earbud::Left.index()].reporting;
         for slot in &mut self.slots {
            slot.ship_wanted = false;
         }
         if self.slots.iter().all(|s| s.valid) {
            if reporting {
               self.report("OK");
            }
            self.enter_shipping_mode();
         } else {
            if reporting {
               self.report("ERROR");
            }
            for slot in &mut self.slots {
               slot.enter(CaseState::Alert);
            }
         }
         for slot in &mut self.slots {
            slot.reporting = false;
         }
      }
   }

   fn handle_case_event(&mut self) {
      self.event_pending = false;
      self.lid_now = self.hw.lid_open();
      self.chg_now = self.hw.charger_connected();

      if self.lid_now {
         if !self.lid_before {
            info!("Lid opened");
            self.events.emit(CaseEvent::LidChanged(true));
            if !self.in_shipping_mode {
               self.start_status_sequence(true);
            }
            // Only a lid that has stayed open a while counts as open.
            let secs = if self.lid_open_time < STATUS_MAX_OPEN_TIME {
               self.config.status_time_closed
            } else {
               self.config.status_time_open
            };
            self.schedule_status(secs);
         }
      } else {
         if self.in_shipping_mode {
            self.shipping_lid_count = 0;
         }
         if self.lid_before {
            info!("Lid closed");
            self.events.emit(CaseEvent::LidChanged(false));
            self.schedule_status(self.config.status_time_closed);
            if !self.in_shipping_mode {
               self.start_status_sequence(true);
            }
         }
         self.lid_open_time = 0;
      }

      if self.chg_now != self.chg_before {
         info!("Charger {}", if self.chg_now { "connected" } else { "disconnected" });
         self.events.emit(CaseEvent::ChargerChanged(self.chg_now));
      }

      if self.comms_enabled {
         let low = self.battery.percent() < LOW_BATTERY_THRESHOLD;
         if !self.ccp.tx_short_status(self.lid_now, self.chg_now, low) {
            self.event_pending = true;
         }
      }

      self.lid_before = self.lid_now;
      self.chg_before = self.chg_now;
   }

   fn on_ccp_event(&mut self, event: CcpEvent) {
      match event {
         CcpEvent::EarbudStatus {
            earbud,
            peer_paired,
            charge_rate,
            battery,
            charging,
         } => {
            let info = EarbudInfo {
               peer_paired,
               charge_rate,
               battery,
               charging,
            };
            let slot = &mut self.slots[earbud.index()];
            slot.info = info;
            slot.valid = true;
            slot.present = true;
            if slot.reporting {
               self.report(format!("EBSTATUS ({}): {battery}", earbud.letter()));
            }
            self.events.emit(CaseEvent::EarbudStatus(earbud, info));
         },
         CcpEvent::BtAddress { earbud, address } => {
            let slot = &mut self.slots[earbud.index()];
            slot.valid = true;
            slot.present = true;
            if slot.reporting {
               self.report(format!("EBSTATUS ({}): {}", earbud.letter(), address.to_report()));
            }
            self.events.emit(CaseEvent::EarbudAddress(earbud, address));
         },
         CcpEvent::Loopback { earbud, data } => {
            let slot = &mut self.slots[earbud.index()];
            let ok = data[..] == *slot.loopback.sent();
            slot.valid = true;
            slot.present = true;
            self.report(format!(
               "LOOPBACK ({}): {}",
               earbud.letter(),
               if ok { "OK" } else { "ERROR" }
            ));
         },
         CcpEvent::Shipping { earbud, accepted } => {
            let slot = &mut self.slots[earbud.index()];
            if accepted {
               slot.valid = true;
            } else {
               slot.give_up = true;
            }
         },
         CcpEvent::Ack(earbud) => {
            let slot = &mut self.slots[earbud.index()];
            slot.ack = true;
            slot.present = true;
         },
         CcpEvent::Nack(earbud) => {
            let slot = &mut self.slots[earbud.index()];
            slot.loopback.nacks = slot.loopback.nacks.saturating_add(1);
            slot.present = true;
         },
         CcpEvent::GiveUp(earbud) => {
            info!("Give up ({})", earbud.letter());
            let slot = &mut self.slots[earbud.index()];
            slot.give_up = true;
            slot.present = true;
         },
         CcpEvent::NoResponse(earbud) => {
            info!("No response ({})", earbud.letter());
            let slot = &mut self.slots[earbud.index()];
            slot.give_up = true;
            if std::mem::take(&mut slot.present) {
               self.events.emit(CaseEvent::EarbudAbsent(earbud));
            }
         },
         CcpEvent::Abort(earbud) => {
            info!("Abort ({})", earbud.letter());
            self.slots[earbud.index()].abort = true;
         },
         CcpEvent::BroadcastFinished => debug!("Broadcast finished"),
      }
   }

   fn step(&mut self, earbud: Earbud) {
      let i = earbud.index();
      let s = &mut self.slots[i];
      match s.state {
         CaseState::Idle | CaseState::ShippingDone => {},
         CaseState::Alert => self.alert(earbud),
         CaseState::SentReset => {
            if s.ack {
               // Whatever we knew about the earbud is stale now.
               s.valid = false;
               s.info.battery = BATTERY_UNKNOWN;
               s.reset_attempts = 0;
               s.enter(CaseState::ResetDelay);
            } else if s.abort {
               s.enter(CaseState::Alert);
            } else if s.give_up {
               self.end_reset(earbud);
            }
         },
         CaseState::ResetDelay => {
            if s.state_time > RESET_DELAY_TICKS && self.ccp.tx_status_request(earbud) {
               s.enter(CaseState::Resetting);
            }
         },
         CaseState::Resetting => {
            if s.valid {
               self.end_reset(earbud);
            } else if s.give_up {
               s.reset_attempts += 1;
               if s.reset_attempts >= RESET_POLLS {
                  self.end_reset(earbud);
               } else {
                  s.enter(CaseState::ResetDelay);
               }
            } else if s.abort {
               s.enter(CaseState::ResetDelay);
            }
         },
         CaseState::SentStatusRequest => {
            if s.valid {
               self.end_status(earbud, true);
            } else if s.give_up {
               self.end_status(earbud, false);
            } else if s.abort {
               s.enter(CaseState::Alert);
            }
         },
         CaseState::SentXstatusRequest => {
            if s.valid {
               self.end_xstatus(earbud, true);
            } else if s.give_up {
               self.end_xstatus(earbud, false);
            } else if s.abort {
               s.enter(CaseState::Alert);
            }
         },
         CaseState::StatusBroadcast => {
            if self.battery.read_done() {
               let percent = self.battery.percent();
               let [left, right] = &self.slots;
               let status = StatusBroadcast {
                  lid_open: self.lid_now,
                  charger_connected: self.chg_now,
                  charging: self.hw.charging(),
                  charge_rate: percent < LOW_BATTERY_THRESHOLD,
                  battery_case: percent,
                  battery_left: left.info.battery,
                  battery_right: right.info.battery,
                  charging_left: left.info.charging,
                  charging_right: right.info.charging,
               };
               if self.ccp.tx_status(&status) {
                  self.slots[i].enter(CaseState::Alert);
               }
            }
         },
         CaseState::SentLoopback => {
            if s.valid {
               s.loopback.count = s.loopback.count.saturating_add(1);
               if s.loopback.count >= s.loopback.iterations {
                  self.end_loopback(earbud, true);
               } else {
                  s.valid = false;
                  if !self.tx_loopback(earbud) {
                     self.slots[i].enter(CaseState::Alert);
                  }
               }
            } else if s.give_up {
               if s.loopback.iterations > 0 {
                  s.enter(CaseState::Alert);
               } else {
                  self.end_loopback(earbud, false);
               }
            } else if s.abort {
               s.enter(CaseState::Alert);
            }
         },
         CaseState::SentShippingMode => {
            if s.valid {
               if s.reporting {
                  self.report(format!("Shipping mode ({})", earbud.letter()));
               }
               self.slots[i].enter(CaseState::ShippingDone);
            } else if s.give_up {
               s.enter(CaseState::ShippingDone);
            } else if s.abort {
               s.enter(CaseState::Alert);
            }
         },
      }
   }

   /// Starts the most urgent piece of queued work.
   fn alert(&mut self, earbud: Earbud) {
      let s = &mut self.slots[earbud.index()];
      if s.ship_wanted {
         if self.ccp.tx_shipping_mode(earbud) {
            s.valid = false;
            s.enter(CaseState::SentShippingMode);
         }
      } else if s.status_wanted {
         s.valid = false;
         s.info.battery = BATTERY_UNKNOWN;
         if self.ccp.tx_status_request(earbud) {
            s.enter(CaseState::SentStatusRequest);
         }
      } else if s.xstatus_wanted {
         s.valid = false;
         if self.ccp.tx_xstatus_request(earbud, s.info_type) {
            s.enter(CaseState::SentXstatusRequest);
         }
      } else if s.reset_wanted {
         if self.ccp.tx_reset(earbud, true) {
            s.enter(CaseState::SentReset);
         }
      } else if s.loopback_wanted {
         s.valid = false;
         if self.tx_loopback(earbud) {
            self.slots[earbud.index()].enter(CaseState::SentLoopback);
         }
      } else {
         s.enter(CaseState::Idle);
      }
   }

   fn tx_loopback(&mut self, earbud: Earbud) -> bool {
      let max = self.ccp.max_payload();
      let lb = &mut self.slots[earbud.index()].loopback;
      if lb.generated {
         // The first message of a run restarts the pattern.
         if lb.count == 0 {
            lb.rng = None;
         }
         let rng = lb.rng.get_or_insert_with(|| StdRng::seed_from_u64(LOOPBACK_SEED));
         rng.fill_bytes(&mut lb.data[..max]);
      }
      self.ccp.tx_loopback(earbud, lb.sent())
   }

   fn all_charged(&self) -> bool {
      self.slots.iter().all(|s| {
         s.present && s.info.battery != BATTERY_UNKNOWN && s.info.battery >= HIGH_BATTERY_THRESHOLD
      })
   }

   fn end_status(&mut self, earbud: Earbud, success: bool) {
      let i = earbud.index();
      if !success && self.slots[i].reporting {
         self.report(format!("EBSTATUS ({}): Failed", earbud.letter()));
      }
      let s = &mut self.slots[i];
      s.status_wanted = false;
      s.reporting = false;

      let [left, right] = &self.slots;
      let next = if left.status_wanted || right.status_wanted {
         CaseState::Alert
      } else if !left.valid && !right.valid {
         if !left.present && !right.present {
            debug!("Case empty");
         }
         CaseState::Alert
      } else {
         CaseState::StatusBroadcast
      };
      self.slots[i].enter(next);

      if !self.lid_now && self.all_charged() {
         self.status_countdown = STATUS_TIME_CHARGED;
      }
   }

   fn end_xstatus(&mut self, earbud: Earbud, success: bool) {
      let i = earbud.index();
      if !success && self.slots[i].reporting {
         self.report(format!("EBSTATUS ({}): Failed", earbud.letter()));
      }
      let s = &mut self.slots[i];
      s.xstatus_wanted = false;
      s.reporting = false;
      s.enter(CaseState::Alert);
   }

   fn end_loopback(&mut self, earbud: Earbud, success: bool) {
      let i = earbud.index();
      let letter = earbud.letter();
      if !success {
         self.report(format!("LOOPBACK ({letter}): Failed"));
      }

      let lb = &self.slots[i].loopback;
      if lb.iterations > 0 {
         // Bytes per second, counting both directions.
         let elapsed_ms = (self.ticks - lb.start_tick).max(1) * self.config.tick_ms.max(1);
         let bytes = u64::from(lb.iterations) * lb.len as u64 * 2;
         let rate = bytes * 1000 / elapsed_ms;
         let nacks = lb.nacks;
         self.report(format!("LOOPBACK ({letter}): Data rate = {rate}, NACKs = {nacks}"));
      }

      let s = &mut self.slots[i];
      s.enter(CaseState::Alert);
      s.reporting = false;
      s.loopback_wanted = false;
   }

   fn end_reset(&mut self, earbud: Earbud) {
      let s = &mut self.slots[earbud.index()];
      s.reset_wanted = false;
      s.enter(CaseState::Alert);
   }

   fn enter_shipping_mode(&mut self) {
      info!("Entering shipping mode");
      self.config.shipping_mode = true;
      self.config_dirty = true;
      self.in_shipping_mode = true;
      self.comms_enabled = false;
      for slot in &mut self.slots {
         slot.enter(CaseState::Idle);
      }
      self.status_timer = false;
      self.events.emit(CaseEvent::ShippingMode(true));
   }

   /// Claims both earbuds for a command that reports on both.
   fn claim_both(&mut self) -> bool {
      if self.slots.iter().any(|s| s.reporting) {
         return false;
      }
      for slot in &mut self.slots {
         slot.reporting = true;
      }
      true
   }

   /// `case`: earbud presence and battery, lid and status timer.
   pub fn cmd_info(&self) -> Reply {
      if !self.comms_enabled {
         return Reply::error();
      }
      let mut lines = vec!["Earbud  Present  Battery".to_owned()];
      for earbud in Earbud::BOTH {
         let slot = &self.slots[earbud.index()];
         lines.push(format!(
            "{:<6}  {:<7}  {}",
            earbud.letter(),
            if slot.present { "Yes" } else { "No" },
            slot.info.battery
         ));
      }
      lines.push(String::new());
      if self.lid_now {
         lines.push(format!("Lid : Open ({}s)", self.lid_open_time));
      } else {
         lines.push("Lid : Closed".to_owned());
      }
      lines.push(format!("Next status in {} seconds", self.status_countdown));
      Reply::ok_with(lines)
   }

   /// `case status`: status exchange with a battery indication.
   pub fn cmd_status(&mut self) -> Reply {
      if !self.comms_enabled {
         return Reply::error();
      }
      self.start_status_sequence(true);
      Reply::ok()
   }

   /// `AT+EBSTATUS`: plain status from both earbuds, or one kind of extended
   /// status from one of them. Results are reported as they come in.
   pub fn cmd_ebstatus(&mut self, target: Option<(Earbud, u8)>) -> Reply {
      if !self.comms_enabled {
         return Reply::error();
      }
      match target {
         Some((earbud, info_type)) => {
            let s = &mut self.slots[earbud.index()];
            if s.reporting {
               return Reply::error();
            }
            s.reporting = true;
            s.xstatus_wanted = true;
            s.info_type = info_type;
            s.wake();
         },
         None => {
            if !self.claim_both() {
               return Reply::error();
            }
            self.start_status_sequence(false);
         },
      }
      Reply::ok()
   }

   /// `case reset <e>`: factory reset of one earbud.
   pub fn cmd_reset(&mut self, earbud: Earbud) -> Reply {
      if !self.comms_enabled || self.dfu_planned {
         return Reply::error();
      }
      let s = &mut self.slots[earbud.index()];
      s.reset_wanted = true;
      s.wake();
      Reply::ok()
   }

   /// `case loopback` / `AT+LOOPBACK`.
   pub fn cmd_loopback(&mut self, earbud: Earbud, req: LoopbackRequest) -> Reply {
      if !self.comms_enabled {
         return Reply::error();
      }
      let max = self.ccp.max_payload();
      let ticks = self.ticks;
      let s = &mut self.slots[earbud.index()];
      if s.reporting {
         return Reply::error();
      }

      let lb = &mut s.loopback;
      lb.iterations = req.iterations;
      lb.len = req.len.unwrap_or(max).min(max);
      lb.generated = true;
      if let Some(pattern) = req.data.filter(|d| !d.is_empty()) {
         lb.generated = false;
         if pattern.len() < lb.len {
            for (dst, src) in lb.data[..lb.len].iter_mut().zip(pattern.iter().cycle()) {
               *dst = *src;
            }
         } else {
            lb.len = pattern.len().min(max);
            lb.data[..lb.len].copy_from_slice(&pattern[..lb.len]);
         }
      }
      lb.start_tick = ticks;
      lb.nacks = 0;
      lb.count = 0;

      s.loopback_wanted = true;
      s.reporting = true;
      s.wake();
      Reply::ok()
   }

   /// `AT+SHIP`: puts both earbuds and then the case into shipping mode.
   /// Only allowed with the lid closed.
   pub fn cmd_ship(&mut self) -> Reply {
      if self.lid_now {
         return Reply::error();
      }
      if !self.comms_enabled {
         // Nobody to tell; the case goes into shipping mode on its own.
         self.enter_shipping_mode();
         return Reply::ok();
      }
      if !self.slots.iter().all(|s| s.present) || !self.claim_both() {
         return Reply::error();
      }
      for slot in &mut self.slots {
         slot.ship_wanted = true;
         slot.wake();
      }
      Reply::wait()
   }

   /// `AT+LID?`
   pub fn cmd_lid(&self) -> Reply {
      Reply::ok_with(vec![if self.hw.lid_open() { "1" } else { "0" }.to_owned()])
   }

   /// `AT+BATTERY?`: reads the case battery and reports `mV,%` when done.
   pub fn cmd_battery(&mut self) -> Reply {
      if self.battery_cmd {
         return Reply::error();
      }
      self.battery.request(false);
      self.battery_cmd = true;
      Reply::wait()
   }
}
