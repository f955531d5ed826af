//! Charger Case Protocol, case side.
//!
//! Sits on top of the [`WireLink`] and turns raw payloads into case-channel
//! messages. Requests that expect an answer open a transaction: once the
//! earbud has acknowledged the request the case keeps polling it until the
//! answer arrives, retransmits once if the polls run out, and gives up
//! after that.

use std::{collections::VecDeque, fmt};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::wire::{ChargerComms, Device, Earbud, Packet, Scheme, WireEvent, WireLink};

/// Largest message including the header byte, plus one spare byte.
pub const MAX_MSG_SIZE: usize = 20;
/// Polls sent after an acknowledgement before falling back to a retransmit.
pub const MAX_POLLS: u8 = 5;
/// Retransmissions of the original request once the polls ran out.
pub const RETRY_COUNT: u8 = 1;
/// Retransmit attempts blocked by a busy link before giving up.
pub const ALLOWED_FAILED_RETRIES: u8 = 30;

const HDR_MASK_CHAN: u8 = 0x70;
const HDR_SHIFT_CHAN: u8 = 4;
const HDR_MASK_MSG: u8 = 0x0F;

const STATUS_CHG_RATE: u8 = 0x04;
const STATUS_CC: u8 = 0x02;
const STATUS_LID: u8 = 0x01;

const BATTERY_CHARGING: u8 = 0x80;
const BATTERY_LEVEL: u8 = 0x7F;

const RESET_FACTORY: u8 = 0x01;

const EARBUD_STATUS_INFO: u8 = 0x80;
const EARBUD_STATUS_INFO_TYPE: u8 = 0x7F;
const EARBUD_STATUS_CHG_RATE: u8 = 0x02;
const EARBUD_STATUS_PP: u8 = 0x01;

const SHIP_RSP_SM: u8 = 0x01;

/// Battery level reported when it has not been read yet.
pub const BATTERY_UNKNOWN: u8 = 0xFF;

/// Ticks between polls for a pending answer.
pub const fn poll_interval(scheme: Scheme) -> u8 {
   match scheme {
      Scheme::A => 25,
      Scheme::B => 2,
   }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum Channel {
   CaseInfo = 0,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum Message {
   Status = 0,
   EarbudStatus = 1,
   Reset = 2,
   StatusReq = 3,
   Loopback = 4,
   EarbudCmd = 5,
   EarbudRsp = 6,
}

/// Extended status information types.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
)]
pub enum InfoType {
   BtAddress = 0,
}

/// Commands the case can issue to an earbud.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum EarbudCommand {
   PeerPair = 0,
   ShippingMode = 2,
}

/// Builds a message header byte.
pub const fn header(chan: Channel, msg: Message) -> u8 {
   ((chan as u8) << HDR_SHIFT_CHAN) & HDR_MASK_CHAN | (msg as u8 & HDR_MASK_MSG)
}

pub const fn header_channel(hdr: u8) -> u8 {
   (hdr & HDR_MASK_CHAN) >> HDR_SHIFT_CHAN
}

pub const fn header_message(hdr: u8) -> u8 {
   hdr & HDR_MASK_MSG
}

/// Battery byte: percentage in bits 6..0, charging flag in bit 7.
pub const fn battery_byte(level: u8, charging: bool) -> u8 {
   (level & BATTERY_LEVEL) | if charging { BATTERY_CHARGING } else { 0 }
}

/// Bluetooth device address split the way the earbuds report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BtAddress {
   pub nap: u16,
   pub uap: u8,
   pub lap: u32,
}

impl BtAddress {
   pub const fn new(nap: u16, uap: u8, lap: u32) -> Self {
      Self {
         nap,
         uap,
         lap: lap & 0x00FF_FFFF,
      }
   }

   /// Most significant byte first, as BlueZ prints it.
   pub const fn to_bytes(self) -> [u8; 6] {
      let [nap_hi, nap_lo] = self.nap.to_be_bytes();
      let [_, lap_2, lap_1, lap_0] = self.lap.to_be_bytes();
      [nap_hi, nap_lo, self.uap, lap_2, lap_1, lap_0]
   }

   pub const fn from_bytes(b: [u8; 6]) -> Self {
      Self::new(
         u16::from_be_bytes([b[0], b[1]]),
         b[2],
         u32::from_be_bytes([0, b[3], b[4], b[5]]),
      )
   }

   /// Console form used in `EBSTATUS` reports: `NNNN,UU,LLLLLL`.
   pub fn to_report(self) -> String {
      format!("{:04X},{:02X},{:06X}", self.nap, self.uap, self.lap)
   }
}

impl From<BtAddress> for bluer::Address {
   fn from(addr: BtAddress) -> Self {
      bluer::Address::new(addr.to_bytes())
   }
}

impl From<bluer::Address> for BtAddress {
   fn from(addr: bluer::Address) -> Self {
      Self::from_bytes(addr.0)
   }
}

impl fmt::Display for BtAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Display::fmt(&bluer::Address::from(*self), f)
   }
}

/// Full status broadcast contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBroadcast {
   pub lid_open: bool,
   pub charger_connected: bool,
   pub charging: bool,
   pub charge_rate: bool,
   pub battery_case: u8,
   pub battery_left: u8,
   pub battery_right: u8,
   pub charging_left: bool,
   pub charging_right: bool,
}

/// Notifications raised towards the case application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CcpEvent {
   EarbudStatus {
      earbud: Earbud,
      peer_paired: bool,
      charge_rate: bool,
      battery: u8,
      charging: bool,
   },
   BtAddress {
      earbud: Earbud,
      address: BtAddress,
   },
   Loopback {
      earbud: Earbud,
      data: Packet,
   },
   Shipping {
      earbud: Earbud,
      accepted: bool,
   },
   Ack(Earbud),
   Nack(Earbud),
   GiveUp(Earbud),
   NoResponse(Earbud),
   Abort(Earbud),
   BroadcastFinished,
}

#[derive(Debug, Default)]
struct Transaction {
   busy: bool,
   poll_timeout: u8,
   poll_count: u8,
   retries: u8,
   failed_retries: u8,
   tx_buf: heapless::Vec<u8, MAX_MSG_SIZE>,
}

/// Case-side message layer. Owns the wire link and the transport below it.
#[derive(Debug)]
pub struct Ccp<C> {
   comms: C,
   wire: WireLink,
   poll_interval: u8,
   transactions: [Transaction; 2],
   events: VecDeque<CcpEvent>,
}

impl<C: ChargerComms> Ccp<C> {
   pub fn new(scheme: Scheme, comms: C) -> Self {
      Self {
         comms,
         wire: WireLink::new(scheme),
         poll_interval: poll_interval(scheme),
         transactions: Default::default(),
         events: VecDeque::new(),
      }
   }

   pub const fn comms(&self) -> &C {
      &self.comms
   }

   pub const fn comms_mut(&mut self) -> &mut C {
      &mut self.comms
   }

   pub const fn scheme(&self) -> Scheme {
      self.wire.scheme()
   }

   /// Largest payload that fits after the message header.
   pub fn max_payload(&self) -> usize {
      (MAX_MSG_SIZE - 2).min(self.wire.max_payload() - 1)
   }

   #[cfg_attr(not(test), allow(dead_code))]
   pub fn is_busy(&self, earbud: Earbud) -> bool {
      self.transactions[earbud.index()].busy
   }

   pub fn poll_event(&mut self) -> Option<CcpEvent> {
      self.events.pop_front()
   }

   /// Broadcasts lid, charger and charge-rate flags.
   pub fn tx_short_status(&mut self, lid: bool, charger: bool, charge_rate: bool) -> bool {
      let status = status_byte(lid, charger, charge_rate);
      self.send(Message::Status, Device::Broadcast, &[status], false)
   }

   /// Broadcasts the flags together with all three battery levels.
   pub fn tx_status(&mut self, s: &StatusBroadcast) -> bool {
      let buf = [
         status_byte(s.lid_open, s.charger_connected, s.charge_rate),
         battery_byte(s.battery_case, s.charging),
         battery_byte(s.battery_left, s.charging_left),
         battery_byte(s.battery_right, s.charging_right),
      ];
      self.send(Message::Status, Device::Broadcast, &buf, false)
   }

   pub fn tx_shipping_mode(&mut self, earbud: Earbud) -> bool {
      self.send(Message::EarbudCmd, earbud.device(), &[EarbudCommand::ShippingMode as u8], true)
   }

   pub fn tx_status_request(&mut self, earbud: Earbud) -> bool {
      self.send(Message::StatusReq, earbud.device(), &[], true)
   }

   pub fn tx_xstatus_request(&mut self, earbud: Earbud, info_type: u8) -> bool {
      self.send(Message::StatusReq, earbud.device(), &[info_type], true)
   }

   pub fn tx_loopback(&mut self, earbud: Earbud, data: &[u8]) -> bool {
      self.send(Message::Loopback, earbud.device(), data, true)
   }

   /// Reset is fire-and-forget; the earbud only acknowledges it.
   pub fn tx_reset(&mut self, earbud: Earbud, factory: bool) -> bool {
      let buf = if factory { RESET_FACTORY } else { 0 };
      self.send(Message::Reset, earbud.device(), &[buf], false)
   }

   /// Pulls received frames from the transport, runs the wire link and
   /// manages outstanding transactions. Call once per tick.
   pub fn periodic(&mut self) {
      while let Some((earbud, frame)) = self.comms.receive() {
         self.wire.rx(earbud, &frame);
      }
      self.wire.periodic(&mut self.comms);
      while let Some(event) = self.wire.poll_event() {
         self.on_wire_event(event);
      }
      for earbud in Earbud::BOTH {
         self.manage_transaction(earbud);
      }
   }

   fn send(&mut self, msg: Message, dest: Device, data: &[u8], need_answer: bool) -> bool {
      if data.len() + 2 > MAX_MSG_SIZE {
         return false;
      }
      let mut buf = heapless::Vec::<u8, MAX_MSG_SIZE>::new();
      if buf.push(header(Channel::CaseInfo, msg)).is_err() || buf.extend_from_slice(data).is_err() {
         return false;
      }

      let Some(earbud) = dest.earbud() else {
         if dest != Device::Broadcast {
            return false;
         }
         let mut aborted = [false; 2];
         for earbud in Earbud::BOTH {
            if self.transactions[earbud.index()].busy {
               self.abort(earbud);
               aborted[earbud.index()] = true;
            }
         }
         let sent = self.wire.tx(&mut self.comms, dest, &buf);
         // The link reports its own aborts for the same transfers.
         while let Some(event) = self.wire.poll_event() {
            match event {
               WireEvent::Abort(earbud) if aborted[earbud.index()] => {},
               event => self.on_wire_event(event),
            }
         }
         return sent;
      };

      if self.transactions[earbud.index()].busy || self.transactions[earbud.other().index()].busy {
         return false;
      }
      if !self.wire.tx(&mut self.comms, dest, &buf) {
         return false;
      }

      let t = &mut self.transactions[earbud.index()];
      t.tx_buf = buf;
      if need_answer {
         t.busy = true;
         t.retries = 0;
         t.failed_retries = 0;
         t.poll_count = 0;
         t.poll_timeout = 0;
      }
      true
   }

   fn manage_transaction(&mut self, earbud: Earbud) {
      let other_busy = self.transactions[earbud.other().index()].busy;
      let t = &mut self.transactions[earbud.index()];
      if !t.busy || t.poll_timeout == 0 {
         return;
      }
      t.poll_timeout -= 1;
      if t.poll_timeout > 0 {
         return;
      }

      if t.poll_count < MAX_POLLS {
         if self.wire.tx(&mut self.comms, earbud.device(), &[]) {
            t.poll_timeout = self.poll_interval;
            t.poll_count += 1;
         } else {
            // Link busy: try again next tick without counting it.
            t.poll_timeout += 1;
         }
      } else if t.retries < RETRY_COUNT {
         if !other_busy && self.wire.tx(&mut self.comms, earbud.device(), &t.tx_buf) {
            t.retries += 1;
            t.poll_count = 0;
            t.poll_timeout = 0;
         } else {
            t.failed_retries += 1;
            if t.failed_retries > ALLOWED_FAILED_RETRIES {
               self.give_up(earbud);
            } else {
               t.poll_timeout = 1;
            }
         }
      } else {
         self.give_up(earbud);
      }
   }

   fn on_wire_event(&mut self, event: WireEvent) {
      match event {
         WireEvent::Rx {
            earbud,
            data,
            final_piece,
         } => self.rx(earbud, &data, final_piece),
         WireEvent::Ack(earbud) => {
            let t = &mut self.transactions[earbud.index()];
            if t.busy {
               // Only an empty ack so far, keep polling for the answer.
               t.poll_timeout = self.poll_interval;
            } else {
               self.events.push_back(CcpEvent::Ack(earbud));
            }
         },
         WireEvent::Nack(earbud) => self.events.push_back(CcpEvent::Nack(earbud)),
         WireEvent::GiveUp(earbud) => self.give_up(earbud),
         WireEvent::NoResponse(earbud) => {
            self.transactions[earbud.index()].busy = false;
            self.events.push_back(CcpEvent::NoResponse(earbud));
         },
         WireEvent::Abort(earbud) => self.abort(earbud),
         WireEvent::BroadcastFinished => self.events.push_back(CcpEvent::BroadcastFinished),
      }
   }

   fn rx(&mut self, earbud: Earbud, data: &[u8], final_piece: bool) {
      debug!("WIRE->CCP {}", hex::encode(data));
      if !final_piece {
         return;
      }
      self.transactions[earbud.index()].busy = false;

      let Some((&hdr, body)) = data.split_first() else {
         return;
      };
      if Channel::from_repr(header_channel(hdr)) != Some(Channel::CaseInfo) {
         debug!("Ignoring message on channel {}", header_channel(hdr));
         return;
      }

      let event = match Message::from_repr(header_message(hdr)) {
         Some(Message::EarbudStatus) => match body {
            [flags, rest @ ..] if flags & EARBUD_STATUS_INFO != 0 => {
               match InfoType::from_repr(flags & EARBUD_STATUS_INFO_TYPE) {
                  Some(InfoType::BtAddress) => match rest {
                     [l0, l1, l2, uap, n0, n1, ..] => Some(CcpEvent::BtAddress {
                        earbud,
                        address: BtAddress::new(
                           u16::from_le_bytes([*n0, *n1]),
                           *uap,
                           u32::from_le_bytes([*l0, *l1, *l2, 0]),
                        ),
                     }),
                     _ => None,
                  },
                  None => None,
               }
            },
            [flags, battery, ..] => Some(CcpEvent::EarbudStatus {
               earbud,
               peer_paired: flags & EARBUD_STATUS_PP != 0,
               charge_rate: flags & EARBUD_STATUS_CHG_RATE != 0,
               battery: battery & BATTERY_LEVEL,
               charging: battery & BATTERY_CHARGING != 0,
            }),
            _ => {
               warn!("Truncated earbud status from {earbud}");
               None
            },
         },
         Some(Message::Loopback) => Some(CcpEvent::Loopback {
            earbud,
            data: Packet::from_slice(body),
         }),
         Some(Message::EarbudRsp) => match body {
            [cmd, rsp, ..] if EarbudCommand::from_repr(*cmd) == Some(EarbudCommand::ShippingMode) => {
               Some(CcpEvent::Shipping {
                  earbud,
                  accepted: rsp & SHIP_RSP_SM != 0,
               })
            },
            _ => None,
         },
         _ => {
            debug!("Ignoring message {:#04x} from {earbud}", hdr);
            None
         },
      };
      if let Some(event) = event {
         self.events.push_back(event);
      }
   }

   fn give_up(&mut self, earbud: Earbud) {
      self.transactions[earbud.index()].busy = false;
      self.events.push_back(CcpEvent::GiveUp(earbud));
   }

   fn abort(&mut self, earbud: Earbud) {
      self.transactions[earbud.index()].busy = false;
      self.events.push_back(CcpEvent::Abort(earbud));
   }
}

const fn status_byte(lid: bool, charger: bool, charge_rate: bool) -> u8 {
   let mut b = 0;
   if charge_rate {
      b |= STATUS_CHG_RATE;
   }
   if charger {
      b |= STATUS_CC;
   }
   if lid {
      b |= STATUS_LID;
   }
   b
}
