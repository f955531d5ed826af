//! Simulated earbud pair.
//!
//! Stands in for the charger contacts so the daemon runs without hardware.
//! Each earbud runs the link responder in front of a full earbud-side stack:
//! requests are decoded by the stack, and its answer is handed out on a
//! later poll. NACKs and corrupted replies can be injected with 16-bit
//! patterns, one bit per unicast frame.

use std::collections::VecDeque;

use log::{debug, info};

use crate::{
   case::CaseHardware,
   ccp::{BtAddress, Message},
   earbud::{
      ChannelId, EarbudPlatform, EarbudStack, Mode, ProtocolConfig, Transport, TransportKind, TxStatus,
      protocol::header,
   },
   wire::{ChargerComms, Device, Earbud, Packet, Scheme, frame, frame::Header},
};

/// Polls before an earbud status answer is released.
pub const STATUS_RESPONSE_POLLS: u8 = 3;
/// Polls before any other answer is released.
pub const RESPONSE_POLLS: u8 = 1;

/// Cell voltage at which the simulated case counts as full.
const FULL_MV: u16 = 4160;

/// Sensors of the simulated case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCase {
   pub lid: bool,
   pub charger: bool,
   pub battery_mv: u16,
}

impl SimCase {
   pub const fn new(battery_mv: u16) -> Self {
      Self {
         lid: false,
         charger: false,
         battery_mv,
      }
   }
}

impl CaseHardware for SimCase {
   fn lid_open(&self) -> bool {
      self.lid
   }

   fn charger_connected(&self) -> bool {
      self.charger
   }

   fn charging(&self) -> bool {
      self.charger && self.battery_mv < FULL_MV
   }

   fn battery_mv(&self) -> u16 {
      self.battery_mv
   }
}

/// Rest of a simulated earbud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimPlatform {
   left: bool,
   soc: u8,
   in_case: bool,
   paired: bool,
   address: BtAddress,
}

impl SimPlatform {
   fn new(earbud: Earbud) -> Self {
      let (soc, lap) = match earbud {
         Earbud::Left => (90, 0x00EB21),
         Earbud::Right => (85, 0x00EB22),
      };
      Self {
         left: earbud == Earbud::Left,
         soc,
         in_case: true,
         paired: true,
         address: BtAddress::new(0x0002, 0x5B, lap),
      }
   }
}

impl EarbudPlatform for SimPlatform {
   fn is_left(&self) -> bool {
      self.left
   }

   fn state_of_charge(&self) -> u8 {
      self.soc
   }

   fn in_case(&self) -> bool {
      self.in_case
   }

   fn paired_with_peer(&self) -> bool {
      self.paired
   }

   fn programmed_address(&self) -> Option<BtAddress> {
      Some(self.address)
   }

   /// The case contacts are the charger.
   fn charger_connected(&self) -> bool {
      self.in_case
   }

   fn peer_pair_to(&mut self, peer: BtAddress) -> bool {
      if peer == self.address {
         return false;
      }
      self.paired = true;
      true
   }

   fn factory_reset(&mut self) {
      info!("Simulated {} earbud factory reset", if self.left { "left" } else { "right" });
      self.paired = false;
   }

   fn reboot(&mut self) {
      info!("Simulated {} earbud reboot", if self.left { "left" } else { "right" });
   }
}

/// Messages the earbud stack wants to send to the case.
#[derive(Debug, Default)]
pub struct SimTransport {
   queue: VecDeque<Packet>,
}

impl Transport for SimTransport {
   fn transmit(&mut self, dest: Device, cid: Option<ChannelId>, mid: u8, data: &[u8]) -> bool {
      let Some(cid) = cid else {
         return false;
      };
      if dest != Device::Case {
         debug!("Simulated earbud cannot send to {dest}");
         return false;
      }
      let mut msg = Packet::new();
      msg.push(header(cid as u8, mid));
      msg.extend_from_slice(data);
      self.queue.push_back(msg);
      true
   }
}

type SimStack = EarbudStack<SimPlatform, SimTransport>;

/// One simulated earbud: link responder plus earbud stack.
#[derive(Debug)]
pub struct SimEarbud {
   earbud: Earbud,
   sn: bool,
   nesn: bool,
   rsp_later: u8,
   pattern_ctr: u8,
   nack_pattern: u16,
   corrupt_pattern: u16,
   response: Option<Packet>,
   present: bool,
   stack: SimStack,
}

impl SimEarbud {
   fn new(earbud: Earbud, kind: TransportKind) -> Self {
      let stack = EarbudStack::new(
         Mode::Earbud,
         kind,
         SimPlatform::new(earbud),
         SimTransport::default(),
         ProtocolConfig::default(),
      );
      Self {
         earbud,
         sn: false,
         nesn: false,
         rsp_later: 0,
         pattern_ctr: 0,
         nack_pattern: 0,
         corrupt_pattern: 0,
         response: None,
         present: true,
         stack,
      }
   }

   pub const fn stack(&self) -> &SimStack {
      &self.stack
   }

   pub const fn present(&self) -> bool {
      self.present
   }

   fn reset_seq(&mut self) {
      self.sn = false;
      self.nesn = false;
   }

   fn pattern_hit(&self, pattern: u16) -> bool {
      pattern & (1 << self.pattern_ctr) != 0
   }

   /// Hands a request to the stack and keeps its answer for later polls.
   fn deliver(&mut self, payload: &[u8]) {
      self.stack.on_receive(Device::Case, payload);
      let queue = &mut self.stack.protocol_mut().transport_mut().queue;
      let answer = queue.pop_back();
      queue.clear();
      if let Some(answer) = answer {
         self.rsp_later = if answer.first() == Some(&(Message::EarbudStatus as u8)) {
            STATUS_RESPONSE_POLLS
         } else {
            RESPONSE_POLLS
         };
         self.response = Some(answer);
      }
   }

   /// Reply to a unicast frame, `None` for silence.
   fn respond(&mut self, header: Header, payload: &[u8]) -> Option<Packet> {
      let mut answer = None;
      if self.pattern_hit(self.nack_pattern) {
         // NESN stays put.
         debug!("Simulated {} earbud NACKs", self.earbud);
      } else {
         if header.sn == self.nesn {
            self.nesn = !self.nesn;
            if !payload.is_empty() {
               self.deliver(payload);
            }
         }
         if header.nesn != self.sn {
            self.sn = !self.sn;
         }
         if payload.is_empty() {
            if self.rsp_later == 0 {
               self.advance_pattern();
               return None;
            }
            self.rsp_later -= 1;
            if self.rsp_later == 0 {
               answer = self.response.take();
            }
         }
      }
      self.advance_pattern();
      if let Some(answer) = &answer
         && let Some(&hdr) = answer.first()
      {
         self.stack.on_tx_status(Device::Case, Some(hdr), TxStatus::Success);
      }
      Some(answer.unwrap_or_default())
   }

   fn advance_pattern(&mut self) {
      self.pattern_ctr = (self.pattern_ctr + 1) & 0x0F;
   }

   pub fn describe(&self) -> String {
      format!(
         "{}  present {}  nack {:04X}  corrupt {:04X}  lid {}",
         self.earbud.letter(),
         u8::from(self.present),
         self.nack_pattern,
         self.corrupt_pattern,
         self.stack.with_case().lid(),
      )
   }
}

/// Charger contacts with two simulated earbuds behind them.
#[derive(Debug)]
pub struct SimBus {
   scheme: Scheme,
   earbuds: [SimEarbud; 2],
   inbound: VecDeque<(Earbud, Packet)>,
   last_broadcast: Option<Packet>,
}

impl SimBus {
   pub fn new(scheme: Scheme) -> Self {
      let kind = match scheme {
         Scheme::A => TransportKind::SchemeA,
         Scheme::B => TransportKind::SchemeB,
      };
      Self {
         scheme,
         earbuds: Earbud::BOTH.map(|e| SimEarbud::new(e, kind)),
         inbound: VecDeque::new(),
         last_broadcast: None,
      }
   }

   pub fn earbud(&self, earbud: Earbud) -> &SimEarbud {
      &self.earbuds[earbud.index()]
   }

   pub fn set_nack_pattern(&mut self, earbud: Earbud, pattern: u16) {
      self.earbuds[earbud.index()].nack_pattern = pattern;
   }

   pub fn set_corrupt_pattern(&mut self, earbud: Earbud, pattern: u16) {
      self.earbuds[earbud.index()].corrupt_pattern = pattern;
   }

   /// Puts an earbud in the case or takes it out.
   pub fn set_present(&mut self, earbud: Earbud, present: bool) {
      let eb = &mut self.earbuds[earbud.index()];
      if eb.present == present {
         return;
      }
      eb.present = present;
      eb.stack.platform_mut().in_case = present;
      if present {
         eb.reset_seq();
      } else {
         eb.response = None;
         eb.rsp_later = 0;
         eb.stack.with_case_mut().left_case();
         eb.stack.with_case_mut().charger_detached();
      }
      info!("Simulated {earbud} earbud {}", if present { "inserted" } else { "removed" });
   }

   pub fn describe(&self) -> Vec<String> {
      self.earbuds.iter().map(SimEarbud::describe).collect()
   }

   fn broadcast(&mut self, payload: &[u8]) {
      for eb in &mut self.earbuds {
         eb.reset_seq();
      }
      if payload.is_empty() || self.last_broadcast.as_deref() == Some(payload) {
         return;
      }
      self.last_broadcast = Some(Packet::from_slice(payload));
      for eb in self.earbuds.iter_mut().filter(|eb| eb.present) {
         eb.deliver(payload);
      }
   }
}

impl ChargerComms for SimBus {
   fn is_active(&self) -> bool {
      false
   }

   fn transmit(&mut self, dest: Device, bytes: &[u8]) {
      debug!("Earbud rx {}", hex::encode(bytes));
      let (header, payload) = match frame::decode(self.scheme, bytes) {
         Ok(decoded) => decoded,
         Err(e) => {
            debug!("Simulated earbuds dropped frame: {e}");
            return;
         },
      };
      let Some(earbud) = dest.earbud() else {
         self.broadcast(payload);
         return;
      };
      let eb = &mut self.earbuds[earbud.index()];
      if !eb.present {
         return;
      }
      let corrupt = eb.pattern_hit(eb.corrupt_pattern);
      let Some(answer) = eb.respond(header, payload) else {
         return;
      };
      let reply = Header::new(eb.sn, eb.nesn, Device::Case, earbud.device());
      match frame::encode(self.scheme, reply, &answer) {
         Ok(mut reply) => {
            if corrupt {
               debug!("Simulated {earbud} earbud corrupts its reply");
               reply[0] ^= 0xFF;
            }
            debug!("Earbud tx {}", hex::encode(&reply));
            self.inbound.push_back((earbud, reply));
         },
         Err(e) => debug!("Simulated {earbud} earbud cannot answer: {e}"),
      }
   }

   fn receive(&mut self) -> Option<(Earbud, Packet)> {
      self.inbound.pop_front()
   }
}
