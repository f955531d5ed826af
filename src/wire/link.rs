//! Case side of the charger-comms link.
//!
//! Each earbud gets an independent stop-and-wait transaction guarded by a
//! 1-bit SN/NESN pair. The case always speaks first; an earbud only answers
//! a frame addressed to it, either with an empty acknowledgement or with the
//! data it has queued. Broadcasts are unacknowledged and are sent
//! [`BROADCAST_REPEATS`] times to make up for it.

use std::{collections::VecDeque, mem};

use log::{debug, info, warn};

use super::{
   Device, Earbud, Packet, Scheme,
   frame::{self, Header},
};

/// Ticks between repeated broadcast frames.
pub const BROADCAST_TIMEOUT: u16 = 3;
/// Number of times every broadcast is put on the wire.
pub const BROADCAST_REPEATS: u8 = 3;
/// Ticks to wait for any reply before giving the earbud up for absent.
pub const NO_RESPONSE_TIMEOUT: u16 = 10;
/// NACKs in a row before the link is reset with an empty broadcast.
pub const MAX_NACKS: u8 = 3;
/// Corrupted replies in a row before the transaction is abandoned.
pub const MAX_CORRUPT: u8 = 3;

/// Physical charger-comms transport.
pub trait ChargerComms {
   /// Whether a transfer is currently occupying the contacts.
   fn is_active(&self) -> bool;

   /// Puts a complete frame on the wire.
   fn transmit(&mut self, dest: Device, frame: &[u8]);

   /// Next complete frame received from an earbud, if any.
   fn receive(&mut self) -> Option<(Earbud, Packet)>;
}

/// Outcome notifications raised towards the message layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
   Rx {
      earbud: Earbud,
      data: Packet,
      final_piece: bool,
   },
   Ack(Earbud),
   Nack(Earbud),
   GiveUp(Earbud),
   NoResponse(Earbud),
   Abort(Earbud),
   BroadcastFinished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
   Ack,
   Nack,
   Corrupt,
   Data(Packet),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum LinkState {
   #[default]
   Idle,
   Waiting {
      ticks: u16,
   },
   Replied(Reply),
   /// Retransmission postponed because the transport was busy.
   Retransmit,
   /// Retransmission held back until the link reset broadcast is done.
   AwaitingReset,
}

#[derive(Debug, Default)]
struct Transaction {
   sn: bool,
   nesn: bool,
   state: LinkState,
   payload: Packet,
   nack_count: u8,
   corrupt_count: u8,
   /// An empty acknowledgement for received data went out last.
   data_acked: bool,
}

#[derive(Debug)]
struct Broadcast {
   frame: Packet,
   sent: u8,
   timeout: u16,
   /// Link reset raised by the NACK limit rather than by the message layer.
   internal: bool,
}

/// Per-earbud acknowledged link plus broadcast repetition.
#[derive(Debug)]
pub struct WireLink {
   scheme: Scheme,
   links: [Transaction; 2],
   broadcast: Option<Broadcast>,
   events: VecDeque<WireEvent>,
}

impl WireLink {
   pub fn new(scheme: Scheme) -> Self {
      Self {
         scheme,
         links: Default::default(),
         broadcast: None,
         events: VecDeque::new(),
      }
   }

   pub const fn scheme(&self) -> Scheme {
      self.scheme
   }

   pub const fn max_payload(&self) -> usize {
      frame::max_payload(self.scheme)
   }

   #[cfg_attr(not(test), allow(dead_code))]
   pub const fn is_broadcasting(&self) -> bool {
      self.broadcast.is_some()
   }

   /// SN and NESN the next frame to `earbud` will carry.
   #[cfg(test)]
   pub(crate) fn sequence(&self, earbud: Earbud) -> (bool, bool) {
      let t = &self.links[earbud.index()];
      (t.sn, t.nesn)
   }

   #[cfg_attr(not(test), allow(dead_code))]
   pub fn is_idle(&self, earbud: Earbud) -> bool {
      self.links[earbud.index()].state == LinkState::Idle
   }

   /// Pops the oldest pending notification.
   pub fn poll_event(&mut self) -> Option<WireEvent> {
      self.events.pop_front()
   }

   /// Starts a transfer. An empty unicast payload is a poll.
   ///
   /// Returns `false` when the frame cannot be sent right now; the caller
   /// is expected to retry on a later tick.
   pub fn tx<C: ChargerComms + ?Sized>(&mut self, comms: &mut C, dest: Device, data: &[u8]) -> bool {
      if data.len() > self.max_payload() {
         warn!("Payload of {} bytes too big for {}", data.len(), self.scheme);
         return false;
      }
      if self.broadcast.is_some() || comms.is_active() {
         return false;
      }

      match dest {
         Device::Broadcast => {
            if !data.is_empty() {
               debug!("CCP->WIRE {}", hex::encode(data));
            }
            self.abort_all();
            self.reset_sequence();

            let header = Header::new(false, false, Device::Broadcast, Device::Case);
            let Ok(frame) = frame::encode(self.scheme, header, data) else {
               return false;
            };
            comms.transmit(Device::Broadcast, &frame);
            self.broadcast = Some(Broadcast {
               frame,
               sent: 1,
               timeout: BROADCAST_TIMEOUT,
               internal: false,
            });
            true
         },
         Device::Left | Device::Right => {
            let Some(earbud) = dest.earbud() else {
               return false;
            };
            let t = &mut self.links[earbud.index()];
            if t.state != LinkState::Idle {
               return false;
            }

            let header = Header::new(t.sn, t.nesn, dest, Device::Case);
            let Ok(frame) = frame::encode(self.scheme, header, data) else {
               return false;
            };
            if !data.is_empty() {
               debug!("CCP->WIRE {}", hex::encode(data));
            }
            comms.transmit(dest, &frame);

            t.payload = Packet::from_slice(data);
            t.state = LinkState::Waiting { ticks: 0 };
            t.nack_count = 0;
            t.corrupt_count = 0;
            true
         },
         Device::Case => false,
      }
   }

   /// Feeds a frame received from `earbud`. The outcome is acted upon by the
   /// next [`periodic`](Self::periodic) call.
   pub fn rx(&mut self, earbud: Earbud, bytes: &[u8]) {
      debug!("COMMS->WIRE {}", hex::encode(bytes));

      let t = &mut self.links[earbud.index()];
      let waiting = matches!(t.state, LinkState::Waiting { .. });

      let (header, payload) = match frame::decode(self.scheme, bytes) {
         Ok(decoded) => decoded,
         Err(e) => {
            warn!("Invalid checksum ({}): {e}", earbud.letter());
            if waiting {
               t.state = LinkState::Replied(Reply::Corrupt);
            }
            return;
         },
      };

      // An earbud that never took the acknowledgement for its last data
      // still holds its SN and expects the SN that acknowledgement carried.
      if mem::take(&mut t.data_acked) && header.sn != t.nesn {
         debug!("{earbud} missed the acknowledgement, SN back to {}", header.nesn);
         t.sn = header.nesn;
         if waiting {
            info!("NACK! ({})", earbud.letter());
            t.state = LinkState::Replied(Reply::Nack);
         }
         return;
      }

      if !waiting {
         debug!("Unsolicited frame from {earbud} dropped");
         return;
      }

      let new_data = header.sn == t.nesn;
      if new_data {
         t.nesn = !t.nesn;
      }
      let acked = header.nesn != t.sn;
      if acked {
         t.sn = !t.sn;
      }

      let reply = if !acked {
         info!("NACK! ({})", earbud.letter());
         Reply::Nack
      } else if new_data && !payload.is_empty() {
         Reply::Data(Packet::from_slice(payload))
      } else {
         Reply::Ack
      };
      t.state = LinkState::Replied(reply);
   }

   /// Advances timers and acts on received replies. Call once per tick.
   pub fn periodic<C: ChargerComms + ?Sized>(&mut self, comms: &mut C) {
      if let Some(b) = self.broadcast.as_mut() {
         if b.timeout > 0 {
            b.timeout -= 1;
            return;
         }
         if comms.is_active() {
            return;
         }

         comms.transmit(Device::Broadcast, &b.frame);
         b.sent += 1;
         if b.sent >= BROADCAST_REPEATS {
            let internal = b.internal;
            self.broadcast = None;
            if !internal {
               self.events.push_back(WireEvent::BroadcastFinished);
            }
         } else {
            b.timeout = BROADCAST_TIMEOUT;
         }
         return;
      }

      for earbud in Earbud::BOTH {
         self.service(comms, earbud);
      }
   }

   fn service<C: ChargerComms + ?Sized>(&mut self, comms: &mut C, earbud: Earbud) {
      let i = earbud.index();
      match mem::take(&mut self.links[i].state) {
         LinkState::Idle => {},
         LinkState::Waiting { ticks } => {
            let ticks = ticks + 1;
            if ticks > NO_RESPONSE_TIMEOUT {
               debug!("No response from {earbud}");
               self.events.push_back(WireEvent::NoResponse(earbud));
            } else {
               self.links[i].state = LinkState::Waiting { ticks };
            }
         },
         LinkState::Replied(Reply::Ack) => {
            self.events.push_back(WireEvent::Ack(earbud));
         },
         LinkState::Replied(Reply::Nack) => {
            self.events.push_back(WireEvent::Nack(earbud));
            let t = &mut self.links[i];
            t.nack_count += 1;
            if t.nack_count >= MAX_NACKS {
               t.nack_count = 0;
               t.state = LinkState::AwaitingReset;
               self.start_reset(earbud);
            } else {
               self.retransmit(comms, earbud);
            }
         },
         LinkState::Replied(Reply::Corrupt) => {
            let t = &mut self.links[i];
            t.corrupt_count += 1;
            if t.corrupt_count >= MAX_CORRUPT {
               debug!("Too many corrupt replies from {earbud}");
               self.events.push_back(WireEvent::GiveUp(earbud));
            } else {
               self.retransmit(comms, earbud);
            }
         },
         LinkState::Replied(Reply::Data(data)) => {
            if comms.is_active() {
               self.links[i].state = LinkState::Replied(Reply::Data(data));
               return;
            }
            let t = &mut self.links[i];
            let header = Header::new(t.sn, t.nesn, earbud.device(), Device::Case);
            if let Ok(ack) = frame::encode(self.scheme, header, &[]) {
               comms.transmit(earbud.device(), &ack);
               // The earbud counts the acknowledgement as a frame in sequence.
               t.sn = !t.sn;
               t.data_acked = true;
            }
            self.events.push_back(WireEvent::Rx {
               earbud,
               data,
               final_piece: true,
            });
         },
         LinkState::Retransmit | LinkState::AwaitingReset => self.retransmit(comms, earbud),
      }
   }

   fn retransmit<C: ChargerComms + ?Sized>(&mut self, comms: &mut C, earbud: Earbud) {
      let t = &mut self.links[earbud.index()];
      if comms.is_active() {
         t.state = LinkState::Retransmit;
         return;
      }

      let header = Header::new(t.sn, t.nesn, earbud.device(), Device::Case);
      match frame::encode(self.scheme, header, &t.payload) {
         Ok(frame) => {
            comms.transmit(earbud.device(), &frame);
            t.state = LinkState::Waiting { ticks: 0 };
         },
         Err(e) => {
            warn!("Cannot retransmit to {earbud}: {e}");
            t.state = LinkState::Idle;
            self.events.push_back(WireEvent::GiveUp(earbud));
         },
      }
   }

   /// Queues an empty broadcast that puts both earbuds back to SN=NESN=0.
   /// The first copy goes out on the next tick.
   fn start_reset(&mut self, requester: Earbud) {
      let other = requester.other();
      if self.links[other.index()].state != LinkState::Idle {
         self.links[other.index()].state = LinkState::Idle;
         self.events.push_back(WireEvent::Abort(other));
      }
      self.reset_sequence();

      let header = Header::new(false, false, Device::Broadcast, Device::Case);
      match frame::encode(self.scheme, header, &[]) {
         Ok(frame) => {
            self.broadcast = Some(Broadcast {
               frame,
               sent: 0,
               timeout: 0,
               internal: true,
            });
         },
         Err(e) => warn!("Cannot build link reset: {e}"),
      }
   }

   fn abort_all(&mut self) {
      for earbud in Earbud::BOTH {
         let t = &mut self.links[earbud.index()];
         if t.state != LinkState::Idle {
            t.state = LinkState::Idle;
            self.events.push_back(WireEvent::Abort(earbud));
         }
      }
   }

   fn reset_sequence(&mut self) {
      for t in &mut self.links {
         t.sn = false;
         t.nesn = false;
         t.data_acked = false;
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::wire::mock::MockComms;

   fn events(link: &mut WireLink) -> Vec<WireEvent> {
      std::iter::from_fn(|| link.poll_event()).collect()
   }

   fn ticks(link: &mut WireLink, comms: &mut MockComms, n: usize) {
      for _ in 0..n {
         link.periodic(comms);
      }
   }

   #[test]
   fn test_broadcast_repeats() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::B);

      assert!(link.tx(&mut comms, Device::Broadcast, &[0x00, 0x01]));
      assert_eq!(comms.take_sent(), vec![vec![0x30, 0x04, 0x00, 0x01, 0x9B, 0x37]]);

      ticks(&mut link, &mut comms, BROADCAST_TIMEOUT as usize);
      assert!(comms.take_sent().is_empty());
      link.periodic(&mut comms);
      assert_eq!(comms.take_sent(), vec![vec![0x30, 0x04, 0x00, 0x01, 0x9B, 0x37]]);

      ticks(&mut link, &mut comms, BROADCAST_TIMEOUT as usize);
      comms.active = true;
      link.periodic(&mut comms);
      assert!(comms.take_sent().is_empty());
      assert!(events(&mut link).is_empty());

      comms.active = false;
      link.periodic(&mut comms);
      assert_eq!(comms.take_sent(), vec![vec![0x30, 0x04, 0x00, 0x01, 0x9B, 0x37]]);
      assert_eq!(events(&mut link), vec![WireEvent::BroadcastFinished]);
      assert!(!link.is_broadcasting());
   }

   #[test]
   fn test_status_request_exchange() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::B);

      assert!(link.tx(&mut comms, Device::Left, &[0x03]));
      assert_eq!(comms.take_sent(), vec![vec![0x20, 0x03, 0x03, 0xD0, 0x95]]);
      link.periodic(&mut comms);
      link.rx(Earbud::Left, &[0x40, 0x02, 0xCF, 0x7E]);
      link.periodic(&mut comms);
      assert_eq!(events(&mut link), vec![WireEvent::Ack(Earbud::Left)]);

      assert!(link.tx(&mut comms, Device::Left, &[]));
      assert_eq!(comms.take_sent(), vec![vec![0xE0, 0x02, 0xD2, 0x00]]);
      link.rx(Earbud::Left, &[0x80, 0x05, 0x01, 0x00, 0x21, 0x73, 0x15]);
      link.periodic(&mut comms);
      assert_eq!(comms.take_sent(), vec![vec![0x20, 0x02, 0xC4, 0x54]]);
      assert_eq!(
         events(&mut link),
         vec![WireEvent::Rx {
            earbud: Earbud::Left,
            data: Packet::from_slice(&[0x01, 0x00, 0x21]),
            final_piece: true,
         }]
      );

      assert!(link.tx(&mut comms, Device::Right, &[0x03]));
      assert_eq!(comms.take_sent(), vec![vec![0x10, 0x03, 0x03, 0x15, 0x30]]);
      link.rx(Earbud::Right, &[0x40, 0x02, 0xCF, 0x7E]);
      link.periodic(&mut comms);
      assert_eq!(events(&mut link), vec![WireEvent::Ack(Earbud::Right)]);

      assert!(link.tx(&mut comms, Device::Right, &[]));
      assert_eq!(comms.take_sent(), vec![vec![0xD0, 0x02, 0xD7, 0x95]]);
      link.rx(Earbud::Right, &[0x80, 0x05, 0x01, 0x00, 0x2B, 0xD2, 0x5F]);
      link.periodic(&mut comms);
      assert_eq!(comms.take_sent(), vec![vec![0x10, 0x02, 0xC1, 0xC1]]);
      assert_eq!(
         events(&mut link),
         vec![WireEvent::Rx {
            earbud: Earbud::Right,
            data: Packet::from_slice(&[0x01, 0x00, 0x2B]),
            final_piece: true,
         }]
      );
   }

   #[test]
   fn test_status_request_exchange_scheme_a() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::A);

      assert!(link.tx(&mut comms, Device::Left, &[0x03]));
      assert_eq!(comms.take_sent(), vec![vec![0x22, 0x03, 0x0F]]);
      link.rx(Earbud::Left, &[0x41, 0xBB]);
      link.periodic(&mut comms);
      assert_eq!(events(&mut link), vec![WireEvent::Ack(Earbud::Left)]);

      assert!(link.tx(&mut comms, Device::Left, &[]));
      assert_eq!(comms.take_sent(), vec![vec![0xE1, 0xE1]]);
      link.rx(Earbud::Left, &[0x84, 0x01, 0x00, 0x21, 0x94]);
      link.periodic(&mut comms);
      assert_eq!(comms.take_sent(), vec![vec![0x21, 0x8D]]);

      assert!(link.tx(&mut comms, Device::Right, &[0x03]));
      assert_eq!(comms.take_sent(), vec![vec![0x12, 0x03, 0x18]]);
   }

   #[test]
   fn test_data_ack_advances_sequence() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::B);

      assert!(link.tx(&mut comms, Device::Left, &[0x03]));
      link.rx(Earbud::Left, &[0x40, 0x02, 0xCF, 0x7E]);
      link.periodic(&mut comms);
      assert!(link.tx(&mut comms, Device::Left, &[]));
      link.rx(Earbud::Left, &[0x80, 0x05, 0x01, 0x00, 0x21, 0x73, 0x15]);
      link.periodic(&mut comms);
      assert_eq!(comms.take_sent().last(), Some(&vec![0x20, 0x02, 0xC4, 0x54]));
      events(&mut link);

      assert!(link.tx(&mut comms, Device::Left, &[0x04, 0xAA]));
      let sent = comms.take_sent();
      assert_eq!(sent.len(), 1);
      let (header, payload) = frame::decode(Scheme::B, &sent[0]).unwrap();
      assert!(header.sn);
      assert!(!header.nesn);
      assert_eq!(header.dest, Device::Left);
      assert_eq!(payload, &[0x04, 0xAA]);
   }

   #[test]
   fn test_refused_data_ack_restores_sequence() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::B);

      assert!(link.tx(&mut comms, Device::Left, &[0x03]));
      link.rx(Earbud::Left, &[0x40, 0x02, 0xCF, 0x7E]);
      link.periodic(&mut comms);
      assert!(link.tx(&mut comms, Device::Left, &[]));
      link.rx(Earbud::Left, &[0x80, 0x05, 0x01, 0x00, 0x21, 0x73, 0x15]);
      link.periodic(&mut comms);
      comms.take_sent();
      events(&mut link);

      // The earbud answers the acknowledgement without moving its NESN.
      let refusal = frame::encode(Scheme::B, Header::new(true, false, Device::Case, Device::Left), &[]).unwrap();
      link.rx(Earbud::Left, &refusal);
      link.periodic(&mut comms);
      assert!(events(&mut link).is_empty());

      assert!(link.tx(&mut comms, Device::Left, &[0x03]));
      let sent = comms.take_sent();
      let (header, _) = frame::decode(Scheme::B, &sent[0]).unwrap();
      assert!(!header.sn);
   }

   #[test]
   fn test_refused_data_ack_behind_next_request() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::B);

      assert!(link.tx(&mut comms, Device::Left, &[0x03]));
      link.rx(Earbud::Left, &[0x40, 0x02, 0xCF, 0x7E]);
      link.periodic(&mut comms);
      assert!(link.tx(&mut comms, Device::Left, &[]));
      link.rx(Earbud::Left, &[0x80, 0x05, 0x01, 0x00, 0x21, 0x73, 0x15]);
      link.periodic(&mut comms);
      events(&mut link);

      assert!(link.tx(&mut comms, Device::Left, &[0x04, 0x55]));
      comms.take_sent();
      let refusal = frame::encode(Scheme::B, Header::new(true, false, Device::Case, Device::Left), &[]).unwrap();
      link.rx(Earbud::Left, &refusal);
      link.periodic(&mut comms);
      assert_eq!(events(&mut link), vec![WireEvent::Nack(Earbud::Left)]);

      let sent = comms.take_sent();
      assert_eq!(sent.len(), 1);
      let (header, payload) = frame::decode(Scheme::B, &sent[0]).unwrap();
      assert!(!header.sn);
      assert_eq!(payload, &[0x04, 0x55]);
   }

   #[test]
   fn test_data_ack_keeps_mock_earbud_in_step() {
      let mut comms = MockComms::acking();
      comms.echo_loopback = true;
      let mut link = WireLink::new(Scheme::B);

      for round in 0..3u8 {
         assert!(link.tx(&mut comms, Device::Left, &[0x04, round]));
         ticks(&mut link, &mut comms, 2);
         while let Some((earbud, frame)) = comms.receive() {
            link.rx(earbud, &frame);
         }
         link.periodic(&mut comms);
         assert_eq!(events(&mut link), vec![WireEvent::Ack(Earbud::Left)]);

         assert!(link.tx(&mut comms, Device::Left, &[]));
         while let Some((earbud, frame)) = comms.receive() {
            link.rx(earbud, &frame);
         }
         link.periodic(&mut comms);
         assert_eq!(
            events(&mut link),
            vec![WireEvent::Rx {
               earbud: Earbud::Left,
               data: Packet::from_slice(&[0x04, round]),
               final_piece: true,
            }]
         );
      }
   }

   #[test]
   fn test_nack_retransmits() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::B);

      assert!(link.tx(&mut comms, Device::Left, &[0x03]));
      comms.take_sent();
      link.rx(Earbud::Left, &[0x00, 0x02, 0xC2, 0xB2]);
      link.periodic(&mut comms);
      assert_eq!(comms.take_sent(), vec![vec![0x60, 0x03, 0x03, 0xCD, 0x38]]);
      assert_eq!(events(&mut link), vec![WireEvent::Nack(Earbud::Left)]);
      assert_eq!(link.links[0].nack_count, 1);
   }

   #[test]
   fn test_repeated_nack_resets_link() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::B);

      assert!(link.tx(&mut comms, Device::Left, &[0x03]));
      comms.take_sent();
      for _ in 0..2 {
         link.rx(Earbud::Left, &[0x00, 0x02, 0xC2, 0xB2]);
         link.periodic(&mut comms);
         assert_eq!(comms.take_sent(), vec![vec![0x60, 0x03, 0x03, 0xCD, 0x38]]);
      }

      link.rx(Earbud::Left, &[0x00, 0x02, 0xC2, 0xB2]);
      link.periodic(&mut comms);
      assert!(comms.take_sent().is_empty());
      assert!(link.is_broadcasting());

      link.periodic(&mut comms);
      assert_eq!(comms.take_sent(), vec![vec![0x30, 0x02, 0xC7, 0x27]]);
      ticks(&mut link, &mut comms, BROADCAST_TIMEOUT as usize + 1);
      assert_eq!(comms.take_sent(), vec![vec![0x30, 0x02, 0xC7, 0x27]]);
      ticks(&mut link, &mut comms, BROADCAST_TIMEOUT as usize + 1);
      assert_eq!(comms.take_sent(), vec![vec![0x30, 0x02, 0xC7, 0x27]]);
      assert!(!link.is_broadcasting());

      link.periodic(&mut comms);
      assert_eq!(comms.take_sent(), vec![vec![0x20, 0x03, 0x03, 0xD0, 0x95]]);

      let evts = events(&mut link);
      assert_eq!(evts.len(), 3);
      assert!(evts.iter().all(|e| *e == WireEvent::Nack(Earbud::Left)));
   }

   #[test]
   fn test_corrupt_reply_retries_then_gives_up() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::B);

      assert!(link.tx(&mut comms, Device::Left, &[0x03]));
      comms.take_sent();

      link.rx(Earbud::Left, &[0x40, 0x02, 0xCF, 0x7F]);
      link.periodic(&mut comms);
      assert_eq!(comms.take_sent(), vec![vec![0x20, 0x03, 0x03, 0xD0, 0x95]]);

      link.rx(Earbud::Left, &[0x40, 0x02, 0xDF, 0x7E]);
      comms.active = true;
      link.periodic(&mut comms);
      assert!(comms.take_sent().is_empty());
      comms.active = false;
      link.periodic(&mut comms);
      assert_eq!(comms.take_sent(), vec![vec![0x20, 0x03, 0x03, 0xD0, 0x95]]);

      link.rx(Earbud::Left, &[0x40, 0x00, 0xCF, 0x7E]);
      link.periodic(&mut comms);
      assert!(comms.take_sent().is_empty());
      assert_eq!(events(&mut link), vec![WireEvent::GiveUp(Earbud::Left)]);
      assert!(link.is_idle(Earbud::Left));
   }

   #[test]
   fn test_no_response() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::B);

      assert!(link.tx(&mut comms, Device::Right, &[0x03]));
      ticks(&mut link, &mut comms, NO_RESPONSE_TIMEOUT as usize);
      assert!(events(&mut link).is_empty());
      link.periodic(&mut comms);
      assert_eq!(events(&mut link), vec![WireEvent::NoResponse(Earbud::Right)]);
      assert!(link.is_idle(Earbud::Right));
   }

   #[test]
   fn test_broadcast_aborts_unicast() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::B);

      assert!(link.tx(&mut comms, Device::Left, &[0x03]));
      link.rx(Earbud::Left, &[0x40, 0x02, 0xCF, 0x7E]);
      assert!(link.tx(&mut comms, Device::Broadcast, &[0x00, 0x01]));
      assert_eq!(events(&mut link), vec![WireEvent::Abort(Earbud::Left)]);
      assert!(!link.tx(&mut comms, Device::Left, &[0x03]));
   }

   #[test]
   fn test_tx_refused() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::A);

      assert!(!link.tx(&mut comms, Device::Left, &[0u8; 15]));
      assert!(!link.tx(&mut comms, Device::Case, &[0x03]));
      comms.active = true;
      assert!(!link.tx(&mut comms, Device::Left, &[0x03]));
      comms.active = false;
      assert!(comms.take_sent().is_empty());

      assert!(link.tx(&mut comms, Device::Left, &[0x03]));
      assert!(!link.tx(&mut comms, Device::Left, &[0x03]));
   }

   #[test]
   fn test_unsolicited_frame_ignored() {
      let mut comms = MockComms::default();
      let mut link = WireLink::new(Scheme::B);

      link.rx(Earbud::Left, &[0x40, 0x02, 0xCF, 0x7E]);
      link.periodic(&mut comms);
      assert!(events(&mut link).is_empty());
      assert!(link.is_idle(Earbud::Left));
   }
}
