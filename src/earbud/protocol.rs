//! Case-comms protocol layer of the earbud firmware.
//!
//! Routes messages between the transport and the registered channels. In
//! case mode it also polls earbuds that owe a response and resets the link
//! with a broadcast after repeated transmit failures.

use std::{collections::VecDeque, fmt};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::wire::{Device, Earbud, Packet};

const CID_MASK: u8 = 0x70;
const CID_SHIFT: u8 = 4;
const MID_MASK: u8 = 0x0F;

/// Channel id used for messages that belong to no channel, e.g. polls.
pub const CID_INVALID: u8 = 0x0F;

/// Which end of the link this stack runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Mode {
   Earbud,
   #[cfg_attr(not(test), allow(dead_code))]
   Case,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum TransportKind {
   SchemeA,
   SchemeB,
   TestUart,
}

impl TransportKind {
   /// Responses can only be collected by polling for them.
   pub const fn requires_polling(self) -> bool {
      matches!(self, Self::SchemeB)
   }

   /// Sequence numbers can get out of step and need a broadcast to resync.
   pub const fn requires_reset(self) -> bool {
      matches!(self, Self::SchemeB)
   }
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumIter,
)]
pub enum ChannelId {
   /// Status information from the case.
   Case = 0,
   /// Device test service.
   Dts = 1,
   Customer = 2,
   Test = 3,
}

impl ChannelId {
   pub const COUNT: usize = 4;
}

/// Outcome of a transmission as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum TxStatus {
   /// The destination acknowledged the message.
   Success,
   /// No acknowledgement; the message may still have arrived.
   Fail,
   /// The destination did not answer at all.
   Timeout,
   /// Dropped from the transmit queue by a broadcast.
   BroadcastFlushed,
   Unknown,
}

pub const fn header(cid: u8, mid: u8) -> u8 {
   ((cid << CID_SHIFT) & CID_MASK) | (mid & MID_MASK)
}

pub const fn header_cid(hdr: u8) -> u8 {
   (hdr & CID_MASK) >> CID_SHIFT
}

pub const fn header_mid(hdr: u8) -> u8 {
   hdr & MID_MASK
}

/// Lower transport the protocol sends through.
pub trait Transport {
   /// Queues a message. A poll has no channel and no data.
   fn transmit(&mut self, dest: Device, cid: Option<ChannelId>, mid: u8, data: &[u8]) -> bool;

   fn enable(&mut self) -> bool {
      true
   }

   fn disable(&mut self) -> bool {
      false
   }

   fn is_enabled(&self) -> bool {
      true
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
   /// Ticks between a transmit status and the poll it makes necessary.
   pub poll_schedule_ticks: u16,
   /// Consecutive failed transmits after which the link is reset.
   pub num_fails_to_reset: u8,
   pub enable_on_startup: bool,
}

impl Default for ProtocolConfig {
   fn default() -> Self {
      Self {
         poll_schedule_ticks: 2,
         num_fails_to_reset: 3,
         enable_on_startup: true,
      }
   }
}

/// Message a client wants broadcast in place of the empty link reset.
pub type ResetFn = Box<dyn FnMut() -> (ChannelId, u8, Packet) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
   Rx {
      channel: ChannelId,
      mid: u8,
      payload: Packet,
      source: Device,
   },
   TxStatus {
      channel: ChannelId,
      mid: u8,
      status: TxStatus,
   },
}

#[derive(Debug, Default, Clone, Copy)]
struct ChannelState {
   registered: bool,
   /// Responses owed by each earbud on this channel.
   outstanding: [u8; 2],
}

pub struct CcProtocol<T> {
   mode: Mode,
   kind: TransportKind,
   transport: T,
   config: ProtocolConfig,
   channels: [ChannelState; ChannelId::COUNT],
   last_polled: Option<Earbud>,
   poll_timers: [Option<u16>; 2],
   tx_fail_count: u8,
   reset_fn: Option<ResetFn>,
   events: VecDeque<ProtocolEvent>,
}

impl<T> fmt::Debug for CcProtocol<T> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("CcProtocol")
         .field("mode", &self.mode)
         .field("kind", &self.kind)
         .field("channels", &self.channels)
         .field("last_polled", &self.last_polled)
         .field("tx_fail_count", &self.tx_fail_count)
         .finish_non_exhaustive()
   }
}

impl<T: Transport> CcProtocol<T> {
   pub fn new(mode: Mode, kind: TransportKind, mut transport: T, config: ProtocolConfig) -> Self {
      if config.enable_on_startup && !transport.enable() {
         warn!("Case comms transport could not be enabled");
      }
      Self {
         mode,
         kind,
         transport,
         config,
         channels: Default::default(),
         last_polled: None,
         poll_timers: [None; 2],
         tx_fail_count: 0,
         reset_fn: None,
         events: VecDeque::new(),
      }
   }

   pub const fn mode(&self) -> Mode {
      self.mode
   }

   pub const fn transport(&self) -> &T {
      &self.transport
   }

   pub const fn transport_mut(&mut self) -> &mut T {
      &mut self.transport
   }

   pub fn register_channel(&mut self, channel: ChannelId) {
      self.channels[channel as usize].registered = true;
   }

   /// Replaces the empty broadcast used to resync the link.
   #[cfg_attr(not(test), allow(dead_code))]
   pub fn register_broadcast_reset(&mut self, reset: ResetFn) {
      self.reset_fn = Some(reset);
   }

   pub fn enable(&mut self) -> bool {
      self.transport.enable()
   }

   pub fn disable(&mut self) -> bool {
      self.transport.disable()
   }

   pub fn is_enabled(&self) -> bool {
      self.transport.is_enabled()
   }

   pub fn poll_event(&mut self) -> Option<ProtocolEvent> {
      self.events.pop_front()
   }

   /// Responses still owed by `earbud` across all channels.
   pub fn outstanding(&self, earbud: Earbud) -> u32 {
      self.channels.iter().map(|c| u32::from(c.outstanding[earbud.index()])).sum()
   }

   /// Sends a message the destination will answer.
   pub fn transmit(&mut self, dest: Device, channel: ChannelId, mid: u8, data: &[u8]) -> bool {
      self.transmit_internal(dest, channel, mid, data, true)
   }

   /// Sends a message that gets no answer.
   pub fn transmit_notification(&mut self, dest: Device, channel: ChannelId, mid: u8, data: &[u8]) -> bool {
      self.transmit_internal(dest, channel, mid, data, false)
   }

   fn transmit_internal(
      &mut self,
      dest: Device,
      channel: ChannelId,
      mid: u8,
      data: &[u8],
      response_reqd: bool,
   ) -> bool {
      if !self.transport.transmit(dest, Some(channel), mid, data) {
         warn!("Transport refused message to {dest} on {channel} mid {mid}");
         return false;
      }
      debug!("Tx to {dest} on {channel} mid {mid} len {} resp {response_reqd}", data.len());

      if response_reqd && self.mode == Mode::Case {
         self.modify_poll_required(dest, channel as u8, true);
      }
      true
   }

   /// Incoming message from the transport, header byte included.
   pub fn on_receive(&mut self, source: Device, message: &[u8]) {
      let Some((&hdr, payload)) = message.split_first() else {
         debug!("Empty message from {source}");
         return;
      };
      let (cid, mid) = (header_cid(hdr), header_mid(hdr));
      trace!("Rx from {source} cid {cid} mid {mid} len {}", payload.len());

      match ChannelId::from_repr(cid) {
         Some(channel) if self.channels[channel as usize].registered => {
            self.events.push_back(ProtocolEvent::Rx {
               channel,
               mid,
               payload: Packet::from_slice(payload),
               source,
            });
         },
         Some(channel) => debug!("No client on {channel}, dropping mid {mid}"),
         None => warn!("Unsupported channel {cid} from {source}"),
      }

      if self.mode == Mode::Case {
         self.modify_poll_required(source, cid, false);
      }
   }

   /// Transmit status from the transport. `header` is the message header
   /// byte, or `None` for a poll.
   pub fn on_tx_status(&mut self, dest: Device, header: Option<u8>, status: TxStatus) {
      debug!("Tx status {status} to {dest} header {header:?}");
      let cid = header.map_or(CID_INVALID, header_cid);

      // A failed transmit will not be answered.
      if self.mode == Mode::Case && status != TxStatus::Success && dest.earbud().is_some() {
         self.modify_poll_required(dest, cid, false);
      }

      if let Some(hdr) = header {
         self.report_status(status, cid, header_mid(hdr));
      }

      if self.mode == Mode::Case {
         self.schedule_poll_if_required();
      }
   }

   /// Runs the poll timers. Call once per tick.
   pub fn periodic(&mut self) {
      for earbud in Earbud::BOTH {
         let timer = &mut self.poll_timers[earbud.index()];
         match timer {
            Some(0) | None => {},
            Some(n) => *n -= 1,
         }
         if *timer == Some(0) {
            *timer = None;
            self.handle_poll_timer(earbud);
         }
      }
   }

   fn report_status(&mut self, status: TxStatus, cid: u8, mid: u8) {
      if self.mode == Mode::Case {
         self.check_ack_nak_reset(status);
      }
      match ChannelId::from_repr(cid) {
         Some(channel) if self.channels[channel as usize].registered => {
            self.events.push_back(ProtocolEvent::TxStatus { channel, mid, status });
         },
         _ => {},
      }
   }

   fn check_ack_nak_reset(&mut self, status: TxStatus) {
      if !self.kind.requires_reset() {
         return;
      }
      match status {
         TxStatus::Success => self.tx_fail_count = 0,
         TxStatus::Fail | TxStatus::Timeout => {
            self.tx_fail_count += 1;
            if self.tx_fail_count >= self.config.num_fails_to_reset {
               debug!("{} failed transmits, resetting link", self.tx_fail_count);
               self.broadcast_reset();
               self.tx_fail_count = 0;
            }
         },
         TxStatus::BroadcastFlushed => {},
         TxStatus::Unknown => warn!("Unexpected transmit status {status}"),
      }
   }

   fn broadcast_reset(&mut self) {
      let sent = match self.reset_fn.as_mut() {
         Some(reset) => {
            let (channel, mid, payload) = reset();
            self.transport.transmit(Device::Broadcast, Some(channel), mid, &payload)
         },
         None => self.transport.transmit(Device::Broadcast, None, 0, &[]),
      };
      if !sent {
         warn!("Transport refused the broadcast reset");
      }
      // The broadcast flushes every queued message, answers included.
      for channel in &mut self.channels {
         channel.outstanding = [0; 2];
      }
      self.poll_timers = [None; 2];
   }

   fn modify_poll_required(&mut self, dev: Device, cid: u8, incr: bool) {
      if !self.kind.requires_polling() {
         return;
      }
      let Some(channel) = ChannelId::from_repr(cid) else {
         return;
      };
      let Some(earbud) = dev.earbud() else {
         warn!("Cannot track responses from {dev}");
         return;
      };

      let count = &mut self.channels[channel as usize].outstanding[earbud.index()];
      if incr {
         *count = count.saturating_add(1);
      } else {
         *count = count.saturating_sub(1);
         if *count == 0 {
            self.poll_timers[earbud.index()] = None;
         }
      }
   }

   /// Earbud to poll next: the only one owing a response, or the one not
   /// polled last when both do.
   fn earbud_to_poll(&self) -> Option<Earbud> {
      match (self.outstanding(Earbud::Left) > 0, self.outstanding(Earbud::Right) > 0) {
         (true, false) => Some(Earbud::Left),
         (false, true) => Some(Earbud::Right),
         (true, true) => Some(match self.last_polled {
            Some(Earbud::Left) => Earbud::Right,
            _ => Earbud::Left,
         }),
         (false, false) => None,
      }
   }

   fn schedule_poll_if_required(&mut self) {
      if !self.kind.requires_polling() {
         return;
      }
      if let Some(earbud) = self.earbud_to_poll() {
         let timer = &mut self.poll_timers[earbud.index()];
         if timer.is_none() {
            trace!("Poll for {earbud} in {} ticks", self.config.poll_schedule_ticks);
            *timer = Some(self.config.poll_schedule_ticks);
         }
      }
   }

   fn handle_poll_timer(&mut self, earbud: Earbud) {
      if self.earbud_to_poll().is_none() {
         trace!("Poll no longer required");
         return;
      }
      if self.transport.transmit(earbud.device(), None, 0, &[]) {
         self.last_polled = Some(earbud);
      } else {
         self.schedule_poll_if_required();
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[derive(Debug, Default)]
   struct Recording {
      sent: Vec<(Device, Option<ChannelId>, u8, Vec<u8>)>,
      refuse: bool,
   }

   impl Transport for Recording {
      fn transmit(&mut self, dest: Device, cid: Option<ChannelId>, mid: u8, data: &[u8]) -> bool {
         if self.refuse {
            return false;
         }
         self.sent.push((dest, cid, mid, data.to_vec()));
         true
      }
   }

   fn case_protocol() -> CcProtocol<Recording> {
      let mut p = CcProtocol::new(
         Mode::Case,
         TransportKind::SchemeB,
         Recording::default(),
         ProtocolConfig::default(),
      );
      p.register_channel(ChannelId::Case);
      p
   }

   fn polls(p: &mut CcProtocol<Recording>) -> Vec<Device> {
      p.transport_mut()
         .sent
         .drain(..)
         .filter(|(_, cid, _, data)| cid.is_none() && data.is_empty())
         .map(|(dest, ..)| dest)
         .collect()
   }

   fn run(p: &mut CcProtocol<Recording>, ticks: usize) {
      for _ in 0..ticks {
         p.periodic();
      }
   }

   #[test]
   fn test_header_fields() {
      assert_eq!(header(ChannelId::Test as u8, 4), 0x34);
      assert_eq!(header_cid(0x34), 3);
      assert_eq!(header_mid(0x34), 4);
      assert_eq!(header(CID_INVALID, 0), 0x70);
   }

   #[test]
   fn test_poll_after_tx_status() {
      let mut p = case_protocol();
      assert!(p.transmit(Device::Left, ChannelId::Case, 3, &[]));
      assert_eq!(p.outstanding(Earbud::Left), 1);

      p.on_tx_status(Device::Left, Some(0x03), TxStatus::Success);
      run(&mut p, 1);
      assert!(polls(&mut p).is_empty());
      run(&mut p, 1);
      assert_eq!(polls(&mut p), vec![Device::Left]);

      // The poll's own status schedules the next one until the answer is in.
      p.on_tx_status(Device::Left, None, TxStatus::Success);
      p.on_receive(Device::Left, &[0x01, 0x00, 0x21]);
      assert_eq!(p.outstanding(Earbud::Left), 0);
      run(&mut p, 5);
      assert!(polls(&mut p).is_empty());
   }

   #[test]
   fn test_poll_alternates_between_earbuds() {
      let mut p = case_protocol();
      p.transmit(Device::Left, ChannelId::Case, 3, &[]);
      p.transmit(Device::Right, ChannelId::Case, 3, &[]);

      p.on_tx_status(Device::Right, Some(0x03), TxStatus::Success);
      run(&mut p, 2);
      assert_eq!(polls(&mut p), vec![Device::Left]);

      p.on_tx_status(Device::Left, None, TxStatus::Success);
      run(&mut p, 2);
      assert_eq!(polls(&mut p), vec![Device::Right]);
   }

   #[test]
   fn test_failed_transmit_drops_outstanding() {
      let mut p = case_protocol();
      p.transmit(Device::Right, ChannelId::Case, 3, &[]);
      p.on_tx_status(Device::Right, Some(0x03), TxStatus::Timeout);
      assert_eq!(p.outstanding(Earbud::Right), 0);
      run(&mut p, 5);
      assert!(polls(&mut p).is_empty());
   }

   #[test]
   fn test_refused_poll_is_rescheduled() {
      let mut p = case_protocol();
      p.transmit(Device::Left, ChannelId::Case, 3, &[]);
      p.on_tx_status(Device::Left, Some(0x03), TxStatus::Success);

      p.transport_mut().refuse = true;
      run(&mut p, 2);
      p.transport_mut().refuse = false;
      run(&mut p, 2);
      assert_eq!(polls(&mut p), vec![Device::Left]);
   }

   #[test]
   fn test_fail_count_resets_link() {
      let mut p = case_protocol();
      p.transmit(Device::Left, ChannelId::Case, 3, &[]);
      p.transmit(Device::Right, ChannelId::Case, 3, &[]);
      p.transport_mut().sent.clear();

      p.on_tx_status(Device::Left, Some(0x00), TxStatus::Fail);
      p.on_tx_status(Device::Left, Some(0x00), TxStatus::Success);
      p.on_tx_status(Device::Left, Some(0x00), TxStatus::Fail);
      p.on_tx_status(Device::Left, Some(0x00), TxStatus::Timeout);
      assert!(p.transport().sent.iter().all(|(dest, ..)| *dest != Device::Broadcast));

      p.on_tx_status(Device::Left, Some(0x00), TxStatus::Fail);
      let broadcasts: Vec<_> =
         p.transport().sent.iter().filter(|(dest, ..)| *dest == Device::Broadcast).collect();
      assert_eq!(broadcasts, vec![&(Device::Broadcast, None, 0, vec![])]);
      assert_eq!(p.outstanding(Earbud::Right), 0);
   }

   #[test]
   fn test_registered_reset_message() {
      let mut p = case_protocol();
      p.register_broadcast_reset(Box::new(|| (ChannelId::Case, 0, Packet::from_slice(&[0x01]))));
      for _ in 0..3 {
         p.on_tx_status(Device::Left, Some(0x00), TxStatus::Fail);
      }
      assert_eq!(
         p.transport().sent,
         vec![(Device::Broadcast, Some(ChannelId::Case), 0, vec![0x01])]
      );
   }

   #[test]
   fn test_channel_routing() {
      let mut p = CcProtocol::new(
         Mode::Earbud,
         TransportKind::SchemeB,
         Recording::default(),
         ProtocolConfig::default(),
      );
      p.register_channel(ChannelId::Test);

      p.on_receive(Device::Case, &[0x34, 0xAA]);
      p.on_receive(Device::Case, &[0x03]);
      p.on_receive(Device::Case, &[0x7F, 0x00]);
      p.on_receive(Device::Case, &[]);
      assert_eq!(
         p.poll_event(),
         Some(ProtocolEvent::Rx {
            channel: ChannelId::Test,
            mid: 4,
            payload: Packet::from_slice(&[0xAA]),
            source: Device::Case,
         })
      );
      assert_eq!(p.poll_event(), None);

      p.on_tx_status(Device::Case, Some(0x31), TxStatus::Success);
      assert_eq!(
         p.poll_event(),
         Some(ProtocolEvent::TxStatus {
            channel: ChannelId::Test,
            mid: 1,
            status: TxStatus::Success,
         })
      );
   }

   #[test]
   fn test_earbud_mode_does_not_poll() {
      let mut p = CcProtocol::new(
         Mode::Earbud,
         TransportKind::SchemeB,
         Recording::default(),
         ProtocolConfig::default(),
      );
      p.register_channel(ChannelId::Case);
      p.transmit(Device::Case, ChannelId::Case, 1, &[0x00, 0x21]);
      p.on_tx_status(Device::Case, Some(0x01), TxStatus::Fail);
      run(&mut p, 5);
      assert_eq!(p.transport().sent.len(), 1);
   }
}
