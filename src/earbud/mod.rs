//! Earbud side of case comms.

pub mod case_channel;
pub mod protocol;
pub mod with_case;

use std::collections::VecDeque;

use log::debug;

pub use case_channel::{CaseChannelEvent, RxContext};
pub use protocol::{CcProtocol, ChannelId, Mode, ProtocolConfig, ProtocolEvent, Transport, TransportKind, TxStatus};
pub use with_case::{LidState, WithCase, WithCaseEvent};

use crate::{ccp::BtAddress, wire::Device};

/// The rest of the earbud, as far as case comms is concerned.
pub trait EarbudPlatform {
   fn is_left(&self) -> bool;
   /// Battery state of charge in percent.
   fn state_of_charge(&self) -> u8;
   fn in_case(&self) -> bool;
   fn paired_with_peer(&self) -> bool;
   fn programmed_address(&self) -> Option<BtAddress>;
   fn charger_connected(&self) -> bool;
   /// Starts pairing with `peer`, returning whether it got going.
   fn peer_pair_to(&mut self, peer: BtAddress) -> bool;
   fn factory_reset(&mut self);
   fn reboot(&mut self);
}

/// Protocol layer, case channel and with-case state of one device.
#[derive(Debug)]
pub struct EarbudStack<P, T> {
   protocol: CcProtocol<T>,
   with_case: WithCase,
   platform: P,
   events: VecDeque<CaseChannelEvent>,
}

impl<P: EarbudPlatform, T: Transport> EarbudStack<P, T> {
   pub fn new(mode: Mode, kind: TransportKind, platform: P, transport: T, config: ProtocolConfig) -> Self {
      let mut protocol = CcProtocol::new(mode, kind, transport, config);
      protocol.register_channel(ChannelId::Case);
      Self {
         protocol,
         with_case: WithCase::new(),
         platform,
         events: VecDeque::new(),
      }
   }

   pub const fn protocol(&self) -> &CcProtocol<T> {
      &self.protocol
   }

   pub const fn protocol_mut(&mut self) -> &mut CcProtocol<T> {
      &mut self.protocol
   }

   pub const fn with_case(&self) -> &WithCase {
      &self.with_case
   }

   pub const fn with_case_mut(&mut self) -> &mut WithCase {
      &mut self.with_case
   }

   pub const fn platform(&self) -> &P {
      &self.platform
   }

   pub const fn platform_mut(&mut self) -> &mut P {
      &mut self.platform
   }

   /// Case channel events, case mode only.
   #[cfg_attr(not(test), allow(dead_code))]
   pub fn poll_event(&mut self) -> Option<CaseChannelEvent> {
      self.events.pop_front()
   }

   pub fn on_receive(&mut self, source: Device, message: &[u8]) {
      self.protocol.on_receive(source, message);
      self.dispatch();
   }

   pub fn on_tx_status(&mut self, dest: Device, header: Option<u8>, status: TxStatus) {
      self.protocol.on_tx_status(dest, header, status);
      self.dispatch();
   }

   pub fn periodic(&mut self) {
      self.protocol.periodic();
      self.dispatch();
   }

   fn dispatch(&mut self) {
      while let Some(event) = self.protocol.poll_event() {
         let out = match event {
            ProtocolEvent::Rx {
               channel: ChannelId::Case,
               mid,
               payload,
               source,
            } => RxContext {
               protocol: &mut self.protocol,
               with_case: &mut self.with_case,
               platform: &mut self.platform,
            }
            .handle_rx(mid, &payload, source),
            ProtocolEvent::TxStatus {
               channel: ChannelId::Case,
               mid,
               status,
            } => case_channel::handle_tx_status(mid, status),
            other => {
               debug!("No handler for {other:?}");
               None
            },
         };
         if let Some(event) = out {
            self.events.push_back(event);
         }
      }
   }
}
