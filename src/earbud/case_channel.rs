//! The case channel: status, reset, loopback and command messages.
//!
//! Encoders for everything the case sends, and the receive handler used on
//! both ends. On an earbud the handler answers the case; on the case it turns
//! earbud answers into [`CaseChannelEvent`]s.

use log::{debug, info, warn};

use super::{
   EarbudPlatform,
   protocol::{CcProtocol, ChannelId, Transport, TxStatus},
   with_case::{BATTERY_CHARGING, LidState, WithCase},
};
use crate::{
   ccp::{BtAddress, EarbudCommand, InfoType, Message},
   wire::{Device, Packet},
};

const CASE_STATUS_LID: u8 = 0x01;
const CASE_STATUS_CC: u8 = 0x02;
const CASE_STATUS_SIZE_INC_BATTERY: usize = 4;

const EARBUD_STATUS_PP: u8 = 0x01;
const EARBUD_STATUS_INFO: u8 = 0x80;
const EARBUD_STATUS_INFO_VALUE: u8 = 0x7F;

#[cfg_attr(not(test), allow(dead_code))]
const RESET_TYPE_REBOOT: u8 = 0x00;
const RESET_TYPE_FACTORY: u8 = 0x01;

const CMD_ACCEPTED: u8 = 0x01;
const CMD_REJECTED: u8 = 0x00;

/// Largest loopback payload an earbud echoes.
pub const LOOPBACK_BUFFER_SIZE: usize = 376;

/// Contents of a case status message.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaseStatusConfig {
   /// Lid and charger flags only.
   pub short_form: bool,
   pub lid_open: bool,
   pub charger_connected: bool,
   pub case_battery: u8,
   pub left_battery: u8,
   pub right_battery: u8,
}

/// Answers and transmit results seen on the case side.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseChannelEvent {
   EarbudStatus {
      source: Device,
      battery_state: u8,
      peer_paired: bool,
   },
   EarbudAddress {
      source: Device,
      address: BtAddress,
   },
   Loopback {
      source: Device,
      data: Packet,
   },
   PeerPairResponse {
      source: Device,
      accepted: bool,
   },
   ShippingModeResponse {
      source: Device,
      accepted: bool,
   },
   TxStatus {
      status: TxStatus,
      mid: u8,
   },
}

/// `[lap0, lap1, lap2, uap, nap0, nap1]`
pub const fn address_to_msg(addr: BtAddress) -> [u8; 6] {
   let [lap0, lap1, lap2, _] = addr.lap.to_le_bytes();
   let [nap0, nap1] = addr.nap.to_le_bytes();
   [lap0, lap1, lap2, addr.uap, nap0, nap1]
}

pub fn address_from_msg(msg: &[u8]) -> Option<BtAddress> {
   match msg {
      [lap0, lap1, lap2, uap, nap0, nap1, ..] => Some(BtAddress::new(
         u16::from_le_bytes([*nap0, *nap1]),
         *uap,
         u32::from_le_bytes([*lap0, *lap1, *lap2, 0]),
      )),
      _ => None,
   }
}

// The case end of the daemon talks through `ccp`; these encoders serve a
// stack running in case mode.
#[cfg_attr(not(test), allow(dead_code))]
fn to_earbud(dest: Device, what: &str) -> bool {
   if dest.earbud().is_none() {
      warn!("{what}: bad destination {dest}");
      return false;
   }
   true
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn earbud_status_req_tx<T: Transport>(p: &mut CcProtocol<T>, dest: Device) -> bool {
   to_earbud(dest, "Status request")
      && p.transmit(dest, ChannelId::Case, Message::StatusReq as u8, &[])
}

/// Case status to one earbud or both; never to the case itself.
#[cfg_attr(not(test), allow(dead_code))]
pub fn case_status_tx<T: Transport>(p: &mut CcProtocol<T>, dest: Device, config: &CaseStatusConfig) -> bool {
   if dest == Device::Case {
      warn!("Case status: bad destination {dest}");
      return false;
   }
   let mut info = 0;
   if config.lid_open {
      info |= CASE_STATUS_LID;
   }
   if config.charger_connected {
      info |= CASE_STATUS_CC;
   }
   let msg = [info, config.case_battery, config.left_battery, config.right_battery];
   let len = if config.short_form { 1 } else { msg.len() };
   p.transmit_notification(dest, ChannelId::Case, Message::Status as u8, &msg[..len])
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn earbud_reset_tx<T: Transport>(p: &mut CcProtocol<T>, dest: Device, factory: bool) -> bool {
   if dest == Device::Case {
      warn!("Reset: bad destination {dest}");
      return false;
   }
   let kind = if factory { RESET_TYPE_FACTORY } else { RESET_TYPE_REBOOT };
   p.transmit_notification(dest, ChannelId::Case, Message::Reset as u8, &[kind])
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn bt_address_info_req_tx<T: Transport>(p: &mut CcProtocol<T>, dest: Device) -> bool {
   to_earbud(dest, "Address request")
      && p.transmit(dest, ChannelId::Case, Message::StatusReq as u8, &[InfoType::BtAddress as u8])
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn loopback_tx<T: Transport>(p: &mut CcProtocol<T>, dest: Device, data: &[u8]) -> bool {
   to_earbud(dest, "Loopback") && p.transmit(dest, ChannelId::Case, Message::Loopback as u8, data)
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn peer_pair_cmd_tx<T: Transport>(p: &mut CcProtocol<T>, dest: Device, peer: BtAddress) -> bool {
   if !to_earbud(dest, "Peer pair") {
      return false;
   }
   let mut msg = [0u8; 7];
   msg[0] = EarbudCommand::PeerPair as u8;
   msg[1..].copy_from_slice(&address_to_msg(peer));
   p.transmit(dest, ChannelId::Case, Message::EarbudCmd as u8, &msg)
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn shipping_mode_cmd_tx<T: Transport>(p: &mut CcProtocol<T>, dest: Device) -> bool {
   to_earbud(dest, "Shipping mode")
      && p.transmit(dest, ChannelId::Case, Message::EarbudCmd as u8, &[EarbudCommand::ShippingMode as u8])
}

fn cmd_resp_tx<T: Transport>(p: &mut CcProtocol<T>, cmd: EarbudCommand, accepted: bool) -> bool {
   let msg = [cmd as u8, if accepted { CMD_ACCEPTED } else { CMD_REJECTED }];
   p.transmit_notification(Device::Case, ChannelId::Case, Message::EarbudRsp as u8, &msg)
}

pub fn peer_pair_cmd_resp_tx<T: Transport>(p: &mut CcProtocol<T>, started: bool) -> bool {
   cmd_resp_tx(p, EarbudCommand::PeerPair, started)
}

pub fn shipping_mode_cmd_resp_tx<T: Transport>(p: &mut CcProtocol<T>, accepted: bool) -> bool {
   cmd_resp_tx(p, EarbudCommand::ShippingMode, accepted)
}

/// Local battery in the combined format. An earbud in the case is assumed
/// to be charging.
pub fn local_battery_state(platform: &impl EarbudPlatform) -> u8 {
   let soc = platform.state_of_charge().min(100);
   if platform.in_case() { soc | BATTERY_CHARGING } else { soc }
}

/// Transmit status for a case channel message.
pub fn handle_tx_status(mid: u8, status: TxStatus) -> Option<CaseChannelEvent> {
   match Message::from_repr(mid) {
      // Sent by the case.
      Some(
         Message::Status | Message::Reset | Message::StatusReq | Message::Loopback | Message::EarbudCmd,
      ) => Some(CaseChannelEvent::TxStatus { status, mid }),
      // Sent by earbuds, which have no use for it.
      Some(Message::EarbudStatus | Message::EarbudRsp) => None,
      None => {
         warn!("Tx status for unsupported mid {mid}");
         None
      },
   }
}

/// Everything the receive handler may need to touch.
pub struct RxContext<'a, T, P> {
   pub protocol: &'a mut CcProtocol<T>,
   pub with_case: &'a mut WithCase,
   pub platform: &'a mut P,
}

impl<T: Transport, P: EarbudPlatform> RxContext<'_, T, P> {
   /// Handles one case channel message.
   pub fn handle_rx(&mut self, mid: u8, msg: &[u8], source: Device) -> Option<CaseChannelEvent> {
      match Message::from_repr(mid) {
         Some(Message::Status) => {
            self.case_status(msg);
            None
         },
         Some(Message::StatusReq) => {
            self.status_req(msg);
            None
         },
         Some(Message::EarbudStatus) => earbud_status(msg, source),
         Some(Message::Reset) => {
            self.reset(msg, source);
            None
         },
         Some(Message::Loopback) => self.loopback(msg, source),
         Some(Message::EarbudCmd) => {
            self.command(msg);
            None
         },
         Some(Message::EarbudRsp) => command_response(msg, source),
         None => {
            warn!("Unsupported case channel mid {mid}");
            None
         },
      }
   }

   fn case_status(&mut self, msg: &[u8]) {
      let Some(&info) = msg.first() else {
         warn!("Case status too short");
         return;
      };
      let lid = if info & CASE_STATUS_LID != 0 {
         LidState::Open
      } else {
         LidState::Closed
      };
      let charger_connected = info & CASE_STATUS_CC != 0;
      self.with_case.lid_event(lid);

      if msg.len() >= CASE_STATUS_SIZE_INC_BATTERY {
         let peer = if self.platform.is_left() { msg[3] } else { msg[2] };
         let local = local_battery_state(&*self.platform);
         self.with_case.power_event(msg[1], peer, local, charger_connected);
      }
   }

   fn status_req(&mut self, msg: &[u8]) {
      match msg.first().map(|&t| InfoType::from_repr(t)) {
         None => {
            let flags = if self.platform.paired_with_peer() { EARBUD_STATUS_PP } else { 0 };
            let status = [flags, local_battery_state(&*self.platform)];
            if !self.protocol.transmit(Device::Case, ChannelId::Case, Message::EarbudStatus as u8, &status) {
               warn!("Earbud status rejected by transport");
            }
         },
         Some(Some(InfoType::BtAddress)) => {
            let Some(addr) = self.platform.programmed_address() else {
               warn!("No programmed address to report");
               return;
            };
            let mut status = [0u8; 7];
            status[0] = EARBUD_STATUS_INFO | (InfoType::BtAddress as u8 & EARBUD_STATUS_INFO_VALUE);
            status[1..].copy_from_slice(&address_to_msg(addr));
            if !self.protocol.transmit(Device::Case, ChannelId::Case, Message::EarbudStatus as u8, &status) {
               warn!("Address info rejected by transport");
            }
         },
         Some(None) => warn!("Unsupported info type {:#04x}", msg[0]),
      }
   }

   fn reset(&mut self, msg: &[u8], source: Device) {
      match msg.first() {
         Some(&RESET_TYPE_FACTORY) => {
            info!("Factory reset requested by {source}");
            self.platform.factory_reset();
         },
         Some(_) => {
            info!("Reboot requested by {source}");
            self.platform.reboot();
         },
         None => warn!("Reset message too short"),
      }
   }

   fn loopback(&mut self, msg: &[u8], source: Device) -> Option<CaseChannelEvent> {
      let data = &msg[..msg.len().min(LOOPBACK_BUFFER_SIZE)];
      if source == Device::Case {
         debug!("Loopback, echoing {} bytes", data.len());
         if !self.protocol.transmit(Device::Case, ChannelId::Case, Message::Loopback as u8, data) {
            warn!("Loopback echo rejected by transport");
         }
         None
      } else {
         Some(CaseChannelEvent::Loopback {
            source,
            data: Packet::from_slice(data),
         })
      }
   }

   fn command(&mut self, msg: &[u8]) {
      let Some(&cmd) = msg.first() else {
         return;
      };
      match EarbudCommand::from_repr(cmd) {
         Some(EarbudCommand::PeerPair) => {
            let started = match address_from_msg(&msg[1..]) {
               Some(peer) => {
                  let started = self.platform.peer_pair_to(peer);
                  if started {
                     info!("Peer pairing with {peer}");
                  }
                  started
               },
               None => {
                  warn!("Peer pair command too short ({} bytes)", msg.len());
                  false
               },
            };
            peer_pair_cmd_resp_tx(self.protocol, started);
         },
         Some(EarbudCommand::ShippingMode) => {
            let accepted = self.with_case.shipping_mode_cmd(self.platform.charger_connected());
            shipping_mode_cmd_resp_tx(self.protocol, accepted);
         },
         None => warn!("Unsupported command {cmd}"),
      }
   }
}

fn earbud_status(msg: &[u8], source: Device) -> Option<CaseChannelEvent> {
   let [flags, rest @ ..] = msg else {
      warn!("Earbud status too short");
      return None;
   };
   if rest.is_empty() {
      warn!("Earbud status too short");
      return None;
   }
   if flags & EARBUD_STATUS_INFO == 0 {
      return Some(CaseChannelEvent::EarbudStatus {
         source,
         battery_state: rest[0],
         peer_paired: flags & EARBUD_STATUS_PP != 0,
      });
   }
   match InfoType::from_repr(flags & EARBUD_STATUS_INFO_VALUE) {
      Some(InfoType::BtAddress) => {
         address_from_msg(rest).map(|address| CaseChannelEvent::EarbudAddress { source, address })
      },
      None => {
         warn!("Unsupported info type {}", flags & EARBUD_STATUS_INFO_VALUE);
         None
      },
   }
}

fn command_response(msg: &[u8], source: Device) -> Option<CaseChannelEvent> {
   let [cmd, resp, ..] = msg else {
      return None;
   };
   let accepted = *resp == CMD_ACCEPTED;
   match EarbudCommand::from_repr(*cmd) {
      Some(EarbudCommand::PeerPair) => Some(CaseChannelEvent::PeerPairResponse { source, accepted }),
      Some(EarbudCommand::ShippingMode) => Some(CaseChannelEvent::ShippingModeResponse { source, accepted }),
      None => {
         warn!("Unsupported command response {cmd}");
         None
      },
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::earbud::{
      EarbudStack, Mode, ProtocolConfig, TransportKind, WithCaseEvent,
      testing::{Outbox, TestPlatform},
   };

   type Stack = EarbudStack<TestPlatform, Outbox>;

   const ADDR: BtAddress = BtAddress::new(0x0002, 0x5B, 0x00EB21);

   fn earbud(platform: TestPlatform) -> Stack {
      EarbudStack::new(
         Mode::Earbud,
         TransportKind::SchemeB,
         platform,
         Outbox::default(),
         ProtocolConfig::default(),
      )
   }

   fn case() -> Stack {
      EarbudStack::new(
         Mode::Case,
         TransportKind::SchemeB,
         TestPlatform::default(),
         Outbox::default(),
         ProtocolConfig::default(),
      )
   }

   fn sent(s: &mut Stack) -> Vec<(Device, u8, Vec<u8>)> {
      s.protocol_mut()
         .transport_mut()
         .sent
         .drain(..)
         .map(|(dest, _, mid, data)| (dest, mid, data))
         .collect()
   }

   fn with_case_events(s: &mut Stack) -> Vec<WithCaseEvent> {
      std::iter::from_fn(|| s.with_case_mut().poll_event()).collect()
   }

   #[test]
   fn test_address_layout() {
      assert_eq!(address_to_msg(ADDR), [0x21, 0xEB, 0x00, 0x5B, 0x02, 0x00]);
      assert_eq!(address_from_msg(&[0x21, 0xEB, 0x00, 0x5B, 0x02, 0x00]), Some(ADDR));
      assert_eq!(address_from_msg(&[0x21, 0xEB]), None);
   }

   #[test]
   fn test_full_case_status_picks_peer_battery() {
      let mut left = earbud(TestPlatform::default());
      left.on_receive(Device::Case, &[0x00, 0x03, 0xE4, 0x32, 0x45]);
      assert_eq!(
         with_case_events(&mut left),
         vec![
            WithCaseEvent::Lid(LidState::Open),
            WithCaseEvent::Power {
               case_battery: 0xE4,
               peer_battery: 0x45,
               local_battery: 0x80 | 50,
               charger_connected: true,
            },
         ]
      );

      let mut right = earbud(TestPlatform {
         left: false,
         in_case: false,
         ..TestPlatform::default()
      });
      right.on_receive(Device::Case, &[0x00, 0x00, 0x64, 0x32, 0x45]);
      assert_eq!(
         with_case_events(&mut right),
         vec![
            WithCaseEvent::Lid(LidState::Closed),
            WithCaseEvent::Power {
               case_battery: 0x64,
               peer_battery: 0x32,
               local_battery: 50,
               charger_connected: false,
            },
         ]
      );
   }

   #[test]
   fn test_short_case_status_only_updates_lid() {
      let mut s = earbud(TestPlatform::default());
      s.on_receive(Device::Case, &[0x00, 0x01]);
      assert_eq!(with_case_events(&mut s), vec![WithCaseEvent::Lid(LidState::Open)]);
      assert!(sent(&mut s).is_empty());
   }

   #[test]
   fn test_status_request_answered() {
      let mut s = earbud(TestPlatform {
         paired: true,
         soc: 120,
         ..TestPlatform::default()
      });
      s.on_receive(Device::Case, &[0x03]);
      assert_eq!(sent(&mut s), vec![(Device::Case, Message::EarbudStatus as u8, vec![0x01, 0x80 | 100])]);
   }

   #[test]
   fn test_address_request_answered() {
      let mut s = earbud(TestPlatform::default());
      s.on_receive(Device::Case, &[0x03, 0x00]);
      assert_eq!(
         sent(&mut s),
         vec![(Device::Case, 1, vec![0x80, 0x21, 0xEB, 0x00, 0x5B, 0x02, 0x00])]
      );

      let mut s = earbud(TestPlatform {
         address: None,
         ..TestPlatform::default()
      });
      s.on_receive(Device::Case, &[0x03, 0x00]);
      s.on_receive(Device::Case, &[0x03, 0x09]);
      assert!(sent(&mut s).is_empty());
   }

   #[test]
   fn test_loopback_echoed() {
      let mut s = earbud(TestPlatform::default());
      s.on_receive(Device::Case, &[0x04, 0xDE, 0xAD, 0xBE, 0xEF]);
      assert_eq!(sent(&mut s), vec![(Device::Case, 4, vec![0xDE, 0xAD, 0xBE, 0xEF])]);
   }

   #[test]
   fn test_shipping_mode_needs_charger() {
      let mut s = earbud(TestPlatform::default());
      s.on_receive(Device::Case, &[0x05, 0x02]);
      assert_eq!(sent(&mut s), vec![(Device::Case, 6, vec![0x02, 0x01])]);
      assert!(s.with_case().shipping_mode_pending());

      s.platform_mut().charger = false;
      s.on_receive(Device::Case, &[0x05, 0x02]);
      assert_eq!(sent(&mut s), vec![(Device::Case, 6, vec![0x02, 0x00])]);
      assert!(!s.with_case().shipping_mode_pending());
   }

   #[test]
   fn test_peer_pair_command() {
      let mut s = earbud(TestPlatform::default());
      s.on_receive(Device::Case, &[0x05, 0x00, 0x21, 0xEB, 0x00, 0x5B, 0x02, 0x00]);
      assert_eq!(s.platform().paired_to, Some(ADDR));
      assert_eq!(sent(&mut s), vec![(Device::Case, 6, vec![0x00, 0x01])]);

      s.on_receive(Device::Case, &[0x05, 0x00, 0x21]);
      assert_eq!(sent(&mut s), vec![(Device::Case, 6, vec![0x00, 0x00])]);
   }

   #[test]
   fn test_reset_kinds() {
      let mut s = earbud(TestPlatform::default());
      s.on_receive(Device::Case, &[0x02, 0x01]);
      s.on_receive(Device::Case, &[0x02, 0x00]);
      s.on_receive(Device::Case, &[0x02]);
      assert_eq!(s.platform().factory_resets, 1);
      assert_eq!(s.platform().reboots, 1);
      assert!(sent(&mut s).is_empty());
   }

   #[test]
   fn test_case_mode_decodes_answers() {
      let mut s = case();
      s.on_receive(Device::Left, &[0x01, 0x01, 0xB2]);
      s.on_receive(Device::Right, &[0x01, 0x80, 0x21, 0xEB, 0x00, 0x5B, 0x02, 0x00]);
      s.on_receive(Device::Left, &[0x04, 0x01, 0x02]);
      s.on_receive(Device::Right, &[0x06, 0x02, 0x00]);
      s.on_receive(Device::Left, &[0x06, 0x00, 0x01]);
      s.on_receive(Device::Left, &[0x01, 0x00]);
      let events: Vec<_> = std::iter::from_fn(|| s.poll_event()).collect();
      assert_eq!(
         events,
         vec![
            CaseChannelEvent::EarbudStatus {
               source: Device::Left,
               battery_state: 0xB2,
               peer_paired: true,
            },
            CaseChannelEvent::EarbudAddress {
               source: Device::Right,
               address: ADDR,
            },
            CaseChannelEvent::Loopback {
               source: Device::Left,
               data: Packet::from_slice(&[0x01, 0x02]),
            },
            CaseChannelEvent::ShippingModeResponse {
               source: Device::Right,
               accepted: false,
            },
            CaseChannelEvent::PeerPairResponse {
               source: Device::Left,
               accepted: true,
            },
         ]
      );
      assert!(sent(&mut s).is_empty());
   }

   #[test]
   fn test_case_side_encoders() {
      let mut s = case();
      let status = CaseStatusConfig {
         short_form: false,
         lid_open: true,
         charger_connected: false,
         case_battery: 0x64,
         left_battery: 0x32,
         right_battery: 0x7F,
      };
      assert!(!case_status_tx(s.protocol_mut(), Device::Case, &status));
      assert!(case_status_tx(s.protocol_mut(), Device::Broadcast, &status));
      assert!(case_status_tx(
         s.protocol_mut(),
         Device::Left,
         &CaseStatusConfig {
            short_form: true,
            ..status
         }
      ));
      assert!(!earbud_status_req_tx(s.protocol_mut(), Device::Broadcast));
      assert!(earbud_status_req_tx(s.protocol_mut(), Device::Right));
      assert!(shipping_mode_cmd_tx(s.protocol_mut(), Device::Left));
      assert!(peer_pair_cmd_tx(s.protocol_mut(), Device::Right, ADDR));
      assert!(earbud_reset_tx(s.protocol_mut(), Device::Broadcast, true));
      assert_eq!(
         sent(&mut s),
         vec![
            (Device::Broadcast, 0, vec![0x01, 0x64, 0x32, 0x7F]),
            (Device::Left, 0, vec![0x01]),
            (Device::Right, 3, vec![]),
            (Device::Left, 5, vec![0x02]),
            (Device::Right, 5, vec![0x00, 0x21, 0xEB, 0x00, 0x5B, 0x02, 0x00]),
            (Device::Broadcast, 2, vec![0x01]),
         ]
      );
      assert_eq!(s.protocol().outstanding(crate::wire::Earbud::Right), 2);
   }

   #[test]
   fn test_address_and_loopback_requests() {
      let mut s = case();
      assert!(!bt_address_info_req_tx(s.protocol_mut(), Device::Broadcast));
      assert!(!loopback_tx(s.protocol_mut(), Device::Case, &[0xAA]));
      assert!(bt_address_info_req_tx(s.protocol_mut(), Device::Left));
      assert!(loopback_tx(s.protocol_mut(), Device::Right, &[0xAA, 0x55]));
      assert_eq!(
         sent(&mut s),
         vec![(Device::Left, 3, vec![0x00]), (Device::Right, 4, vec![0xAA, 0x55])]
      );
   }

   #[test]
   fn test_tx_status_reported_for_case_messages() {
      let mut s = case();
      s.on_tx_status(Device::Left, Some(0x03), TxStatus::Timeout);
      s.on_tx_status(Device::Left, Some(0x01), TxStatus::Success);
      assert_eq!(
         s.poll_event(),
         Some(CaseChannelEvent::TxStatus {
            status: TxStatus::Timeout,
            mid: 3,
         })
      );
      assert_eq!(s.poll_event(), None);
   }
}
