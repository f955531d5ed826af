//! Charger-comms wire layer: framing, check sequences and the per-earbud
//! acknowledgement link used by the case.

pub mod crc;
pub mod frame;
pub mod link;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use frame::Header;
pub use link::{ChargerComms, WireEvent, WireLink};

/// Raw frame or payload bytes.
pub type Packet = SmallVec<[u8; 32]>;

/// Framing scheme used on the charger contacts.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum Scheme {
   /// Low-speed scheme: 1-byte header and CRC-8.
   #[serde(rename = "scheme_a")]
   #[strum(to_string = "scheme_a", serialize = "a")]
   A,
   /// Single-wire UART scheme: 2-byte header and CRC-16.
   #[default]
   #[serde(rename = "scheme_b")]
   #[strum(to_string = "scheme_b", serialize = "b")]
   B,
}

/// Device address as carried in the 2-bit destination and source fields.
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
   strum::IntoStaticStr,
)]
pub enum Device {
   #[strum(serialize = "case")]
   Case = 0,
   #[strum(serialize = "right")]
   Right = 1,
   #[strum(serialize = "left")]
   Left = 2,
   #[strum(serialize = "broadcast")]
   Broadcast = 3,
}

impl Device {
   /// Decodes the low two bits of `bits`.
   pub const fn from_bits(bits: u8) -> Self {
      match bits & 0x03 {
         0 => Self::Case,
         1 => Self::Right,
         2 => Self::Left,
         _ => Self::Broadcast,
      }
   }

   pub const fn earbud(self) -> Option<Earbud> {
      match self {
         Self::Left => Some(Earbud::Left),
         Self::Right => Some(Earbud::Right),
         _ => None,
      }
   }
}

/// One of the two earbuds the case talks to.
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
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Earbud {
   #[strum(to_string = "left", serialize = "l")]
   Left = 0,
   #[strum(to_string = "right", serialize = "r")]
   Right = 1,
}

impl Earbud {
   pub const BOTH: [Self; 2] = [Self::Left, Self::Right];

   pub const fn index(self) -> usize {
      self as usize
   }

   pub const fn other(self) -> Self {
      match self {
         Self::Left => Self::Right,
         Self::Right => Self::Left,
      }
   }

   pub const fn device(self) -> Device {
      match self {
         Self::Left => Device::Left,
         Self::Right => Device::Right,
      }
   }

   /// Single letter used in console reports.
   pub const fn letter(self) -> char {
      match self {
         Self::Left => 'L',
         Self::Right => 'R',
      }
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}
