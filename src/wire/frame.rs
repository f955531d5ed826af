//! Charger-comms frame codec.
//!
//! Both schemes share the first header byte layout:
//!
//! ```text
//!  7    6     5..4   3..0
//!  SN   NESN  DEST   scheme specific
//! ```
//!
//! Scheme A packs the number of bytes following the header (payload plus
//! check byte) in the low nibble and closes with a CRC-8. Scheme B carries
//! the source device in bits 3..2, a 10-bit length (payload plus check word)
//! split across bits 1..0 and the second header byte, and closes with a
//! big-endian CRC-16.

use thiserror::Error;

use super::{Device, Packet, Scheme, crc};

const SN_BIT: u8 = 0x80;
const NESN_BIT: u8 = 0x40;
const DEST_SHIFT: u8 = 4;
const SRC_SHIFT: u8 = 2;
const LEN_MASK_A: u8 = 0x0F;
const LEN_HI_MASK_B: u8 = 0x03;

/// Errors produced while decoding or encoding a frame.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
   /// Fewer bytes than the smallest valid frame
   #[error("frame too short: expected at least {expected} bytes, got {actual}")]
   TooShort { expected: usize, actual: usize },

   /// Header length field disagrees with the number of bytes received
   #[error("length mismatch: header announces {declared} bytes, frame carries {actual}")]
   LengthMismatch { declared: usize, actual: usize },

   #[error("invalid checksum")]
   InvalidChecksum,

   #[error("payload of {len} bytes exceeds maximum of {max}")]
   TooLong { len: usize, max: usize },
}

/// Link-level header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
   pub sn: bool,
   pub nesn: bool,
   pub dest: Device,
   /// Only carried by Scheme B; always [`Device::Case`] when decoding Scheme A.
   pub src: Device,
}

impl Header {
   pub const fn new(sn: bool, nesn: bool, dest: Device, src: Device) -> Self {
      Self { sn, nesn, dest, src }
   }

   const fn first_byte(self) -> u8 {
      let mut b = (self.dest as u8) << DEST_SHIFT;
      if self.sn {
         b |= SN_BIT;
      }
      if self.nesn {
         b |= NESN_BIT;
      }
      b
   }
}

/// Number of header bytes preceding the payload.
pub const fn header_len(scheme: Scheme) -> usize {
   match scheme {
      Scheme::A => 1,
      Scheme::B => 2,
   }
}

/// Number of check bytes following the payload.
pub const fn crc_len(scheme: Scheme) -> usize {
   match scheme {
      Scheme::A => 1,
      Scheme::B => 2,
   }
}

/// Largest payload a single frame can carry.
pub const fn max_payload(scheme: Scheme) -> usize {
   match scheme {
      Scheme::A => LEN_MASK_A as usize - 1,
      Scheme::B => 0x3FF - 2,
   }
}

/// Builds a complete frame around `payload`.
pub fn encode(scheme: Scheme, header: Header, payload: &[u8]) -> Result<Packet, FrameError> {
   let max = max_payload(scheme);
   if payload.len() > max {
      return Err(FrameError::TooLong { len: payload.len(), max });
   }

   let len = payload.len() + crc_len(scheme);
   let mut frame = Packet::new();
   match scheme {
      Scheme::A => {
         frame.push(header.first_byte() | len as u8);
         frame.extend_from_slice(payload);
         let crc = crc::crc8(&frame);
         frame.push(crc);
      },
      Scheme::B => {
         let b0 = header.first_byte()
            | ((header.src as u8) << SRC_SHIFT)
            | ((len >> 8) as u8 & LEN_HI_MASK_B);
         frame.push(b0);
         frame.push(len as u8);
         frame.extend_from_slice(payload);
         let crc = crc::crc16(&frame);
         frame.extend_from_slice(&crc.to_be_bytes());
      },
   }
   Ok(frame)
}

/// Validates a frame and splits it into header and payload.
pub fn decode(scheme: Scheme, bytes: &[u8]) -> Result<(Header, &[u8]), FrameError> {
   let overhead = header_len(scheme) + crc_len(scheme);
   if bytes.len() < overhead {
      return Err(FrameError::TooShort {
         expected: overhead,
         actual: bytes.len(),
      });
   }

   let declared = frame_length(scheme, bytes).unwrap_or(0);
   if declared != bytes.len() || declared < overhead {
      return Err(FrameError::LengthMismatch {
         declared,
         actual: bytes.len(),
      });
   }

   let (body, check) = bytes.split_at(bytes.len() - crc_len(scheme));
   let valid = match scheme {
      Scheme::A => crc::crc8(body) == check[0],
      Scheme::B => crc::crc16(body) == u16::from_be_bytes([check[0], check[1]]),
   };
   if !valid {
      return Err(FrameError::InvalidChecksum);
   }

   let b0 = bytes[0];
   let src = match scheme {
      Scheme::A => Device::Case,
      Scheme::B => Device::from_bits(b0 >> SRC_SHIFT),
   };
   let header = Header {
      sn: b0 & SN_BIT != 0,
      nesn: b0 & NESN_BIT != 0,
      dest: Device::from_bits(b0 >> DEST_SHIFT),
      src,
   };
   Ok((header, &body[header_len(scheme)..]))
}

/// Total frame size announced by the header at the start of `bytes`, or
/// `None` when not enough of the header has arrived yet.
pub fn frame_length(scheme: Scheme, bytes: &[u8]) -> Option<usize> {
   match scheme {
      Scheme::A => bytes.first().map(|b0| usize::from(b0 & LEN_MASK_A) + 1),
      Scheme::B => {
         let [b0, b1, ..] = bytes else {
            return None;
         };
         let len = (usize::from(b0 & LEN_HI_MASK_B) << 8) | usize::from(*b1);
         Some(len + 2)
      },
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn case_header(sn: bool, nesn: bool, dest: Device) -> Header {
      Header::new(sn, nesn, dest, Device::Case)
   }

   #[test]
   fn test_encode_scheme_b() {
      let frame = encode(Scheme::B, case_header(false, false, Device::Broadcast), &[0x00, 0x01]).unwrap();
      assert_eq!(frame.as_slice(), &[0x30, 0x04, 0x00, 0x01, 0x9B, 0x37]);

      let frame = encode(Scheme::B, case_header(false, false, Device::Left), &[0x03]).unwrap();
      assert_eq!(frame.as_slice(), &[0x20, 0x03, 0x03, 0xD0, 0x95]);

      let frame = encode(Scheme::B, case_header(false, false, Device::Right), &[0x03]).unwrap();
      assert_eq!(frame.as_slice(), &[0x10, 0x03, 0x03, 0x15, 0x30]);

      let frame = encode(Scheme::B, case_header(true, true, Device::Left), &[]).unwrap();
      assert_eq!(frame.as_slice(), &[0xE0, 0x02, 0xD2, 0x00]);

      let frame = encode(Scheme::B, case_header(false, true, Device::Left), &[0x03]).unwrap();
      assert_eq!(frame.as_slice(), &[0x60, 0x03, 0x03, 0xCD, 0x38]);

      let frame =
         encode(Scheme::B, case_header(false, false, Device::Broadcast), &[0x00, 0x00, 0xE4, 0x21, 0x7F])
            .unwrap();
      assert_eq!(frame.as_slice(), &[0x30, 0x07, 0x00, 0x00, 0xE4, 0x21, 0x7F, 0x59, 0xA3]);
   }

   #[test]
   fn test_encode_scheme_a() {
      let frame = encode(Scheme::A, case_header(false, false, Device::Broadcast), &[0x00, 0x01]).unwrap();
      assert_eq!(frame.as_slice(), &[0x33, 0x00, 0x01, 0x3D]);

      let frame = encode(Scheme::A, case_header(false, false, Device::Left), &[0x03]).unwrap();
      assert_eq!(frame.as_slice(), &[0x22, 0x03, 0x0F]);

      let frame = encode(Scheme::A, case_header(true, true, Device::Left), &[]).unwrap();
      assert_eq!(frame.as_slice(), &[0xE1, 0xE1]);

      let frame = encode(Scheme::A, case_header(false, true, Device::Left), &[0x03]).unwrap();
      assert_eq!(frame.as_slice(), &[0x62, 0x03, 0x3B]);
   }

   #[test]
   fn test_encode_scheme_a_limit() {
      let payload = [0x00, 0x00, 0xE4, 0x21, 0x7F, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE];
      let frame = encode(Scheme::A, case_header(false, false, Device::Broadcast), &payload).unwrap();
      assert_eq!(frame[0], 0x3F);
      assert_eq!(frame[frame.len() - 1], 0x5D);

      let too_long = [0u8; 15];
      assert_eq!(
         encode(Scheme::A, case_header(false, false, Device::Broadcast), &too_long),
         Err(FrameError::TooLong { len: 15, max: 14 })
      );
   }

   #[test]
   fn test_encode_scheme_b_source_bits() {
      let header = Header::new(true, false, Device::Case, Device::Left);
      let frame = encode(Scheme::B, header, &[0x01, 0x00, 0x21]).unwrap();
      assert_eq!(frame[0], 0x88);

      let header = Header::new(true, false, Device::Case, Device::Right);
      let frame = encode(Scheme::B, header, &[]).unwrap();
      assert_eq!(frame[0], 0x84);
   }

   #[test]
   fn test_decode_scheme_b() {
      let (header, payload) = decode(Scheme::B, &[0x80, 0x05, 0x01, 0x00, 0x21, 0x73, 0x15]).unwrap();
      assert!(header.sn);
      assert!(!header.nesn);
      assert_eq!(header.dest, Device::Case);
      assert_eq!(payload, &[0x01, 0x00, 0x21]);

      let (header, payload) = decode(Scheme::B, &[0x40, 0x02, 0xCF, 0x7E]).unwrap();
      assert!(!header.sn);
      assert!(header.nesn);
      assert!(payload.is_empty());
   }

   #[test]
   fn test_decode_scheme_a() {
      let (header, payload) = decode(Scheme::A, &[0x84, 0x01, 0x00, 0x21, 0x94]).unwrap();
      assert!(header.sn);
      assert_eq!(header.dest, Device::Case);
      assert_eq!(payload, &[0x01, 0x00, 0x21]);

      let (header, payload) = decode(Scheme::A, &[0x41, 0xBB]).unwrap();
      assert!(header.nesn);
      assert!(payload.is_empty());
   }

   #[test]
   fn test_decode_rejects_corruption() {
      assert_eq!(decode(Scheme::B, &[0x40, 0x02, 0xCF, 0x7F]), Err(FrameError::InvalidChecksum));
      assert_eq!(decode(Scheme::B, &[0x40, 0x02, 0xDF, 0x7E]), Err(FrameError::InvalidChecksum));
      assert_eq!(decode(Scheme::B, &[0x60, 0x02, 0xCF, 0x7E]), Err(FrameError::InvalidChecksum));
      assert!(matches!(
         decode(Scheme::B, &[0x40, 0x00, 0xCF, 0x7E]),
         Err(FrameError::LengthMismatch { .. })
      ));
      assert!(matches!(decode(Scheme::B, &[0x40, 0x02, 0xCF]), Err(FrameError::TooShort { .. })));

      assert_eq!(decode(Scheme::A, &[0x41, 0xBA]), Err(FrameError::InvalidChecksum));
      assert_eq!(decode(Scheme::A, &[0x41, 0xFB]), Err(FrameError::InvalidChecksum));
      assert_eq!(decode(Scheme::A, &[0x61, 0xBB]), Err(FrameError::InvalidChecksum));
      assert!(matches!(decode(Scheme::A, &[0x40, 0xBB]), Err(FrameError::LengthMismatch { .. })));
   }

   #[test]
   fn test_frame_length_partial_header() {
      assert_eq!(frame_length(Scheme::B, &[0x80]), None);
      assert_eq!(frame_length(Scheme::B, &[0x80, 0x05]), Some(7));
      assert_eq!(frame_length(Scheme::A, &[0x84]), Some(5));
      assert_eq!(frame_length(Scheme::A, &[]), None);
   }
}
