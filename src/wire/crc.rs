//! Frame check sequences for the two charger-comms schemes.

/// Scheme A check byte: CRC-8, polynomial 0x9B, reflected, seeded with 0xFF.
pub fn crc8(data: &[u8]) -> u8 {
   // 0xD9 is 0x9B bit-reversed.
   const POLY_REFLECTED: u8 = 0xD9;

   let mut crc = 0xFFu8;
   for &byte in data {
      crc ^= byte;
      for _ in 0..8 {
         crc = if crc & 1 != 0 {
            (crc >> 1) ^ POLY_REFLECTED
         } else {
            crc >> 1
         };
      }
   }
   crc
}

/// Scheme B check word: CRC-16/GENIBUS (poly 0x1021, init 0xFFFF, xorout 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
   const POLY: u16 = 0x1021;

   let mut crc = 0xFFFFu16;
   for &byte in data {
      crc ^= u16::from(byte) << 8;
      for _ in 0..8 {
         crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ POLY
         } else {
            crc << 1
         };
      }
   }
   crc ^ 0xFFFF
}
