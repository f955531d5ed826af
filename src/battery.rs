//! Case battery measurement.
//!
//! A read is requested by the case application before each status exchange.
//! The monitor circuit needs time to settle, so a read takes a couple of
//! dozen ticks, and a reading under the cutoff is retried before it is
//! believed.

use log::{debug, warn};

/// Ticks for the monitor circuit to settle.
pub const READ_DELAY_TICKS: u16 = 20;
/// Ticks for the ADC conversion.
pub const ADC_DELAY_TICKS: u16 = 2;
/// Reads taken when the voltage is under the cutoff.
pub const CUTOFF_READS: u8 = 3;

/// Measured discharge curve: millivolts to percentage.
const LEVELS: [(u16, u8); 16] = [
   (3500, 0),
   (3627, 1),
   (3784, 5),
   (3803, 10),
   (3834, 15),
   (3860, 20),
   (3884, 25),
   (3897, 30),
   (3920, 40),
   (3949, 50),
   (3981, 60),
   (4018, 70),
   (4063, 80),
   (4115, 90),
   (4139, 95),
   (4160, 100),
];

/// Converts a cell voltage to a charge percentage, interpolating linearly
/// between the points of the discharge curve and rounding to nearest.
pub fn percentage(mv: u16) -> u8 {
   let (min_mv, _) = LEVELS[0];
   if mv <= min_mv {
      return 0;
   }
   for pair in LEVELS.windows(2) {
      let [(lo_mv, lo_pc), (hi_mv, hi_pc)] = [pair[0], pair[1]];
      if mv < hi_mv {
         let range_mv = u32::from(hi_mv - lo_mv);
         let range_pc = u32::from(hi_pc - lo_pc);
         let d_mv = u32::from(mv - lo_mv);
         let step = ((10 * range_pc * d_mv) / range_mv + 5) / 10;
         return lo_pc + step as u8;
      }
   }
   100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ReadState {
   #[default]
   Idle,
   Start,
   Settling(u16),
   Converting(u16),
   Done,
}

/// A completed battery read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
   pub mv: u16,
   pub percent: u8,
   /// Whether the read was asked for with an LED indication.
   pub led: bool,
   /// Readings stayed under the cutoff.
   pub low: bool,
}

#[derive(Debug, Default)]
pub struct BatteryMonitor {
   state: ReadState,
   led: bool,
   low_reads: u8,
   mv: u16,
   percent: u8,
}

impl BatteryMonitor {
   pub fn new() -> Self {
      Self::default()
   }

   /// Starts a read unless one is already running. Asking for the LED joins
   /// a running read.
   pub fn request(&mut self, led: bool) {
      match self.state {
         ReadState::Idle | ReadState::Done => {
            self.state = ReadState::Start;
            self.led = led;
         },
         _ => self.led |= led,
      }
   }

   pub fn read_done(&self) -> bool {
      self.state == ReadState::Done
   }

   /// Percentage from the last completed read.
   pub const fn percent(&self) -> u8 {
      self.percent
   }

   pub const fn mv(&self) -> u16 {
      self.mv
   }

   /// Advances the read. `sample_mv` is what the ADC would see right now.
   pub fn periodic(&mut self, sample_mv: u16, cutoff_mv: u16) -> Option<Reading> {
      match self.state {
         ReadState::Start => {
            self.low_reads = 0;
            self.state = ReadState::Settling(READ_DELAY_TICKS);
         },
         ReadState::Settling(0) => self.state = ReadState::Converting(ADC_DELAY_TICKS),
         ReadState::Settling(n) => self.state = ReadState::Settling(n - 1),
         ReadState::Converting(0) => {
            self.mv = sample_mv;
            self.percent = percentage(sample_mv);

            let low = sample_mv < cutoff_mv;
            if low {
               self.low_reads += 1;
               if self.low_reads < CUTOFF_READS {
                  debug!("Battery reading {sample_mv}mV under cutoff, reading again");
                  self.state = ReadState::Settling(0);
                  return None;
               }
               warn!("Case battery low: {sample_mv}mV");
            }

            self.state = ReadState::Done;
            return Some(Reading {
               mv: self.mv,
               percent: self.percent,
               led: self.led,
               low,
            });
         },
         ReadState::Converting(n) => self.state = ReadState::Converting(n - 1),
         ReadState::Idle | ReadState::Done => {},
      }
      None
   }
}
