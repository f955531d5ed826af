//! Text command interface.
//!
//! Two flavours share one parser: the plain debugging commands (`case`,
//! `config`, `earbud`) and the `AT+` commands used by test equipment. An
//! AT query ends in `?`, a set carries its parameters after `=`.

use log::{debug, warn};
use thiserror::Error;

use crate::{
   case::{CaseApp, CaseHardware, LoopbackRequest},
   ccp::InfoType,
   config::ConfigKey,
   sim::SimBus,
   wire::Earbud,
};

/// Outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum CliResult {
   Ok,
   Error,
   /// Accepted; the final result follows as report lines.
   Wait,
}

/// What a command prints before its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
   pub result: CliResult,
   pub lines: Vec<String>,
}

impl From<CliResult> for Reply {
   fn from(result: CliResult) -> Self {
      Self {
         result,
         lines: Vec::new(),
      }
   }
}

impl Reply {
   pub fn ok() -> Self {
      CliResult::Ok.into()
   }

   pub fn error() -> Self {
      CliResult::Error.into()
   }

   pub fn wait() -> Self {
      CliResult::Wait.into()
   }

   pub const fn ok_with(lines: Vec<String>) -> Self {
      Self {
         result: CliResult::Ok,
         lines,
      }
   }

   /// Output lines, terminated by the result unless it is still to come.
   pub fn into_lines(self) -> Vec<String> {
      let mut lines = self.lines;
      if self.result != CliResult::Wait {
         lines.push(self.result.to_string());
      }
      lines
   }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CliError {
   #[error("empty command")]
   Empty,

   #[error("unknown command {0:?}")]
   Unknown(String),

   #[error("missing {0}")]
   Missing(&'static str),

   #[error("invalid {name}: {value:?}")]
   Invalid { name: &'static str, value: String },
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
   /// `case`
   CaseInfo,
   /// `case status`
   CaseStatus,
   /// `case reset <e>`
   CaseReset(Earbud),
   /// `case loopback …` or `AT+LOOPBACK=…`
   Loopback(Earbud, LoopbackRequest),
   /// `config`
   ConfigShow,
   /// `AT+CONFIG?`
   ConfigQuery,
   /// `config <name>`
   ConfigGet(ConfigKey),
   /// `config <name> <value>` or `AT+CONFIG=<name>,<value>`
   ConfigSet(ConfigKey, String),
   /// `earbud`
   EarbudShow,
   EarbudNack(Earbud, u16),
   EarbudCorrupt(Earbud, u16),
   EarbudPresent(Earbud, bool),
   /// `AT+EBSTATUS` or `AT+EBSTATUS=<e>,<info>`
   EbStatus(Option<(Earbud, u8)>),
   Ship,
   LidQuery,
   BatteryQuery,
}

fn earbud(arg: Option<&str>) -> Result<Earbud, CliError> {
   let arg = arg.ok_or(CliError::Missing("earbud"))?;
   arg.parse().map_err(|_| CliError::Invalid {
      name: "earbud",
      value: arg.to_owned(),
   })
}

fn number<T: std::str::FromStr>(name: &'static str, arg: &str) -> Result<T, CliError> {
   arg.parse().map_err(|_| CliError::Invalid {
      name,
      value: arg.to_owned(),
   })
}

fn pattern(arg: Option<&str>) -> Result<u16, CliError> {
   let arg = arg.ok_or(CliError::Missing("pattern"))?;
   u16::from_str_radix(arg.trim_start_matches("0x"), 16).map_err(|_| CliError::Invalid {
      name: "pattern",
      value: arg.to_owned(),
   })
}

/// `<e> [iterations [length [hex data]]]`; an empty field is not given.
fn loopback<'a>(mut args: impl Iterator<Item = &'a str>) -> Result<Command, CliError> {
   let e = earbud(args.next())?;
   let mut next = || args.next().filter(|a| !a.is_empty());
   let mut req = LoopbackRequest::default();
   if let Some(arg) = next() {
      req.iterations = number("iterations", arg)?;
   }
   if let Some(arg) = next() {
      req.len = Some(number("length", arg)?);
   }
   if let Some(arg) = next() {
      req.data = Some(hex::decode(arg).map_err(|_| CliError::Invalid {
         name: "data",
         value: arg.to_owned(),
      })?);
   }
   Ok(Command::Loopback(e, req))
}

fn config_key(name: Option<&str>) -> Result<ConfigKey, CliError> {
   let name = name.ok_or(CliError::Missing("name"))?;
   name.parse().map_err(|_| CliError::Invalid {
      name: "name",
      value: name.to_owned(),
   })
}

fn config_set(name: Option<&str>, value: Option<&str>) -> Result<Command, CliError> {
   let key = config_key(name)?;
   let value = value.ok_or(CliError::Missing("value"))?;
   Ok(Command::ConfigSet(key, value.to_owned()))
}

fn parse_at(rest: &str) -> Result<Command, CliError> {
   let unknown = || CliError::Unknown(format!("AT+{rest}"));
   if let Some(name) = rest.strip_suffix('?') {
      return match name.to_ascii_uppercase().as_str() {
         "LID" => Ok(Command::LidQuery),
         "BATTERY" => Ok(Command::BatteryQuery),
         "CONFIG" => Ok(Command::ConfigQuery),
         _ => Err(unknown()),
      };
   }

   let (name, params) = rest.split_once('=').unwrap_or((rest, ""));
   let mut args = params.split(',').map(str::trim);
   match name.to_ascii_uppercase().as_str() {
      "EBSTATUS" if params.is_empty() => Ok(Command::EbStatus(None)),
      "EBSTATUS" => {
         let e = earbud(args.next())?;
         let info = match args.next() {
            Some(arg) => number("info type", arg)?,
            None => InfoType::BtAddress as u8,
         };
         Ok(Command::EbStatus(Some((e, info))))
      },
      "LOOPBACK" => loopback(args),
      "SHIP" => Ok(Command::Ship),
      "CONFIG" => config_set(args.next(), args.next()),
      _ => Err(unknown()),
   }
}

impl Command {
   pub fn parse(line: &str) -> Result<Self, CliError> {
      let line = line.trim();
      if line.is_empty() {
         return Err(CliError::Empty);
      }
      if let Some(rest) = line.strip_prefix("AT+").or_else(|| line.strip_prefix("at+")) {
         return parse_at(rest);
      }

      let mut words = line.split_whitespace();
      let unknown = || CliError::Unknown(line.to_owned());
      match words.next().map(str::to_ascii_lowercase).as_deref() {
         Some("case") => match words.next() {
            None => Ok(Self::CaseInfo),
            Some("status") => Ok(Self::CaseStatus),
            Some("reset") => Ok(Self::CaseReset(earbud(words.next())?)),
            Some("loopback") => loopback(words),
            Some(_) => Err(unknown()),
         },
         Some("config") => match (words.next(), words.next()) {
            (None, _) => Ok(Self::ConfigShow),
            (name, None) => config_key(name).map(Self::ConfigGet),
            (name, value) => config_set(name, value),
         },
         Some("earbud") => match words.next() {
            None => Ok(Self::EarbudShow),
            Some("nack") => Ok(Self::EarbudNack(earbud(words.next())?, pattern(words.next())?)),
            Some("corrupt") => Ok(Self::EarbudCorrupt(earbud(words.next())?, pattern(words.next())?)),
            Some("present") => {
               let e = earbud(words.next())?;
               match words.next() {
                  Some("1") => Ok(Self::EarbudPresent(e, true)),
                  Some("0") => Ok(Self::EarbudPresent(e, false)),
                  Some(other) => Err(CliError::Invalid {
                     name: "presence",
                     value: other.to_owned(),
                  }),
                  None => Err(CliError::Missing("presence")),
               }
            },
            Some(_) => Err(unknown()),
         },
         _ => Err(unknown()),
      }
   }
}

/// Parses and runs one command line against the case.
pub fn execute<H: CaseHardware>(app: &mut CaseApp<H, SimBus>, line: &str) -> Reply {
   let cmd = match Command::parse(line) {
      Ok(cmd) => cmd,
      Err(e) => {
         warn!("{e}");
         return Reply::error();
      },
   };
   debug!("Command {cmd:?}");

   match cmd {
      Command::CaseInfo => app.cmd_info(),
      Command::CaseStatus => app.cmd_status(),
      Command::CaseReset(e) => app.cmd_reset(e),
      Command::Loopback(e, req) => app.cmd_loopback(e, req),
      Command::ConfigShow => Reply::ok_with(app.config().display(true)),
      Command::ConfigQuery => Reply::ok_with(app.config().display(false)),
      Command::ConfigGet(key) => Reply::ok_with(vec![app.config().get(key)]),
      Command::ConfigSet(key, value) => {
         let mut config = app.config().clone();
         match config.set(key, &value) {
            Ok(()) => {
               *app.config_mut() = config;
               Reply::ok()
            },
            Err(e) => {
               warn!("{e}");
               Reply::error()
            },
         }
      },
      Command::EarbudShow => Reply::ok_with(app.comms().describe()),
      Command::EarbudNack(e, pattern) => {
         app.comms_mut().set_nack_pattern(e, pattern);
         Reply::ok()
      },
      Command::EarbudCorrupt(e, pattern) => {
         app.comms_mut().set_corrupt_pattern(e, pattern);
         Reply::ok()
      },
      Command::EarbudPresent(e, present) => {
         app.comms_mut().set_present(e, present);
         Reply::ok()
      },
      Command::EbStatus(target) => app.cmd_ebstatus(target),
      Command::Ship => app.cmd_ship(),
      Command::LidQuery => app.cmd_lid(),
      Command::BatteryQuery => app.cmd_battery(),
   }
}
