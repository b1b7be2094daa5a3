//! AT command parsing and response framing for the service level
//! connection.

use smallvec::{SmallVec, smallvec};
use smol_str::SmolStr;

/// Longest command line kept before it is discarded.
pub const MAX_LINE: usize = 1024;

pub const CIND_TEST: &str = "+CIND: (\"service\",(0,1)),(\"call\",(0,1))";
pub const CIND_READ: &str = "+CIND: 1,0";
pub const BRSF: &str = "+BRSF: 0";
pub const CHLD_TEST: &str = "+CHLD: 0";

/// Commands the handsfree unit may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand {
   /// `AT+BRSF=<features>`
   SupportedFeatures(Option<u32>),
   /// `AT+CIND=?`
   IndicatorsTest,
   /// `AT+CIND?`
   IndicatorsRead,
   /// `AT+CMER=<mode>,...`
   EventReporting(SmolStr),
   /// `AT+CHLD=?`
   CallHoldTest,
   /// A line longer than [`MAX_LINE`]
   Overlong,
   Unknown(SmolStr),
}

impl AtCommand {
   /// Parses one command line, without its terminator.
   pub fn parse(line: &[u8]) -> Self {
      let text = String::from_utf8_lossy(line);
      let text = text.trim();
      let upper = text.to_ascii_uppercase();

      if let Some(features) = upper.strip_prefix("AT+BRSF=") {
         return Self::SupportedFeatures(features.trim().parse().ok());
      }
      if let Some(params) = upper.strip_prefix("AT+CMER=") {
         return Self::EventReporting(params.into());
      }
      match upper.as_str() {
         "AT+CIND=?" => Self::IndicatorsTest,
         "AT+CIND?" => Self::IndicatorsRead,
         "AT+CHLD=?" => Self::CallHoldTest,
         _ => Self::Unknown(text.into()),
      }
   }

   /// The deterministic reply to this command.
   pub fn reply(&self) -> Reply {
      let responses = match self {
         Self::SupportedFeatures(_) => smallvec![AtResponse::Info(BRSF), AtResponse::Ok],
         Self::IndicatorsTest => smallvec![AtResponse::Info(CIND_TEST), AtResponse::Ok],
         Self::IndicatorsRead => smallvec![AtResponse::Info(CIND_READ), AtResponse::Ok],
         Self::EventReporting(_) => {
            return Reply {
               responses: smallvec![AtResponse::Ok],
               connect_audio: true,
            };
         },
         Self::CallHoldTest => smallvec![AtResponse::Info(CHLD_TEST), AtResponse::Ok],
         Self::Overlong | Self::Unknown(_) => smallvec![AtResponse::Error],
      };
      Reply {
         responses,
         connect_audio: false,
      }
   }
}

/// Unsolicited result codes the audio gateway may push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum Unsolicited {
   #[strum(serialize = "RING")]
   Ring,
}

/// One framed line sent to the handsfree unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtResponse {
   Info(&'static str),
   Ok,
   Error,
   Unsolicited(Unsolicited),
}

impl AtResponse {
   pub fn payload(&self) -> &'static str {
      match self {
         Self::Info(info) => *info,
         Self::Ok => "OK",
         Self::Error => "ERROR",
         Self::Unsolicited(code) => (*code).into(),
      }
   }

   /// Appends `\r\n<payload>\r\n`.
   pub fn encode_into(&self, out: &mut Vec<u8>) {
      out.extend_from_slice(b"\r\n");
      out.extend_from_slice(self.payload().as_bytes());
      out.extend_from_slice(b"\r\n");
   }
}

/// Responses to one command, and whether audio should be brought up after
/// they are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
   pub responses: SmallVec<[AtResponse; 2]>,
   pub connect_audio: bool,
}

/// Reassembles CR/LF-terminated command lines from arbitrary chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
   line: heapless::Vec<u8, MAX_LINE>,
   overflowed: bool,
}

impl LineBuffer {
   pub fn new() -> Self {
      Self::default()
   }

   /// Feeds a received chunk, returning every command it completes.
   pub fn push(&mut self, chunk: &[u8]) -> SmallVec<[AtCommand; 2]> {
      let mut commands = SmallVec::new();
      for &byte in chunk {
         if byte == b'\r' || byte == b'\n' {
            if self.overflowed {
               commands.push(AtCommand::Overlong);
            } else if !self.line.is_empty() {
               commands.push(AtCommand::parse(&self.line));
            }
            self.line.clear();
            self.overflowed = false;
         } else if !self.overflowed && self.line.push(byte).is_err() {
            self.overflowed = true;
         }
      }
      commands
   }
}
