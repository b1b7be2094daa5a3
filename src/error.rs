//! Error types for the headset bridge.
//!
//! This module defines the error taxonomy of the connection lifecycle:
//! channel resolution, control and audio link failures, protocol
//! violations and configuration errors.

use std::io;

use bluer::Address;
use smol_str::SmolStr;
use thiserror::Error;

use crate::bluetooth::sdp::SdpError;

/// Which of the two links a connect attempt was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LinkKind {
   #[strum(serialize = "control")]
   Control,
   #[strum(serialize = "audio")]
   Audio,
}

/// Main error type for the headset bridge.
#[derive(Error, Debug)]
pub enum HeadsetError {
   #[error("No handsfree, headset or generic audio channel advertised by {0}")]
   ChannelNotFound(Address),

   #[error("Failed to establish {link} connection: {source}")]
   ConnectFailed {
      link: LinkKind,
      #[source]
      source: io::Error,
   },

   #[error("Request timeout")]
   Timeout,

   #[error("Unrecognized AT command: {0}")]
   ProtocolViolation(SmolStr),

   #[error("Transport error: {0}")]
   Transport(#[from] io::Error),

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("Service discovery error: {0}")]
   Sdp(#[from] SdpError),

   #[error("Negotiated audio MTU {0} leaves no room for payload")]
   InvalidMtu(u16),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl HeadsetError {
   /// Wraps an I/O error raised while connecting the given link.
   pub const fn connect_failed(link: LinkKind, source: io::Error) -> Self {
      Self::ConnectFailed { link, source }
   }
}

/// Convenience type alias for Results with `HeadsetError`.
pub type Result<T> = std::result::Result<T, HeadsetError>;
