//! Self-healing Bluetooth Hands-Free/Headset bridge.
//!
//! Resolves a peer's control channel, answers its AT session, brings up the
//! SCO voice link and exposes it as a byte-oriented audio stream with
//! sample format conversion.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod headset;

pub use config::Config;
pub use error::{HeadsetError, Result};
pub use headset::{
   ConnectionState, Headset,
   codec::{AudioFormat, Tone},
};
