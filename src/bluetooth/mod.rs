//! Bluetooth host layer for the headset link.
//!
//! This module provides service discovery, the RFCOMM control channel, the
//! SCO voice channel and device scanning, behind the capability traits in
//! [`host`].

pub mod host;
pub mod rfcomm;
pub mod scan;
pub mod sco;
pub mod sdp;
