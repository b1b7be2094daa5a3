//! Host stack capabilities consumed by the headset link.
//!
//! The connection lifecycle never touches sockets directly; it goes through
//! these traits so that the BlueZ implementation can be swapped for a
//! scripted one in tests.

use std::{future::Future, io};

use bluer::Address;
use uuid::Uuid;

use crate::{
   bluetooth::{
      rfcomm::{self, RfcommSocket},
      sco::{ScoSocket, VoiceSetting},
      sdp::{self, ServiceRecord},
   },
   error::Result,
};

/// Connected control channel carrying the AT session.
pub trait ControlSocket: Send + 'static {
   /// Receives up to `buf.len()` bytes; `Ok(0)` means the peer hung up.
   fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

   fn send(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// Synchronous voice channel.
pub trait AudioSocket: Send + Sync + 'static {
   /// Must be applied before `connect`.
   fn set_voice(&self, setting: VoiceSetting) -> io::Result<()>;

   fn connect(&self, address: Address) -> impl Future<Output = io::Result<()>> + Send;

   fn mtu(&self) -> io::Result<u16>;

   fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

   fn send(&self, data: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

   /// Shuts the socket down in both directions, waking pending receivers.
   fn shutdown(&self);
}

/// Service discovery plus socket factories of the Bluetooth host.
pub trait HostStack: Send + Sync + 'static {
   type Control: ControlSocket;
   type Audio: AudioSocket;

   fn find_service(
      &self,
      address: Address,
      uuid: Uuid,
   ) -> impl Future<Output = Result<Vec<ServiceRecord>>> + Send;

   fn connect_control(
      &self,
      address: Address,
      channel: u8,
   ) -> impl Future<Output = Result<Self::Control>> + Send;

   fn open_audio(&self) -> io::Result<Self::Audio>;
}

/// Host stack backed by the Linux kernel Bluetooth sockets and BlueZ.
#[derive(Debug, Default, Clone, Copy)]
pub struct BluezHost;

impl HostStack for BluezHost {
   type Control = RfcommSocket;
   type Audio = ScoSocket;

   async fn find_service(&self, address: Address, uuid: Uuid) -> Result<Vec<ServiceRecord>> {
      sdp::find_service(address, uuid).await
   }

   async fn connect_control(&self, address: Address, channel: u8) -> Result<RfcommSocket> {
      rfcomm::connect(address, channel).await
   }

   fn open_audio(&self) -> io::Result<ScoSocket> {
      ScoSocket::new()
   }
}
