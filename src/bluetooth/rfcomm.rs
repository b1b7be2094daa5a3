//! RFCOMM control channel.

use std::{io, time::Duration};

use bluer::{
   Address,
   rfcomm::{SocketAddr, Stream},
};
use log::debug;
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt},
   time,
};

use crate::{
   bluetooth::host::ControlSocket,
   error::{HeadsetError, LinkKind, Result},
};

/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connected RFCOMM stream to the peer's handsfree/headset service.
#[derive(Debug)]
pub struct RfcommSocket {
   stream: Stream,
}

pub async fn connect(address: Address, channel: u8) -> Result<RfcommSocket> {
   debug!("Connecting to {address} on RFCOMM channel {channel}");

   let stream = time::timeout(CONNECT_TIMEOUT, Stream::connect(SocketAddr::new(address, channel)))
      .await
      .map_err(|_| HeadsetError::connect_failed(LinkKind::Control, io::ErrorKind::TimedOut.into()))?
      .map_err(|e| HeadsetError::connect_failed(LinkKind::Control, e))?;

   Ok(RfcommSocket { stream })
}

impl ControlSocket for RfcommSocket {
   async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
      self.stream.read(buf).await
   }

   async fn send(&mut self, data: &[u8]) -> io::Result<()> {
      self.stream.write_all(data).await
   }
}
