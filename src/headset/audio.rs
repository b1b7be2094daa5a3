//! Audio link establishment and the framed audio session.

use std::{io, time::Duration};

use bluer::Address;
use log::{debug, info};
use tokio::{select, sync::watch, time};

use crate::{
   bluetooth::{
      host::{AudioSocket, HostStack},
      sco::VoiceSetting,
   },
   error::{HeadsetError, LinkKind, Result},
};

/// Bytes of every negotiated MTU reserved for the transport header
pub const SCO_HEADER_SIZE: usize = 16;
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An established audio link with its fixed frame size.
#[derive(Debug)]
pub struct AudioSession<A> {
   socket: A,
   payload_size: usize,
   closed: watch::Sender<bool>,
}

/// Opens an audio socket, applies `voice` and connects it to `address`.
///
/// Failure is expected while the peer has not yet enabled indicator
/// reporting; the socket is released on every error path.
pub async fn connect<H: HostStack>(
   host: &H,
   address: Address,
   voice: VoiceSetting,
) -> Result<AudioSession<H::Audio>> {
   let connect_failed = |e: io::Error| HeadsetError::connect_failed(LinkKind::Audio, e);

   let socket = host.open_audio().map_err(connect_failed)?;
   socket.set_voice(voice).map_err(connect_failed)?;
   time::timeout(CONNECT_TIMEOUT, socket.connect(address))
      .await
      .map_err(|_| connect_failed(io::ErrorKind::TimedOut.into()))?
      .map_err(connect_failed)?;

   let mtu = socket.mtu()?;
   let payload_size = usize::from(mtu)
      .checked_sub(SCO_HEADER_SIZE)
      .filter(|size| *size > 0)
      .ok_or(HeadsetError::InvalidMtu(mtu))?;
   info!("{address}: Audio connection is established, mtu = {mtu}");

   Ok(AudioSession::new(socket, payload_size))
}

impl<A: AudioSocket> AudioSession<A> {
   pub fn new(socket: A, payload_size: usize) -> Self {
      Self {
         socket,
         payload_size,
         closed: watch::channel(false).0,
      }
   }

   pub const fn payload_size(&self) -> usize {
      self.payload_size
   }

   pub fn is_closed(&self) -> bool {
      *self.closed.borrow()
   }

   /// Receives one frame of at most `payload_size` bytes.
   pub async fn recv(&self) -> Result<Vec<u8>> {
      let mut closed = self.closed.subscribe();
      if *closed.borrow() {
         return Err(HeadsetError::ConnectionClosed);
      }

      let mut frame = vec![0u8; self.payload_size];
      let n = select! {
         n = self.socket.recv(&mut frame) => n?,
         _ = closed.wait_for(|closed| *closed) => return Err(HeadsetError::ConnectionClosed),
      };
      if n == 0 {
         return Err(HeadsetError::ConnectionClosed);
      }
      frame.truncate(n);
      Ok(frame)
   }

   /// Sends `data` as consecutive `payload_size` frames, zero-padding the
   /// last one. Fails unless every frame is accepted whole.
   pub async fn send_frames(&self, data: &[u8]) -> Result<()> {
      let mut closed = self.closed.subscribe();
      let mut padded = vec![0u8; self.payload_size];

      for chunk in data.chunks(self.payload_size) {
         if *closed.borrow() {
            return Err(HeadsetError::ConnectionClosed);
         }
         let frame = if chunk.len() == self.payload_size {
            chunk
         } else {
            padded[..chunk.len()].copy_from_slice(chunk);
            padded[chunk.len()..].fill(0);
            &padded[..]
         };

         let sent = select! {
            sent = self.socket.send(frame) => sent?,
            _ = closed.wait_for(|closed| *closed) => return Err(HeadsetError::ConnectionClosed),
         };
         if sent != frame.len() {
            return Err(io::Error::new(
               io::ErrorKind::WriteZero,
               format!("audio frame truncated to {sent} of {} bytes", frame.len()),
            )
            .into());
         }
      }
      Ok(())
   }

   /// Shuts the link down and wakes any pending `recv`/`send_frames`.
   /// Repeated calls are no-ops.
   pub fn close(&self) {
      if !self.closed.send_replace(true) {
         debug!("Closing audio session");
         self.socket.shutdown();
      }
   }
}

impl<A> Drop for AudioSession<A> {
   fn drop(&mut self) {
      self.closed.send_replace(true);
   }
}
