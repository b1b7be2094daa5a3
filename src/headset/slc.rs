//! Service level connection: the AT session carried by the control channel.

use std::{future::Future, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use smallvec::SmallVec;
use tokio::{
   select,
   sync::{mpsc, watch},
   time::{self, Instant},
};

use crate::{
   bluetooth::host::{ControlSocket, HostStack},
   error::{HeadsetError, Result},
   headset::at::{AtCommand, AtResponse, LineBuffer, MAX_LINE, Unsolicited},
};

/// Audio link operations the AT session may trigger.
pub trait AudioControl: Sync {
   fn has_audio(&self) -> bool;

   /// Attempts to bring the audio link up. Failure is reported by the
   /// implementation and never ends the AT session.
   fn connect_audio(&self) -> impl Future<Output = ()> + Send;
}

/// One connected control channel and its line reassembly state.
pub struct ServiceLevelSession<C> {
   socket: C,
   address: Address,
   timeout: Duration,
   lines: LineBuffer,
}

/// Deadline after which audio is attempted without the peer having
/// enabled indicator reporting.
struct GracePeriod {
   deadline: Instant,
   notice: bool,
}

impl GracePeriod {
   fn new(grace: Duration) -> Self {
      Self {
         deadline: Instant::now() + grace,
         notice: true,
      }
   }

   /// The peer sent AT+CMER; later fallbacks are not its omission.
   fn indicators_enabled(&mut self) {
      self.notice = false;
   }

   /// `None` before the deadline, otherwise whether the skipped-CMER notice
   /// is still due. The notice is reported once.
   fn expired(&mut self) -> Option<bool> {
      if Instant::now() < self.deadline {
         return None;
      }
      Some(std::mem::take(&mut self.notice))
   }
}

enum Event {
   Received(Result<SmallVec<[AtCommand; 2]>>),
   Unsolicited(Unsolicited),
}

/// Connects the control channel to `channel` on `address`.
pub async fn connect<H: HostStack>(
   host: &H,
   address: Address,
   channel: u8,
   timeout: Duration,
) -> Result<ServiceLevelSession<H::Control>> {
   debug!("{address}: Connecting control channel {channel}");
   let socket = host.connect_control(address, channel).await?;
   info!("{address}: Service level connection is established on channel {channel}");
   Ok(ServiceLevelSession::new(socket, address, timeout))
}

impl<C: ControlSocket> ServiceLevelSession<C> {
   pub fn new(socket: C, address: Address, timeout: Duration) -> Self {
      Self {
         socket,
         address,
         timeout,
         lines: LineBuffer::new(),
      }
   }

   /// Waits up to the receive timeout for the next chunk and returns the
   /// commands it completes.
   pub async fn recv(&mut self) -> Result<SmallVec<[AtCommand; 2]>> {
      let mut buf = [0u8; MAX_LINE];
      let n = time::timeout(self.timeout, self.socket.recv(&mut buf))
         .await
         .map_err(|_| HeadsetError::Timeout)??;
      if n == 0 {
         return Err(HeadsetError::ConnectionClosed);
      }
      debug!("← {}: {}", self.address, buf[..n].escape_ascii());
      Ok(self.lines.push(&buf[..n]))
   }

   /// Sends `responses` framed, in one write.
   pub async fn send(&mut self, responses: &[AtResponse]) -> Result<()> {
      let mut out = Vec::with_capacity(64);
      for response in responses {
         response.encode_into(&mut out);
      }
      debug!("→ {}: {}", self.address, out.escape_ascii());
      self.socket.send(&out).await?;
      Ok(())
   }

   /// Answers commands until `stop` is raised or the channel fails.
   ///
   /// Once `grace` has passed since the session started, every iteration
   /// without an audio link attempts one, for peers that never enable
   /// indicator reporting.
   pub async fn run<A: AudioControl>(
      &mut self,
      audio: &A,
      grace: Duration,
      stop: &mut watch::Receiver<bool>,
      unsolicited: &mut mpsc::Receiver<Unsolicited>,
   ) -> Result<()> {
      let mut grace = GracePeriod::new(grace);

      loop {
         if *stop.borrow_and_update() {
            return Ok(());
         }

         let event = select! {
            _ = stop.wait_for(|stop| *stop) => return Ok(()),
            Some(code) = unsolicited.recv() => Event::Unsolicited(code),
            received = self.recv() => Event::Received(received),
         };

         match event {
            Event::Unsolicited(code) => {
               debug!("{}: Sending {code}", self.address);
               self.send(&[AtResponse::Unsolicited(code)]).await?;
            },
            Event::Received(Ok(commands)) => {
               for command in commands {
                  if self.dispatch(command, audio).await? {
                     grace.indicators_enabled();
                  }
               }
            },
            Event::Received(Err(HeadsetError::Timeout)) => {},
            Event::Received(Err(e)) => return Err(e),
         }

         if !audio.has_audio()
            && let Some(notice) = grace.expired()
         {
            if notice {
               warn!(
                  "{}: Service level connection timed out, trying audio anyway",
                  self.address
               );
            }
            audio.connect_audio().await;
         }
      }
   }

   /// Answers one command. Returns true if it enabled indicator reporting.
   async fn dispatch<A: AudioControl>(&mut self, command: AtCommand, audio: &A) -> Result<bool> {
      match &command {
         AtCommand::SupportedFeatures(features) => {
            debug!("{}: Peer features: {features:?}", self.address);
         },
         AtCommand::Unknown(line) => {
            warn!(
               "{}: {}",
               self.address,
               HeadsetError::ProtocolViolation(line.clone())
            );
         },
         AtCommand::Overlong => {
            warn!("{}: Discarded command longer than {MAX_LINE} bytes", self.address);
         },
         _ => {},
      }

      let reply = command.reply();
      self.send(&reply.responses).await?;
      if reply.connect_audio && !audio.has_audio() {
         audio.connect_audio().await;
      }
      Ok(reply.connect_audio)
   }
}

#[cfg(test)]
mod tests {
   use std::sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   };

   use tokio::task::JoinHandle;

   use super::*;
   use crate::bluetooth::host::mock::{MockHost, PeerControl};

   const GRACE: Duration = Duration::from_secs(10);

   #[derive(Default)]
   struct CountingAudio {
      establish: bool,
      connects: AtomicUsize,
      established: AtomicBool,
   }

   impl AudioControl for CountingAudio {
      fn has_audio(&self) -> bool {
         self.established.load(Ordering::SeqCst)
      }

      async fn connect_audio(&self) {
         self.connects.fetch_add(1, Ordering::SeqCst);
         if self.establish {
            self.established.store(true, Ordering::SeqCst);
         }
      }
   }

   struct Harness {
      peer: PeerControl,
      audio: Arc<CountingAudio>,
      stop: watch::Sender<bool>,
      ring: mpsc::Sender<Unsolicited>,
      task: JoinHandle<Result<()>>,
   }

   async fn start(establish: bool) -> Harness {
      let (host, mut peers) = MockHost::new(vec![]);
      let mut session = connect(&host, Address::any(), 4, Duration::from_secs(1))
         .await
         .unwrap();
      let peer = peers.recv().await.unwrap();
      assert_eq!(peer.channel, 4);

      let audio = Arc::new(CountingAudio {
         establish,
         ..Default::default()
      });
      let (stop, mut stop_rx) = watch::channel(false);
      let (ring, mut ring_rx) = mpsc::channel(4);
      let task = tokio::spawn({
         let audio = audio.clone();
         async move {
            session
               .run(&*audio, GRACE, &mut stop_rx, &mut ring_rx)
               .await
         }
      });
      Harness {
         peer,
         audio,
         stop,
         ring,
         task,
      }
   }

   impl Harness {
      fn connects(&self) -> usize {
         self.audio.connects.load(Ordering::SeqCst)
      }
   }

   #[tokio::test(start_paused = true)]
   async fn test_indicator_read() {
      let mut h = start(true).await;
      h.peer.send(b"AT+CIND?\r");
      assert_eq!(h.peer.expect().await, b"\r\n+CIND: 1,0\r\n\r\nOK\r\n");
      assert_eq!(h.connects(), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_event_reporting_connects_audio_once() {
      let mut h = start(true).await;
      h.peer.send(b"AT+BRSF=191\rAT+CMER=3,0,0,1\r");
      assert_eq!(h.peer.expect().await, b"\r\n+BRSF: 0\r\n\r\nOK\r\n");
      assert_eq!(h.peer.expect().await, b"\r\nOK\r\n");

      // a second CMER finds audio already up
      h.peer.send(b"AT+CMER=3,0,0,1\rAT+CHLD=?\r");
      assert_eq!(h.peer.expect().await, b"\r\nOK\r\n");
      assert_eq!(h.peer.expect().await, b"\r\n+CHLD: 0\r\n\r\nOK\r\n");
      assert_eq!(h.connects(), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_unknown_command_keeps_session() {
      let mut h = start(true).await;
      h.peer.send(b"AT+FOO\r");
      assert_eq!(h.peer.expect().await, b"\r\nERROR\r\n");
      h.peer.send(b"AT+CIND=?\r");
      assert_eq!(
         h.peer.expect().await,
         b"\r\n+CIND: (\"service\",(0,1)),(\"call\",(0,1))\r\n\r\nOK\r\n"
      );
      assert!(!h.task.is_finished());
   }

   #[tokio::test(start_paused = true)]
   async fn test_grace_period_fallback() {
      let h = start(true).await;
      time::sleep(Duration::from_secs(5)).await;
      assert_eq!(h.connects(), 0);
      time::sleep(Duration::from_secs(15)).await;
      assert_eq!(h.connects(), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_fallback_repeats_while_audio_fails() {
      let h = start(false).await;
      time::sleep(Duration::from_millis(13_500)).await;
      assert!(h.connects() >= 2, "only {} attempts", h.connects());
   }

   #[tokio::test(start_paused = true)]
   async fn test_grace_notice_once_without_cmer() {
      let mut grace = GracePeriod::new(GRACE);
      assert_eq!(grace.expired(), None);
      time::advance(GRACE).await;
      assert_eq!(grace.expired(), Some(true));
      assert_eq!(grace.expired(), Some(false));
   }

   #[tokio::test(start_paused = true)]
   async fn test_grace_notice_suppressed_after_cmer() {
      let mut grace = GracePeriod::new(GRACE);
      grace.indicators_enabled();
      time::advance(GRACE).await;
      assert_eq!(grace.expired(), Some(false));
   }

   #[tokio::test(start_paused = true)]
   async fn test_failed_cmer_audio_is_retried_by_fallback() {
      let mut h = start(false).await;
      h.peer.send(b"AT+CMER=3,0,0,1\r");
      assert_eq!(h.peer.expect().await, b"\r\nOK\r\n");
      assert_eq!(h.connects(), 1);
      time::sleep(Duration::from_millis(11_500)).await;
      assert!(h.connects() >= 2, "only {} attempts", h.connects());
   }

   #[tokio::test(start_paused = true)]
   async fn test_unsolicited_ring() {
      let mut h = start(true).await;
      h.ring.send(Unsolicited::Ring).await.unwrap();
      assert_eq!(h.peer.expect().await, b"\r\nRING\r\n");
   }

   #[tokio::test(start_paused = true)]
   async fn test_stop_ends_session() {
      let h = start(true).await;
      h.stop.send_replace(true);
      assert!(h.task.await.unwrap().is_ok());
   }

   #[tokio::test(start_paused = true)]
   async fn test_peer_hangup_is_an_error() {
      let h = start(true).await;
      drop(h.peer);
      assert!(matches!(
         h.task.await.unwrap(),
         Err(HeadsetError::ConnectionClosed)
      ));
   }
}
