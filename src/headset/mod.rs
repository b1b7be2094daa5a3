//! Self-healing handsfree/headset link.
//!
//! A [`Headset`] owns one background supervisor task that resolves the
//! peer's control channel, serves the AT session on it and brings up the
//! audio link once the peer asks for indicator reporting. Any failure tears
//! both links down and the cycle starts over after a cooldown.
//!
//! The audio session is published behind a short-held lock; `read` and
//! `write` clone it out and never hold the lock across I/O.

use std::{borrow::Cow, sync::Arc};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::{
   sync::{mpsc, watch},
   task::JoinHandle,
};

use crate::{
   bluetooth::host::{BluezHost, HostStack},
   config::Config,
   error::HeadsetError,
};

pub mod at;
pub mod audio;
pub mod codec;
pub mod resolver;
pub mod slc;
mod supervisor;

use at::Unsolicited;
use audio::AudioSession;
use codec::{AudioFormat, Tone};
use slc::AudioControl;

/// Pending unsolicited result codes per control session
const UNSOLICITED_QUEUE: usize = 8;

/// Lifecycle position of the link, in the order a healthy connection
/// passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, strum::Display)]
pub enum ConnectionState {
   #[default]
   Idle,
   ResolvingChannel,
   LinkConnecting,
   LinkEstablished,
   AudioConnecting,
   AudioEstablished,
}

/// State shared between the supervisor and the public handle.
struct Link<H: HostStack> {
   host: H,
   address: Address,
   config: Config,
   state: AtomicCell<ConnectionState>,
   audio: RwLock<Option<Arc<AudioSession<H::Audio>>>>,
}

impl<H: HostStack> Link<H> {
   fn new(host: H, address: Address, config: Config) -> Self {
      Self {
         host,
         address,
         config,
         state: AtomicCell::new(ConnectionState::Idle),
         audio: RwLock::new(None),
      }
   }

   fn set_state(&self, state: ConnectionState) {
      let previous = self.state.swap(state);
      if previous != state {
         debug!("{}: {previous} -> {state}", self.address);
      }
   }

   fn audio(&self) -> Option<Arc<AudioSession<H::Audio>>> {
      self.audio.read().clone()
   }

   fn teardown_audio(&self) {
      let session = self.audio.write().take();
      if let Some(session) = session {
         session.close();
      }
   }

   /// Drops `session` after an I/O failure, unless it was already replaced.
   fn drop_audio(&self, session: &Arc<AudioSession<H::Audio>>, err: &HeadsetError) {
      let removed = {
         let mut slot = self.audio.write();
         let current = slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session));
         if current {
            *slot = None;
         }
         current
      };
      if removed {
         warn!("{}: Audio link lost: {err}", self.address);
         let _ = self.state.compare_exchange(
            ConnectionState::AudioEstablished,
            ConnectionState::LinkEstablished,
         );
      }
      session.close();
   }
}

impl<H: HostStack> AudioControl for Link<H> {
   fn has_audio(&self) -> bool {
      self.audio.read().is_some()
   }

   async fn connect_audio(&self) {
      if self.has_audio() {
         return;
      }
      self.set_state(ConnectionState::AudioConnecting);
      match audio::connect(&self.host, self.address, self.config.voice_setting).await {
         Ok(session) => {
            *self.audio.write() = Some(Arc::new(session));
            self.set_state(ConnectionState::AudioEstablished);
         },
         Err(e) => {
            info!("{}: {e}", self.address);
            self.set_state(ConnectionState::LinkEstablished);
         },
      }
   }
}

/// Handle to a supervised connection with one handsfree/headset device.
///
/// Audio calls never fail loudly: a missing or broken audio link yields
/// `None` or `false`, and the supervisor restores it on its own.
pub struct Headset<H: HostStack = BluezHost> {
   link: Arc<Link<H>>,
   stop: watch::Sender<bool>,
   worker: Mutex<Option<JoinHandle<()>>>,
   unsolicited: mpsc::Sender<Unsolicited>,
}

impl Headset {
   /// Starts supervising `address` through BlueZ.
   ///
   /// Must be called within a tokio runtime.
   pub fn connect(address: Address, config: Config) -> Self {
      Self::with_host(BluezHost, address, config)
   }
}

impl<H: HostStack> Headset<H> {
   pub fn with_host(host: H, address: Address, config: Config) -> Self {
      let link = Arc::new(Link::new(host, address, config));
      let (stop, stop_rx) = watch::channel(false);
      let (unsolicited, unsolicited_rx) = mpsc::channel(UNSOLICITED_QUEUE);
      info!("{address}: Starting headset supervisor");
      let worker = tokio::spawn(supervisor::run(link.clone(), stop_rx, unsolicited_rx));
      Self {
         link,
         stop,
         worker: Mutex::new(Some(worker)),
         unsolicited,
      }
   }

   pub fn address(&self) -> Address {
      self.link.address
   }

   pub fn state(&self) -> ConnectionState {
      self.link.state.load()
   }

   /// True while an audio session exists.
   pub fn is_connected(&self) -> bool {
      self.link.has_audio()
   }

   /// Receives one audio frame, converted to `format`.
   pub async fn read(&self, format: AudioFormat) -> Option<Vec<u8>> {
      let session = self.link.audio()?;
      match session.recv().await {
         Ok(frame) => Some(match format {
            AudioFormat::Native => frame,
            AudioFormat::Extended => codec::upsample(&frame),
         }),
         Err(e) => {
            self.link.drop_audio(&session, &e);
            None
         },
      }
   }

   /// Sends `data`, given in `format`, as fixed-size frames.
   pub async fn write(&self, data: &[u8], format: AudioFormat) -> bool {
      let Some(session) = self.link.audio() else {
         return false;
      };
      let native = match format {
         AudioFormat::Native => Cow::Borrowed(data),
         AudioFormat::Extended => Cow::Owned(codec::downsample(data)),
      };
      match session.send_frames(&native).await {
         Ok(()) => true,
         Err(e) => {
            self.link.drop_audio(&session, &e);
            false
         },
      }
   }

   /// Plays `tone`. Its 16-bit samples go out as-is, without downsampling.
   pub async fn beep(&self, tone: Tone) -> bool {
      info!(
         "{}: Beep {} Hz, {} ms",
         self.link.address, tone.frequency, tone.duration_ms
      );
      let Some(samples) = tone.synthesize() else {
         return false;
      };
      self.write(&samples, AudioFormat::Native).await
   }

   /// Queues a RING for the peer. Fails without an established control
   /// session or when the queue is full.
   pub fn ring(&self) -> bool {
      self.state() >= ConnectionState::LinkEstablished
         && self.unsolicited.try_send(Unsolicited::Ring).is_ok()
   }

   /// Stops the supervisor, waits for it to exit and releases both links.
   /// Later calls return immediately.
   pub async fn close(&self) {
      self.stop.send_replace(true);
      let worker = self.worker.lock().take();
      if let Some(worker) = worker
         && let Err(e) = worker.await
      {
         warn!("{}: Supervisor task failed: {e}", self.link.address);
      }
      self.link.teardown_audio();
      self.link.set_state(ConnectionState::Idle);
   }
}

impl<H: HostStack> Drop for Headset<H> {
   fn drop(&mut self) {
      self.stop.send_replace(true);
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use smallvec::smallvec;
   use tokio::{sync::mpsc::UnboundedReceiver, time};

   use super::*;
   use crate::bluetooth::{
      host::mock::{MockHost, PeerControl},
      sdp::{ServiceRecord, uuid16},
   };

   fn handsfree(channel: u8) -> ServiceRecord {
      ServiceRecord {
         classes: smallvec![uuid16(0x111e)],
         port: Some(channel),
      }
   }

   fn start(config: Config) -> (Headset<MockHost>, MockHost, UnboundedReceiver<PeerControl>) {
      let (host, peers) = MockHost::new(vec![handsfree(2)]);
      let headset = Headset::with_host(host.clone(), Address::any(), config);
      (headset, host, peers)
   }

   async fn wait_until(mut cond: impl FnMut() -> bool) {
      for _ in 0..3000 {
         if cond() {
            return;
         }
         time::sleep(Duration::from_millis(10)).await;
      }
      panic!("condition not reached");
   }

   /// Brings the link up to an established audio session.
   async fn establish(peers: &mut UnboundedReceiver<PeerControl>) -> PeerControl {
      let mut peer = peers.recv().await.unwrap();
      assert_eq!(peer.channel, 2);
      peer.send(b"AT+CMER=3,0,0,1\r");
      assert_eq!(peer.expect().await, b"\r\nOK\r\n");
      peer
   }

   #[tokio::test(start_paused = true)]
   async fn test_indicator_read() {
      let (headset, _host, mut peers) = start(Config::default());
      let mut peer = peers.recv().await.unwrap();
      peer.send(b"AT+CIND?\r");
      assert_eq!(peer.expect().await, b"\r\n+CIND: 1,0\r\n\r\nOK\r\n");
      assert_eq!(headset.state(), ConnectionState::LinkEstablished);
      assert!(!headset.is_connected());
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_event_reporting_brings_audio_up() {
      let (headset, host, mut peers) = start(Config::default());
      let mut peer = establish(&mut peers).await;
      peer.send(b"AT+FOO\r");
      assert_eq!(peer.expect().await, b"\r\nERROR\r\n");

      assert_eq!(host.audio_attempts(), 1);
      assert!(headset.is_connected());
      assert_eq!(headset.state(), ConnectionState::AudioEstablished);
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_no_audio_means_no_data() {
      let (headset, _host, _peers) = start(Config::default());
      assert_eq!(headset.read(AudioFormat::Native).await, None);
      assert!(!headset.write(&[0; 48], AudioFormat::Native).await);
      assert!(!headset.beep(Tone::default()).await);
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_write_pads_last_frame() {
      let (headset, host, mut peers) = start(Config::default());
      let _peer = establish(&mut peers).await;
      wait_until(|| headset.is_connected()).await;

      assert!(headset.write(&[9; 40], AudioFormat::Native).await);
      let frames = host.sent_frames();
      assert_eq!(frames.len(), 1);
      assert_eq!(&frames[0][..40], &[9; 40]);
      assert_eq!(&frames[0][40..], &[0; 8]);
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_extended_format_conversion() {
      let (headset, host, mut peers) = start(Config::default());
      let _peer = establish(&mut peers).await;
      wait_until(|| headset.is_connected()).await;

      host.push_audio(&[1, 0xff]);
      assert_eq!(
         headset.read(AudioFormat::Extended).await,
         Some(vec![0x00, 0x01, 0x00, 0x01, 0x00, 0xff, 0x00, 0xff])
      );
      host.push_audio(&[3, 4]);
      assert_eq!(headset.read(AudioFormat::Native).await, Some(vec![3, 4]));

      // two samples of 512 become one native 2
      let extended = [0x00, 0x02, 0x00, 0x02];
      assert!(headset.write(&extended, AudioFormat::Extended).await);
      assert_eq!(host.sent_frames()[0][0], 2);
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_beep_is_sent_unconverted() {
      let (headset, host, mut peers) = start(Config::default());
      let _peer = establish(&mut peers).await;
      wait_until(|| headset.is_connected()).await;

      // 8000 samples of 2 bytes over 48-byte frames
      let tone = Tone {
         duration_ms: 1000,
         ..Tone::default()
      };
      assert!(headset.beep(tone).await);
      assert_eq!(host.sent_frames().len(), 334);

      let bad = Tone {
         frequency: 0.0,
         ..Tone::default()
      };
      assert!(!headset.beep(bad).await);
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_close_during_read() {
      let (headset, _host, mut peers) = start(Config::default());
      let _peer = establish(&mut peers).await;
      wait_until(|| headset.is_connected()).await;

      let headset = Arc::new(headset);
      let reader = tokio::spawn({
         let headset = headset.clone();
         async move { headset.read(AudioFormat::Native).await }
      });
      tokio::task::yield_now().await;

      headset.close().await;
      assert_eq!(reader.await.unwrap(), None);
      assert!(!headset.is_connected());
      assert_eq!(headset.state(), ConnectionState::Idle);
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_audio_failure_drops_session() {
      let (headset, host, mut peers) = start(Config::default());
      let _peer = establish(&mut peers).await;
      wait_until(|| headset.is_connected()).await;

      host.set_fail_audio_io(true);
      assert!(!headset.write(&[1; 48], AudioFormat::Native).await);
      assert!(!headset.is_connected());
      assert_eq!(host.open_audio_sockets(), 0);

      // the grace fallback restores it while the control link lives
      host.set_fail_audio_io(false);
      wait_until(|| headset.is_connected()).await;
      assert_eq!(host.audio_attempts(), 2);
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_grace_fallback_without_event_reporting() {
      let (headset, host, mut peers) = start(Config::default());
      let _peer = peers.recv().await.unwrap();
      time::sleep(Duration::from_secs(5)).await;
      assert_eq!(host.audio_attempts(), 0);

      wait_until(|| headset.is_connected()).await;
      assert_eq!(host.audio_attempts(), 1);
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_missing_channel_is_retried() {
      let (host, mut peers) = MockHost::new(vec![]);
      let headset = Headset::with_host(host.clone(), Address::any(), Config::default());
      time::sleep(Duration::from_millis(2500)).await;
      assert_eq!(host.lookups(), 3);
      assert_eq!(host.control_connects(), 0);

      host.set_records(vec![handsfree(6)]);
      let peer = peers.recv().await.unwrap();
      assert_eq!(peer.channel, 6);
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_peer_hangup_restarts_from_resolution() {
      let (headset, host, mut peers) = start(Config::default());
      let peer = establish(&mut peers).await;
      wait_until(|| headset.is_connected()).await;

      drop(peer);
      let mut peer = peers.recv().await.unwrap();
      assert_eq!(host.lookups(), 2);
      assert_eq!(host.open_audio_sockets(), 0);
      assert!(!headset.is_connected());

      peer.send(b"AT+CIND?\r");
      assert_eq!(peer.expect().await, b"\r\n+CIND: 1,0\r\n\r\nOK\r\n");
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_retry_limit_stops_supervisor() {
      let (host, _peers) = MockHost::new(vec![handsfree(2)]);
      host.set_refuse_control(true);
      let config = Config {
         retry_limit: Some(3),
         ..Config::default()
      };
      let headset = Headset::with_host(host.clone(), Address::any(), config);
      time::sleep(Duration::from_secs(30)).await;
      assert_eq!(host.control_connects(), 3);
      assert_eq!(headset.state(), ConnectionState::Idle);
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_ring() {
      let (headset, _host, mut peers) = start(Config::default());
      assert!(!headset.ring());

      let mut peer = peers.recv().await.unwrap();
      wait_until(|| headset.state() == ConnectionState::LinkEstablished).await;
      assert!(headset.ring());
      assert_eq!(peer.expect().await, b"\r\nRING\r\n");
      headset.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_close_is_idempotent() {
      let (headset, host, _peers) = start(Config::default());
      headset.close().await;
      headset.close().await;
      let lookups = host.lookups();
      time::sleep(Duration::from_secs(5)).await;
      assert_eq!(host.lookups(), lookups);
      assert!(!headset.ring());
   }
}
