//! Background task driving the connection lifecycle.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::{
   select,
   sync::{mpsc, watch},
   time,
};

use crate::{
   bluetooth::{host::HostStack, sdp::L2CAP_UUID},
   error::{HeadsetError, Result},
   headset::{ConnectionState, Link, at::Unsolicited, resolver, slc},
};

/// Resolves, connects and serves the control channel, over and over, until
/// `stop` is raised or the retry limit is reached. Both sessions are torn
/// down after every cycle.
pub(super) async fn run<H: HostStack>(
   link: Arc<Link<H>>,
   mut stop: watch::Receiver<bool>,
   mut unsolicited: mpsc::Receiver<Unsolicited>,
) {
   let address = link.address;
   let mut failures = 0u32;

   while !*stop.borrow_and_update() {
      let mut cycle_stop = stop.clone();
      let result = select! {
         result = cycle(&link, &mut cycle_stop, &mut unsolicited, &mut failures) => result,
         _ = stop.wait_for(|stop| *stop) => Ok(()),
      };

      link.teardown_audio();
      link.set_state(ConnectionState::Idle);

      let Err(e) = result else {
         break;
      };
      match e {
         HeadsetError::ConnectionClosed => info!("{address}: Service level connection closed"),
         e => warn!("{address}: {e}"),
      }

      failures += 1;
      if let Some(limit) = link.config.retry_limit
         && failures >= limit
      {
         error!("{address}: Giving up after {failures} failed attempts");
         break;
      }

      select! {
         () = time::sleep(link.config.retry_cooldown()) => {},
         _ = stop.wait_for(|stop| *stop) => break,
      }
   }

   info!("{address}: Supervisor stopped");
}

/// One pass from channel resolution to the end of the AT session. Returns
/// `Ok` only when stopped.
async fn cycle<H: HostStack>(
   link: &Link<H>,
   stop: &mut watch::Receiver<bool>,
   unsolicited: &mut mpsc::Receiver<Unsolicited>,
   failures: &mut u32,
) -> Result<()> {
   let address = link.address;

   link.set_state(ConnectionState::ResolvingChannel);
   let records = link.host.find_service(address, L2CAP_UUID).await?;
   let selection =
      resolver::select_channel(&records).ok_or(HeadsetError::ChannelNotFound(address))?;
   info!(
      "{address}: Using {} channel {}",
      selection.class, selection.channel
   );

   link.set_state(ConnectionState::LinkConnecting);
   let mut session = slc::connect(
      &link.host,
      address,
      selection.channel,
      link.config.control_timeout(),
   )
   .await?;
   link.set_state(ConnectionState::LinkEstablished);
   *failures = 0;

   // codes queued for a previous session are stale
   while unsolicited.try_recv().is_ok() {}

   session
      .run(link, link.config.audio_grace(), stop, unsolicited)
      .await
}
