//! Discovery of nearby devices through BlueZ.

use std::{pin::pin, time::Duration};

use bluer::{AdapterEvent, Session};
use futures::StreamExt;
use log::{debug, info};
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{select, time};

use crate::error::Result;

/// A device seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
   pub address: SmolStr,
   pub name: Option<String>,
}

impl DiscoveredDevice {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.address.as_str(),
         "name": self.name,
      })
   }
}

/// Runs discovery on the default adapter for `duration`.
pub async fn scan(duration: Duration) -> Result<Vec<DiscoveredDevice>> {
   let session = Session::new().await?;
   let adapter = session.default_adapter().await?;
   if !adapter.is_powered().await? {
      adapter.set_powered(true).await?;
      info!("Powered on adapter: {}", adapter.name());
   }

   info!("Scanning on {} for {duration:?}", adapter.name());
   let mut events = pin!(adapter.discover_devices().await?);
   let mut deadline = pin!(time::sleep(duration));
   let mut addresses = Vec::new();

   loop {
      select! {
         () = &mut deadline => break,
         event = events.next() => match event {
            Some(AdapterEvent::DeviceAdded(addr)) => {
               if !addresses.contains(&addr) {
                  debug!("Discovered {addr}");
                  addresses.push(addr);
               }
            },
            Some(_) => {},
            None => break,
         },
      }
   }

   let mut devices = Vec::with_capacity(addresses.len());
   for addr in addresses {
      let name = match adapter.device(addr) {
         Ok(device) => device.name().await.ok().flatten(),
         Err(_) => None,
      };
      devices.push(DiscoveredDevice {
         address: addr.to_smolstr(),
         name,
      });
   }
   Ok(devices)
}
