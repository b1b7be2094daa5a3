//! Control channel selection from a peer's service records.

use uuid::Uuid;

use crate::bluetooth::sdp::{ServiceRecord, uuid16};

/// Service classes that can carry the AT session, lowest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub enum ServiceClass {
   #[strum(serialize = "Generic audio")]
   GenericAudio,
   #[strum(serialize = "HSP")]
   Headset,
   #[strum(serialize = "HFP")]
   Handsfree,
}

impl ServiceClass {
   pub const fn uuid(self) -> Uuid {
      match self {
         Self::GenericAudio => uuid16(0x1203),
         Self::Headset => uuid16(0x1108),
         Self::Handsfree => uuid16(0x111e),
      }
   }

   pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
      [Self::Handsfree, Self::Headset, Self::GenericAudio]
         .into_iter()
         .find(|class| class.uuid() == *uuid)
   }
}

/// Resolved control channel and the class it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSelection {
   pub channel: u8,
   pub class: ServiceClass,
}

/// Picks the control channel: the first Handsfree record wins outright,
/// otherwise a Headset record, otherwise a GenericAudio one.
///
/// Records without an RFCOMM channel are ignored.
pub fn select_channel(records: &[ServiceRecord]) -> Option<ChannelSelection> {
   let mut headset = None;
   let mut generic = None;

   for record in records {
      let Some(channel) = record.port else {
         continue;
      };
      for class in record.classes.iter().filter_map(ServiceClass::from_uuid) {
         match class {
            ServiceClass::Handsfree => return Some(ChannelSelection { channel, class }),
            ServiceClass::Headset => headset = Some(channel),
            ServiceClass::GenericAudio => generic = Some(channel),
         }
      }
   }

   headset
      .map(|channel| ChannelSelection {
         channel,
         class: ServiceClass::Headset,
      })
      .or_else(|| {
         generic.map(|channel| ChannelSelection {
            channel,
            class: ServiceClass::GenericAudio,
         })
      })
}

#[cfg(test)]
mod tests {
   use smallvec::smallvec;

   use super::*;

   fn record(classes: &[ServiceClass], port: Option<u8>) -> ServiceRecord {
      ServiceRecord {
         classes: classes.iter().map(|c| c.uuid()).collect(),
         port,
      }
   }

   #[test]
   fn test_generic_audio_fallback() {
      let records = [record(&[ServiceClass::GenericAudio], Some(5))];
      assert_eq!(
         select_channel(&records),
         Some(ChannelSelection {
            channel: 5,
            class: ServiceClass::GenericAudio
         })
      );
   }

   #[test]
   fn test_handsfree_wins_regardless_of_order() {
      let records = [
         record(&[ServiceClass::Headset], Some(3)),
         record(&[ServiceClass::Handsfree], Some(7)),
      ];
      assert_eq!(select_channel(&records).map(|s| s.channel), Some(7));

      let reversed = [records[1].clone(), records[0].clone()];
      assert_eq!(select_channel(&reversed).map(|s| s.channel), Some(7));
   }

   #[test]
   fn test_headset_beats_generic() {
      let records = [
         record(&[ServiceClass::GenericAudio], Some(1)),
         record(&[ServiceClass::Headset, ServiceClass::GenericAudio], Some(2)),
      ];
      assert_eq!(
         select_channel(&records),
         Some(ChannelSelection {
            channel: 2,
            class: ServiceClass::Headset
         })
      );
   }

   #[test]
   fn test_no_channel() {
      assert_eq!(select_channel(&[]), None);

      let unrelated = ServiceRecord {
         classes: smallvec![uuid16(0x110a)],
         port: Some(4),
      };
      let portless = record(&[ServiceClass::Handsfree], None);
      assert_eq!(select_channel(&[unrelated, portless]), None);
   }

   #[test]
   fn test_priority_order() {
      assert!(ServiceClass::Handsfree > ServiceClass::Headset);
      assert!(ServiceClass::Headset > ServiceClass::GenericAudio);
      assert_eq!(
         ServiceClass::from_uuid(&uuid16(0x111e)),
         Some(ServiceClass::Handsfree)
      );
   }
}
