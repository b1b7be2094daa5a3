//! Service discovery client.
//!
//! Queries a peer's SDP server over L2CAP for the records matching a
//! service UUID, and extracts each record's service classes and RFCOMM
//! channel.

use std::time::Duration;

use bluer::{
   Address, AddressType,
   l2cap::{Socket, SocketAddr},
};
use log::debug;
use smallvec::SmallVec;
use thiserror::Error;
use tokio::time;
use uuid::Uuid;

use crate::error::{HeadsetError, Result};

/// PSM of the SDP server
const PSM_SDP: u16 = 0x0001;
/// Default L2CAP MTU; responses never exceed it
const SDP_MTU: usize = 672;
/// Requested ceiling on attribute bytes per response
const MAX_ATTRIBUTE_BYTES: u16 = 600;
const MAX_CONTINUATION_LEN: usize = 16;
/// Bound on continuation round trips for one query
const MAX_ROUNDS: usize = 64;
/// Deepest sequence nesting accepted in a response
const MAX_NESTING: usize = 8;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

const PDU_ERROR_RSP: u8 = 0x01;
const PDU_SERVICE_SEARCH_ATTR_REQ: u8 = 0x06;
const PDU_SERVICE_SEARCH_ATTR_RSP: u8 = 0x07;
const PDU_HEADER_LEN: usize = 5;

pub const ATTR_SERVICE_CLASS_ID_LIST: u16 = 0x0001;
pub const ATTR_PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;

const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const BASE_UUID_MASK: u128 = (1 << 96) - 1;

/// Expands a 16-bit assigned number against the Bluetooth base UUID.
pub const fn uuid16(short: u16) -> Uuid {
   uuid32(short as u32)
}

/// Expands a 32-bit assigned number against the Bluetooth base UUID.
pub const fn uuid32(short: u32) -> Uuid {
   Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

pub const L2CAP_UUID: Uuid = uuid16(0x0100);
pub const RFCOMM_UUID: Uuid = uuid16(0x0003);

/// Error type for SDP PDU and data element parsing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SdpError {
   #[error("PDU too short: expected at least {expected} bytes, got {actual}")]
   Truncated { expected: usize, actual: usize },

   #[error("Unexpected PDU 0x{pdu:02x}")]
   UnexpectedPdu { pdu: u8 },

   #[error("Transaction id mismatch: sent {sent}, got {got}")]
   TransactionMismatch { sent: u16, got: u16 },

   #[error("Peer returned SDP error 0x{code:04x}")]
   ErrorResponse { code: u16 },

   #[error("Invalid continuation state length {len}")]
   InvalidContinuation { len: usize },

   #[error("Peer did not finish the response within {rounds} continuations")]
   TooManyContinuations { rounds: usize },

   #[error("Invalid data element: {reason}")]
   InvalidElement { reason: &'static str },
}

type SdpResult<T> = std::result::Result<T, SdpError>;

const fn truncated(expected: usize, actual: usize) -> SdpError {
   SdpError::Truncated { expected, actual }
}

/// A decoded SDP data element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataElement {
   Nil,
   Uint(u128),
   Int(i128),
   Uuid(Uuid),
   Text(Vec<u8>),
   Bool(bool),
   Sequence(Vec<DataElement>),
   Alternative(Vec<DataElement>),
   Url(Vec<u8>),
}

impl DataElement {
   /// Decodes one element from the front of `data`, returning it with the
   /// number of bytes consumed.
   pub fn parse(data: &[u8]) -> SdpResult<(Self, usize)> {
      Self::parse_nested(data, 0)
   }

   fn parse_nested(data: &[u8], depth: usize) -> SdpResult<(Self, usize)> {
      let Some(&descriptor) = data.first() else {
         return Err(truncated(1, 0));
      };
      let kind = descriptor >> 3;
      let size_index = descriptor & 0x07;

      if kind == 0 {
         return if size_index == 0 {
            Ok((Self::Nil, 1))
         } else {
            Err(SdpError::InvalidElement {
               reason: "nil with payload",
            })
         };
      }

      let (len, header_len): (usize, usize) = match size_index {
         0..=4 => (1usize << size_index, 1),
         5 => (usize::from(*data.get(1).ok_or(truncated(2, data.len()))?), 2),
         6 => {
            let bytes = data.get(1..3).ok_or(truncated(3, data.len()))?;
            (usize::from(u16::from_be_bytes([bytes[0], bytes[1]])), 3)
         },
         _ => {
            let bytes = data.get(1..5).ok_or(truncated(5, data.len()))?;
            let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            (len as usize, 5)
         },
      };
      let variable = size_index >= 5;

      let end = header_len
         .checked_add(len)
         .ok_or(SdpError::InvalidElement {
            reason: "length overflow",
         })?;
      let body = data.get(header_len..end).ok_or(truncated(end, data.len()))?;

      let element = match (kind, variable) {
         (1, false) => Self::Uint(be_uint(body)),
         (2, false) => {
            let shift = 128 - 8 * body.len() as u32;
            Self::Int(((be_uint(body) << shift) as i128) >> shift)
         },
         (3, false) => match body.len() {
            2 => Self::Uuid(uuid16(u16::from_be_bytes([body[0], body[1]]))),
            4 => Self::Uuid(uuid32(u32::from_be_bytes([
               body[0], body[1], body[2], body[3],
            ]))),
            16 => Self::Uuid(Uuid::from_u128(be_uint(body))),
            _ => {
               return Err(SdpError::InvalidElement {
                  reason: "uuid of unsupported width",
               });
            },
         },
         (5, false) if body.len() == 1 => Self::Bool(body[0] != 0),
         (4, true) => Self::Text(body.to_vec()),
         (8, true) => Self::Url(body.to_vec()),
         (6 | 7, true) => {
            if depth >= MAX_NESTING {
               return Err(SdpError::InvalidElement {
                  reason: "nesting too deep",
               });
            }
            let mut items = Vec::new();
            let mut rest = body;
            while !rest.is_empty() {
               let (item, used) = Self::parse_nested(rest, depth + 1)?;
               items.push(item);
               rest = &rest[used..];
            }
            if kind == 6 {
               Self::Sequence(items)
            } else {
               Self::Alternative(items)
            }
         },
         _ => {
            return Err(SdpError::InvalidElement {
               reason: "unknown type or size descriptor",
            });
         },
      };
      Ok((element, end))
   }

   pub const fn as_uint(&self) -> Option<u128> {
      match self {
         Self::Uint(v) => Some(*v),
         _ => None,
      }
   }

   pub const fn as_uuid(&self) -> Option<&Uuid> {
      match self {
         Self::Uuid(u) => Some(u),
         _ => None,
      }
   }

   /// Items of a sequence, or of the first choice of an alternative.
   pub fn as_sequence(&self) -> Option<&[Self]> {
      match self {
         Self::Sequence(items) => Some(items),
         Self::Alternative(choices) => choices.first()?.as_sequence(),
         _ => None,
      }
   }
}

fn be_uint(bytes: &[u8]) -> u128 {
   bytes.iter().fold(0, |acc, &b| (acc << 8) | u128::from(b))
}

/// One service record as far as channel selection cares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRecord {
   pub classes: SmallVec<[Uuid; 4]>,
   /// RFCOMM channel from the protocol descriptor list.
   pub port: Option<u8>,
}

impl ServiceRecord {
   fn from_attributes(attributes: &[DataElement]) -> Self {
      let mut record = Self::default();
      for pair in attributes.chunks_exact(2) {
         let Some(id) = pair[0].as_uint() else {
            continue;
         };
         match u16::try_from(id) {
            Ok(ATTR_SERVICE_CLASS_ID_LIST) => {
               record.classes = pair[1]
                  .as_sequence()
                  .unwrap_or_default()
                  .iter()
                  .filter_map(DataElement::as_uuid)
                  .copied()
                  .collect();
            },
            Ok(ATTR_PROTOCOL_DESCRIPTOR_LIST) => {
               record.port = rfcomm_channel(&pair[1]);
            },
            _ => {},
         }
      }
      record
   }
}

fn rfcomm_channel(descriptors: &DataElement) -> Option<u8> {
   descriptors.as_sequence()?.iter().find_map(|protocol| {
      let [uuid, channel, ..] = protocol.as_sequence()? else {
         return None;
      };
      if uuid.as_uuid() != Some(&RFCOMM_UUID) {
         return None;
      }
      u8::try_from(channel.as_uint()?).ok()
   })
}

/// Parses the concatenated attribute lists of a complete response.
pub fn parse_attribute_lists(data: &[u8]) -> SdpResult<Vec<ServiceRecord>> {
   let (element, used) = DataElement::parse(data)?;
   if used != data.len() {
      return Err(SdpError::InvalidElement {
         reason: "trailing bytes after attribute lists",
      });
   }
   let DataElement::Sequence(records) = element else {
      return Err(SdpError::InvalidElement {
         reason: "attribute lists are not a sequence",
      });
   };
   records
      .iter()
      .map(|record| match record {
         DataElement::Sequence(attributes) => Ok(ServiceRecord::from_attributes(attributes)),
         _ => Err(SdpError::InvalidElement {
            reason: "attribute list is not a sequence",
         }),
      })
      .collect()
}

fn push_uuid(out: &mut Vec<u8>, uuid: Uuid) {
   let value = uuid.as_u128();
   if value & BASE_UUID_MASK == BASE_UUID {
      let short = (value >> 96) as u32;
      if let Ok(short) = u16::try_from(short) {
         out.push(0x19);
         out.extend_from_slice(&short.to_be_bytes());
      } else {
         out.push(0x1a);
         out.extend_from_slice(&short.to_be_bytes());
      }
   } else {
      out.push(0x1c);
      out.extend_from_slice(uuid.as_bytes());
   }
}

/// Builds a ServiceSearchAttributeRequest for the class and protocol
/// descriptor attributes of every record matching `uuid`.
pub fn build_search_attr_request(tid: u16, uuid: Uuid, continuation: &[u8]) -> Vec<u8> {
   let mut pattern = Vec::with_capacity(17);
   push_uuid(&mut pattern, uuid);

   let mut params = Vec::with_capacity(32);
   params.extend_from_slice(&[0x35, pattern.len() as u8]);
   params.extend_from_slice(&pattern);
   params.extend_from_slice(&MAX_ATTRIBUTE_BYTES.to_be_bytes());
   params.extend_from_slice(&[0x35, 0x06, 0x09]);
   params.extend_from_slice(&ATTR_SERVICE_CLASS_ID_LIST.to_be_bytes());
   params.push(0x09);
   params.extend_from_slice(&ATTR_PROTOCOL_DESCRIPTOR_LIST.to_be_bytes());
   params.push(continuation.len() as u8);
   params.extend_from_slice(continuation);

   let mut pdu = Vec::with_capacity(PDU_HEADER_LEN + params.len());
   pdu.push(PDU_SERVICE_SEARCH_ATTR_REQ);
   pdu.extend_from_slice(&tid.to_be_bytes());
   pdu.extend_from_slice(&(params.len() as u16).to_be_bytes());
   pdu.extend_from_slice(&params);
   pdu
}

/// One fragment of a ServiceSearchAttributeResponse.
#[derive(Debug, PartialEq, Eq)]
pub struct AttributeFragment<'a> {
   pub lists: &'a [u8],
   pub continuation: &'a [u8],
}

/// Validates a response PDU against the request's transaction id.
pub fn parse_search_attr_response(pdu: &[u8], tid: u16) -> SdpResult<AttributeFragment<'_>> {
   if pdu.len() < PDU_HEADER_LEN {
      return Err(truncated(PDU_HEADER_LEN, pdu.len()));
   }
   let got = u16::from_be_bytes([pdu[1], pdu[2]]);
   let param_len = usize::from(u16::from_be_bytes([pdu[3], pdu[4]]));
   let params = pdu
      .get(PDU_HEADER_LEN..PDU_HEADER_LEN + param_len)
      .ok_or(truncated(PDU_HEADER_LEN + param_len, pdu.len()))?;

   match pdu[0] {
      PDU_SERVICE_SEARCH_ATTR_RSP => {},
      PDU_ERROR_RSP => {
         let code = params.get(..2).ok_or(truncated(PDU_HEADER_LEN + 2, pdu.len()))?;
         return Err(SdpError::ErrorResponse {
            code: u16::from_be_bytes([code[0], code[1]]),
         });
      },
      pdu => return Err(SdpError::UnexpectedPdu { pdu }),
   }
   if got != tid {
      return Err(SdpError::TransactionMismatch { sent: tid, got });
   }

   let count = params.get(..2).ok_or(truncated(PDU_HEADER_LEN + 2, pdu.len()))?;
   let count = usize::from(u16::from_be_bytes([count[0], count[1]]));
   let lists = params
      .get(2..2 + count)
      .ok_or(truncated(PDU_HEADER_LEN + 2 + count, pdu.len()))?;
   let cont_len = usize::from(
      *params
         .get(2 + count)
         .ok_or(truncated(PDU_HEADER_LEN + 3 + count, pdu.len()))?,
   );
   if cont_len > MAX_CONTINUATION_LEN {
      return Err(SdpError::InvalidContinuation { len: cont_len });
   }
   let continuation = params
      .get(3 + count..3 + count + cont_len)
      .ok_or(truncated(PDU_HEADER_LEN + 3 + count + cont_len, pdu.len()))?;

   Ok(AttributeFragment {
      lists,
      continuation,
   })
}

/// Queries `address` for every service record matching `uuid`.
pub async fn find_service(address: Address, uuid: Uuid) -> Result<Vec<ServiceRecord>> {
   debug!("{address}: Querying SDP records for {uuid}");

   let socket = Socket::new_seq_packet()?;
   let addr = SocketAddr::new(address, AddressType::BrEdr, PSM_SDP);
   let conn = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
      .await
      .map_err(|_| HeadsetError::Timeout)??;

   let mut lists = Vec::new();
   let mut continuation = heapless::Vec::<u8, MAX_CONTINUATION_LEN>::new();
   let mut buf = [0u8; SDP_MTU];

   for round in 0..MAX_ROUNDS {
      let tid = round as u16 + 1;
      let request = build_search_attr_request(tid, uuid, &continuation);
      debug!("→ {address}: {}", hex::encode(&request));
      conn.send(&request).await?;

      let n = time::timeout(RESPONSE_TIMEOUT, conn.recv(&mut buf))
         .await
         .map_err(|_| HeadsetError::Timeout)??;
      if n == 0 {
         return Err(HeadsetError::ConnectionClosed);
      }
      debug!("← {address}: {}", hex::encode(&buf[..n]));

      let fragment = parse_search_attr_response(&buf[..n], tid)?;
      lists.extend_from_slice(fragment.lists);
      if fragment.continuation.is_empty() {
         let records = parse_attribute_lists(&lists)?;
         debug!("{address}: {} SDP records", records.len());
         return Ok(records);
      }
      continuation = heapless::Vec::from_slice(fragment.continuation).map_err(|()| {
         SdpError::InvalidContinuation {
            len: fragment.continuation.len(),
         }
      })?;
   }

   Err(SdpError::TooManyContinuations { rounds: MAX_ROUNDS }.into())
}
