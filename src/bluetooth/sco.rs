//! SCO socket for the synchronous voice link.
//!
//! BlueZ exposes SCO only through the raw kernel socket API, so this module
//! drives the socket with `libc` and registers it with the tokio reactor.

use std::{
   io, mem,
   os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use bluer::Address;
use libc::{c_int, c_void, socklen_t};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::io::unix::AsyncFd;

use crate::bluetooth::host::AudioSocket;

const BTPROTO_SCO: c_int = 2;
const SOL_BLUETOOTH: c_int = 274;
const SOL_SCO: c_int = 17;
const BT_VOICE: c_int = 11;
const SCO_OPTIONS: c_int = 1;

#[repr(C)]
struct SockaddrSco {
   sco_family: libc::sa_family_t,
   sco_bdaddr: [u8; 6],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct BtVoice {
   setting: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ScoOptions {
   mtu: u16,
}

/// Air-mode setting applied to the SCO socket before connecting.
#[repr(u16)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum VoiceSetting {
   /// CVSD air mode with 16-bit linear input coding
   #[default]
   #[strum(serialize = "cvsd16bit")]
   Cvsd16Bit = 0x0060,
   /// Transparent air mode, host supplies the encoded stream
   #[strum(serialize = "transparent")]
   Transparent = 0x0003,
}

/// Non-blocking SCO socket registered with the tokio reactor.
#[derive(Debug)]
pub struct ScoSocket {
   fd: AsyncFd<OwnedFd>,
}

impl ScoSocket {
   pub fn new() -> io::Result<Self> {
      // SAFETY: plain socket(2) call, the result is checked below.
      let raw = unsafe {
         libc::socket(
            libc::AF_BLUETOOTH,
            libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            BTPROTO_SCO,
         )
      };
      if raw < 0 {
         return Err(io::Error::last_os_error());
      }
      // SAFETY: `raw` is a freshly created descriptor nobody else owns.
      let fd = unsafe { OwnedFd::from_raw_fd(raw) };
      Ok(Self {
         fd: AsyncFd::new(fd)?,
      })
   }

   fn raw(&self) -> RawFd {
      self.fd.as_raw_fd()
   }
}

impl AudioSocket for ScoSocket {
   fn set_voice(&self, setting: VoiceSetting) -> io::Result<()> {
      setsockopt(
         self.raw(),
         SOL_BLUETOOTH,
         BT_VOICE,
         &BtVoice {
            setting: setting as u16,
         },
      )
   }

   async fn connect(&self, address: Address) -> io::Result<()> {
      // bdaddr_t is little-endian
      let mut bdaddr = address.0;
      bdaddr.reverse();
      let sa = SockaddrSco {
         sco_family: libc::AF_BLUETOOTH as libc::sa_family_t,
         sco_bdaddr: bdaddr,
      };

      debug!("Connecting SCO to {address}");
      // SAFETY: `sa` is a valid sockaddr_sco for the duration of the call.
      let rc = unsafe {
         libc::connect(
            self.raw(),
            (&raw const sa).cast(),
            mem::size_of::<SockaddrSco>() as socklen_t,
         )
      };
      if rc == 0 {
         return Ok(());
      }
      let err = io::Error::last_os_error();
      if err.raw_os_error() != Some(libc::EINPROGRESS) {
         return Err(err);
      }

      // Readiness stays set so the first send does not wait for a new edge.
      let _guard = self.fd.writable().await?;
      match getsockopt::<c_int>(self.raw(), libc::SOL_SOCKET, libc::SO_ERROR)? {
         0 => Ok(()),
         errno => Err(io::Error::from_raw_os_error(errno)),
      }
   }

   fn mtu(&self) -> io::Result<u16> {
      getsockopt::<ScoOptions>(self.raw(), SOL_SCO, SCO_OPTIONS).map(|opts| opts.mtu)
   }

   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
      loop {
         let mut guard = self.fd.readable().await?;
         let result = guard.try_io(|fd| {
            // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
            let n = unsafe {
               libc::recv(
                  fd.as_raw_fd(),
                  buf.as_mut_ptr().cast::<c_void>(),
                  buf.len(),
                  0,
               )
            };
            if n < 0 {
               Err(io::Error::last_os_error())
            } else {
               Ok(n as usize)
            }
         });
         if let Ok(result) = result {
            return result;
         }
      }
   }

   async fn send(&self, data: &[u8]) -> io::Result<usize> {
      loop {
         let mut guard = self.fd.writable().await?;
         let result = guard.try_io(|fd| {
            // SAFETY: `data` is valid for reads of `data.len()` bytes.
            let n = unsafe {
               libc::send(
                  fd.as_raw_fd(),
                  data.as_ptr().cast::<c_void>(),
                  data.len(),
                  libc::MSG_NOSIGNAL,
               )
            };
            if n < 0 {
               Err(io::Error::last_os_error())
            } else {
               Ok(n as usize)
            }
         });
         if let Ok(result) = result {
            return result;
         }
      }
   }

   fn shutdown(&self) {
      // SAFETY: shutdown(2) on a descriptor we own; failure is harmless.
      unsafe {
         libc::shutdown(self.raw(), libc::SHUT_RDWR);
      }
   }
}

fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
   // SAFETY: `value` points to a live `T` of exactly the advertised size.
   let rc = unsafe {
      libc::setsockopt(
         fd,
         level,
         name,
         (value as *const T).cast::<c_void>(),
         mem::size_of::<T>() as socklen_t,
      )
   };
   if rc < 0 {
      Err(io::Error::last_os_error())
   } else {
      Ok(())
   }
}

/// Only instantiated with integer-only `repr(C)` types, for which the
/// all-zero pattern is a valid value.
fn getsockopt<T: Copy>(fd: RawFd, level: c_int, name: c_int) -> io::Result<T> {
   let mut value = mem::MaybeUninit::<T>::zeroed();
   let mut len = mem::size_of::<T>() as socklen_t;
   // SAFETY: `value` has room for `len` bytes.
   let rc = unsafe { libc::getsockopt(fd, level, name, value.as_mut_ptr().cast(), &raw mut len) };
   if rc < 0 {
      return Err(io::Error::last_os_error());
   }
   // SAFETY: zero-initialised above and partially overwritten by the kernel.
   Ok(unsafe { value.assume_init() })
}
