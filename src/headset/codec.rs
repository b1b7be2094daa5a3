//! PCM conversion between the wire format and the extended format, and
//! tone synthesis.
//!
//! Rounding is half-to-even throughout.

use std::f64::consts::TAU;

/// Sample rate of the voice link.
pub const NATIVE_RATE: f64 = 8000.0;

/// Longest tone `Tone::synthesize` will render.
pub const MAX_TONE_MS: u32 = 60_000;

/// Sample formats accepted at the API boundary.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString,
)]
pub enum AudioFormat {
   /// 8 kHz, signed 8-bit, mono; what the link carries.
   #[default]
   #[strum(serialize = "native")]
   Native,
   /// 16 kHz, signed 16-bit little-endian, mono.
   #[strum(serialize = "extended")]
   Extended,
}

/// Converts native samples to the extended format.
///
/// Every input sample is scaled by 256 and emitted twice; the output is four
/// times as long as the input.
pub fn upsample(input: &[u8]) -> Vec<u8> {
   let mut out = Vec::with_capacity(input.len() * 4);
   for &byte in input {
      let sample = (i16::from(byte as i8) * 256).to_le_bytes();
      out.extend_from_slice(&sample);
      out.extend_from_slice(&sample);
   }
   out
}

/// Converts extended samples to the native format.
///
/// Each pair of 16-bit samples becomes `round((v1 + v2) / 512)`, clamped to
/// the signed 8-bit range. A trailing partial group of fewer than four bytes
/// is dropped.
pub fn downsample(input: &[u8]) -> Vec<u8> {
   input
      .chunks_exact(4)
      .map(|group| {
         let v1 = i32::from(i16::from_le_bytes([group[0], group[1]]));
         let v2 = i32::from(i16::from_le_bytes([group[2], group[3]]));
         let v = (f64::from(v1 + v2) / 512.0).round_ties_even();
         v.clamp(f64::from(i8::MIN), f64::from(i8::MAX)) as i8 as u8
      })
      .collect()
}

/// A sine beep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
   pub duration_ms: u32,
   pub frequency: f64,
   /// Clamped to `[0, 1]`.
   pub amplitude: f64,
}

impl Default for Tone {
   fn default() -> Self {
      Self {
         duration_ms: 300,
         frequency: 1000.0,
         amplitude: 0.5,
      }
   }
}

impl Tone {
   /// Synthesizes the tone as signed 16-bit little-endian samples at the
   /// native rate, or `None` if the frequency yields no whole period or the
   /// duration exceeds [`MAX_TONE_MS`].
   pub fn synthesize(&self) -> Option<Vec<u8>> {
      if self.duration_ms > MAX_TONE_MS {
         return None;
      }
      if !self.frequency.is_finite() || self.frequency <= 0.0 {
         return None;
      }
      let period = (NATIVE_RATE / self.frequency).round_ties_even() as usize;
      if period == 0 {
         return None;
      }
      let length =
         (NATIVE_RATE * f64::from(self.duration_ms) / 1000.0).round_ties_even() as usize;
      let amplitude = 32767.0 * self.amplitude.clamp(0.0, 1.0);

      let mut out = Vec::with_capacity(length * 2);
      for i in 0..length {
         let phase = (i % period) as f64 / period as f64;
         let sample = (amplitude * (TAU * phase).sin()).round_ties_even() as i16;
         out.extend_from_slice(&sample.to_le_bytes());
      }
      Some(out)
   }
}
