//! PCM16 frame codec
//!
//! Converts between normalized `f32` samples and little-endian signed 16-bit
//! PCM, the wire format used in both directions of a voice session.

use crate::{Result, VoiceError};
use byteorder::{ByteOrder, LittleEndian};
use std::time::Duration;

/// Bytes per PCM16 sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Encode normalized samples as PCM16 little-endian bytes.
///
/// Samples are clamped to [-1.0, 1.0]; negative values scale by 32768 and
/// non-negative values by 32767, truncating toward zero.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let ints: Vec<i16> = samples.iter().map(|&s| sample_to_i16(s)).collect();
    let mut bytes = vec![0u8; ints.len() * BYTES_PER_SAMPLE];
    LittleEndian::write_i16_into(&ints, &mut bytes);
    bytes
}

/// Decode PCM16 little-endian bytes into normalized samples.
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(VoiceError::MalformedFrame { len: bytes.len() });
    }

    let mut ints = vec![0i16; bytes.len() / BYTES_PER_SAMPLE];
    LittleEndian::read_i16_into(bytes, &mut ints);
    Ok(ints.into_iter().map(|s| s as f32 / 32768.0).collect())
}

#[inline]
fn sample_to_i16(sample: f32) -> i16 {
    // NaN survives clamp; `as` maps it to 0
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// One immutable unit of PCM16 mono audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    bytes: Vec<u8>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Encode a block of normalized samples into a frame
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            bytes: encode(samples),
            sample_rate,
        }
    }

    /// Wrap raw PCM16 bytes, rejecting payloads with a dangling byte
    pub fn from_bytes(bytes: Vec<u8>, sample_rate: u32) -> Result<Self> {
        if bytes.len() % BYTES_PER_SAMPLE != 0 {
            return Err(VoiceError::MalformedFrame { len: bytes.len() });
        }
        Ok(Self { bytes, sample_rate })
    }

    /// Decode the frame back to normalized samples
    pub fn samples(&self) -> Vec<f32> {
        // Length was validated on construction
        decode(&self.bytes).unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Give up the frame, handing its payload to the transport
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_count(&self) -> usize {
        self.bytes.len() / BYTES_PER_SAMPLE
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Playback duration of the frame at its sample rate
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sample_count() as f64 / self.sample_rate as f64)
    }
}
