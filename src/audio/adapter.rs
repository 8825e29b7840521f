//! # Audio Frame Adapter
//!
//! Converts inbound float PCM into the 16-bit PCM the recognition engine expects.
//!
//! ## Conversion:
//! Each sample `s` maps to `round(s * 32767)` serialized little-endian. Samples outside
//! [-1.0, 1.0] are not clamped; they wrap the way a 16-bit integer truncation does and
//! the engine decides what to make of them.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

const I16_SCALE: f32 = 32767.0;

/// Sample encoding carried by an `AudioFrame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// 32-bit IEEE-754 float, as sent by clients
    Float32,
    /// 16-bit signed integer, as consumed by the engine
    Int16,
}

impl SampleEncoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::Float32 => 4,
            SampleEncoding::Int16 => 2,
        }
    }
}

/// Raw audio bytes tagged with their encoding.
///
/// Frames are transient: they live from the WebSocket read until the engine's
/// `feed` call returns.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    encoding: SampleEncoding,
    bytes: Vec<u8>,
}

impl AudioFrame {
    /// Wrap an inbound binary WebSocket payload.
    pub fn float32(bytes: Vec<u8>) -> Self {
        Self {
            encoding: SampleEncoding::Float32,
            bytes,
        }
    }

    pub fn encoding(&self) -> SampleEncoding {
        self.encoding
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sample_count(&self) -> usize {
        self.bytes.len() / self.encoding.bytes_per_sample()
    }

    /// Run the frame through the adapter, producing an `Int16` frame.
    ///
    /// Frames that are already 16-bit are returned unchanged.
    pub fn into_int16(self) -> Result<AudioFrame> {
        match self.encoding {
            SampleEncoding::Int16 => Ok(self),
            SampleEncoding::Float32 => {
                let samples = decode_float32(&self.bytes)?;
                Ok(AudioFrame {
                    encoding: SampleEncoding::Int16,
                    bytes: adapt(&samples),
                })
            }
        }
    }
}

/// Decode little-endian f32 PCM.
///
/// ## Errors:
/// A payload whose length is not a multiple of four cannot be split into samples
/// and is rejected whole rather than silently truncated.
pub fn decode_float32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(anyhow!(
            "float32 PCM payload of {} bytes is not a whole number of samples",
            bytes.len()
        ));
    }

    let mut samples = vec![0.0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(bytes, &mut samples);
    Ok(samples)
}

/// Convert normalized float samples to little-endian 16-bit PCM bytes.
///
/// Pure and deterministic; never fails.
pub fn adapt(samples: &[f32]) -> Vec<u8> {
    let converted: Vec<i16> = samples.iter().map(|&s| to_i16(s)).collect();
    let mut bytes = vec![0u8; converted.len() * 2];
    LittleEndian::write_i16_into(&converted, &mut bytes);
    bytes
}

#[inline]
fn to_i16(sample: f32) -> i16 {
    // f32 -> i32 saturates (NaN becomes 0); i32 -> i16 keeps the low 16 bits.
    (sample * I16_SCALE).round() as i32 as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_f32(samples: &[f32]) -> Vec<u8> {
        let mut bytes = vec![0u8; samples.len() * 4];
        LittleEndian::write_f32_into(samples, &mut bytes);
        bytes
    }

    fn decode_i16(bytes: &[u8]) -> Vec<i16> {
        let mut out = vec![0i16; bytes.len() / 2];
        LittleEndian::read_i16_into(bytes, &mut out);
        out
    }

    #[test]
    fn test_known_values() {
        let out = decode_i16(&adapt(&[0.0, 1.0, -1.0, 0.5, -0.5]));
        assert_eq!(out, vec![0, 32767, -32767, 16384, -16384]);
    }

    #[test]
    fn test_round_trip_within_one_step() {
        let step = 1.0 / I16_SCALE;
        for i in 0..=2000 {
            let s = -1.0 + i as f32 * 0.001;
            let back = decode_i16(&adapt(&[s]))[0] as f32 / I16_SCALE;
            assert!((back - s).abs() <= step, "{} came back as {}", s, back);
        }
    }

    #[test]
    fn test_out_of_range_is_not_clamped() {
        // 2.0 * 32767 = 65534, which truncates to -2 as a 16-bit integer.
        let out = decode_i16(&adapt(&[2.0]));
        assert_eq!(out, vec![-2]);
    }

    #[test]
    fn test_frame_adaptation() {
        let frame = AudioFrame::float32(encode_f32(&[0.25, -0.25, 0.0]));
        assert_eq!(frame.sample_count(), 3);

        let pcm = frame.into_int16().unwrap();
        assert_eq!(pcm.encoding(), SampleEncoding::Int16);
        assert_eq!(pcm.sample_count(), 3);
        assert_eq!(decode_i16(pcm.as_bytes()), vec![8192, -8192, 0]);
    }

    #[test]
    fn test_partial_sample_rejected() {
        assert!(decode_float32(&[0u8; 6]).is_err());
        assert!(AudioFrame::float32(vec![0u8; 7]).into_int16().is_err());
        assert!(decode_float32(&[]).unwrap().is_empty());
    }
}
