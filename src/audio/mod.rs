//! # Audio Module
//!
//! Inbound audio arrives as raw little-endian 32-bit float PCM (mono, 16 kHz, samples
//! normalized to [-1.0, 1.0]). The recognition engine consumes 16-bit signed PCM, so
//! every binary WebSocket frame passes through the Audio Frame Adapter before it is fed.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **Ingress**: f32 little-endian, no header
//! - **Engine**: i16 little-endian

pub mod adapter;

pub use adapter::{adapt, decode_float32, AudioFrame, SampleEncoding};

/// Sample rate shared by the wire protocol and the Whisper models.
pub const SAMPLE_RATE: u32 = 16_000;
