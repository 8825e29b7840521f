//! # Transcription Module
//!
//! Speech recognition behind the relay, using Whisper models via the Candle-rs framework.
//!
//! ## Key Components:
//! - **Engine boundary**: the `RecognitionEngine` / `EngineFactory` traits the bridge drives
//! - **Recorder**: the bundled engine, voice-activity segmentation plus realtime partials
//! - **VAD**: Silero voice activity detection, with an energy gate fallback
//! - **Model Management**: resolving and loading Whisper weights
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest, the usual realtime model
//! - **base**: ~74MB, the default main model
//! - **small**: ~244MB, better accuracy
//! - **medium**: ~769MB, good technical vocabulary
//! - **large**: ~1550MB, best accuracy but slowest

pub mod engine;
pub mod factory;
pub mod model;
pub mod recorder;
#[cfg(feature = "vad")]
pub mod silero;
pub mod vad;

#[cfg(test)]
pub mod testing;

pub use engine::{EngineFactory, PartialCallback, RecognitionEngine};
pub use factory::WhisperEngineFactory;
pub use recorder::{Recorder, Transcriber};
pub use vad::{VadBackend, VoiceDetector};
