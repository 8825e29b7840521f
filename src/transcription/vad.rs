//! Voice activity detection.
//!
//! Silero VAD (ONNX, through `ort`) decides speech per 32 ms frame. When the model file is
//! missing, fails to load, or the crate is built without the `vad` feature, a mean-square
//! energy gate stands in for it.

use crate::audio::SAMPLE_RATE;
use crate::config::RecognitionConfig;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Frame length used for voice activity decisions (Silero's window at 16 kHz).
pub const FRAME_MS: u32 = 32;

/// Samples per VAD frame at the relay's sample rate.
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE * FRAME_MS / 1000) as usize;

/// Per-frame speech decision. Implementations may carry state across frames.
pub trait VoiceDetector: Send {
    /// `frame` is always exactly [`FRAME_SAMPLES`] long.
    fn is_voiced(&mut self, frame: &[f32]) -> Result<bool>;
}

/// Mean-square energy gate.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold_ms: f32,
}

impl EnergyVad {
    /// `rms_threshold` is the RMS level (full scale = 1.0) a frame needs to count as voiced.
    pub fn new(rms_threshold: f32) -> Self {
        Self {
            threshold_ms: rms_threshold * rms_threshold,
        }
    }
}

impl VoiceDetector for EnergyVad {
    fn is_voiced(&mut self, frame: &[f32]) -> Result<bool> {
        Ok(mean_square(frame) >= self.threshold_ms)
    }
}

fn mean_square(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32
}

/// Which detector new sessions get. Resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum VadBackend {
    Silero(PathBuf),
    Energy,
}

impl VadBackend {
    /// Use Silero when `vad_model` loads, otherwise fall back to the energy gate.
    pub fn resolve(config: &RecognitionConfig) -> Self {
        let path = Path::new(&config.vad_model);
        if !path.exists() {
            info!(
                "VAD model {} not found, using energy gate (rms >= {})",
                path.display(),
                config.energy_threshold
            );
            return VadBackend::Energy;
        }

        match load_silero(path, config.silero_sensitivity) {
            Ok(_) => {
                info!("Silero VAD loaded from {}", path.display());
                VadBackend::Silero(path.to_path_buf())
            }
            Err(e) => {
                warn!("Silero VAD unavailable, using energy gate: {:#}", e);
                VadBackend::Energy
            }
        }
    }

    /// A fresh detector for one session.
    pub fn build(&self, config: &RecognitionConfig) -> Result<Box<dyn VoiceDetector>> {
        match self {
            VadBackend::Silero(path) => load_silero(path, config.silero_sensitivity),
            VadBackend::Energy => Ok(Box::new(EnergyVad::new(config.energy_threshold))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VadBackend::Silero(_) => "silero",
            VadBackend::Energy => "energy",
        }
    }
}

#[cfg(feature = "vad")]
fn load_silero(path: &Path, sensitivity: f32) -> Result<Box<dyn VoiceDetector>> {
    Ok(Box::new(super::silero::SileroVad::load(path, sensitivity)?))
}

#[cfg(not(feature = "vad"))]
fn load_silero(path: &Path, _sensitivity: f32) -> Result<Box<dyn VoiceDetector>> {
    Err(anyhow::anyhow!(
        "cannot load {}: built without the `vad` feature",
        path.display()
    ))
}
