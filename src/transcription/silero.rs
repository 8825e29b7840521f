//! Silero VAD v5 through ONNX Runtime.
//!
//! The model is stateful: each call takes 512 new samples preceded by the last 64 samples
//! of the previous frame, plus the recurrent state `[2, 1, 128]` it returned last time.

use crate::audio::SAMPLE_RATE;
use crate::transcription::vad::{VoiceDetector, FRAME_SAMPLES};
use anyhow::{anyhow, bail, Result};
use ndarray::{Array, Array2, Array3};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;

const CONTEXT_SAMPLES: usize = 64;
const STATE_LEN: usize = 2 * 128;

pub struct SileroVad {
    session: Session,
    threshold: f32,
    state: Vec<f32>,
    context: Vec<f32>,
}

impl SileroVad {
    /// Load the model. A frame is speech when its probability exceeds `1 - sensitivity`.
    pub fn load(path: &Path, sensitivity: f32) -> Result<Self> {
        if !path.exists() {
            bail!("VAD model not found: {}", path.display());
        }

        let session = Session::builder()
            .map_err(|e| anyhow!("Failed to create VAD session builder: {}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("Failed to set VAD optimization level: {}", e))?
            .with_intra_threads(1)
            .map_err(|e| anyhow!("Failed to set VAD threads: {}", e))?
            .commit_from_file(path)
            .map_err(|e| anyhow!("Failed to load VAD model {}: {}", path.display(), e))?;

        Ok(Self {
            session,
            threshold: (1.0 - sensitivity).clamp(0.0, 1.0),
            state: vec![0.0; STATE_LEN],
            context: vec![0.0; CONTEXT_SAMPLES],
        })
    }

    /// Speech probability of one frame; advances the model state.
    pub fn probability(&mut self, frame: &[f32]) -> Result<f32> {
        if frame.len() != FRAME_SAMPLES {
            bail!("Silero expects {} samples, got {}", FRAME_SAMPLES, frame.len());
        }

        let mut input = Vec::with_capacity(CONTEXT_SAMPLES + FRAME_SAMPLES);
        input.extend_from_slice(&self.context);
        input.extend_from_slice(frame);
        self.context
            .copy_from_slice(&frame[FRAME_SAMPLES - CONTEXT_SAMPLES..]);

        let input = Tensor::from_array(Array2::from_shape_vec((1, input.len()), input)?)
            .map_err(|e| anyhow!("Failed to create VAD input tensor: {}", e))?;
        let sr = Tensor::from_array(Array::from_elem((), SAMPLE_RATE as i64))
            .map_err(|e| anyhow!("Failed to create VAD rate tensor: {}", e))?;
        let state = Tensor::from_array(Array3::from_shape_vec((2, 1, 128), self.state.clone())?)
            .map_err(|e| anyhow!("Failed to create VAD state tensor: {}", e))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "input" => input,
                "sr" => sr,
                "state" => state,
            ])
            .map_err(|e| anyhow!("VAD inference failed: {}", e))?;

        let output = outputs
            .get("output")
            .ok_or_else(|| anyhow!("VAD model returned no 'output'"))?;
        let (_, probability) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("Failed to read VAD output: {}", e))?;
        let probability = probability.first().copied().unwrap_or(0.0);

        let next_state = outputs
            .get("stateN")
            .ok_or_else(|| anyhow!("VAD model returned no 'stateN'"))?;
        let (_, next_state) = next_state
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("Failed to read VAD state: {}", e))?;
        self.state = next_state.to_vec();

        Ok(probability)
    }
}

impl VoiceDetector for SileroVad {
    fn is_voiced(&mut self, frame: &[f32]) -> Result<bool> {
        Ok(self.probability(frame)? > self.threshold)
    }
}
