//! Whisper-backed engine factory.

use crate::config::RecognitionConfig;
use crate::device::ComputeTarget;
use crate::transcription::engine::{EngineFactory, PartialCallback, RecognitionEngine};
use crate::transcription::model::{ModelFiles, WhisperTranscriber};
use crate::transcription::recorder::{Recorder, Transcriber};
use crate::transcription::vad::VadBackend;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Builds [`Recorder`] engines around Whisper transcribers.
///
/// Model files are resolved (and downloaded if needed) and the VAD backend is chosen
/// once, before the relay accepts connections; weights are loaded per session.
pub struct WhisperEngineFactory {
    main: ModelFiles,
    realtime: Option<ModelFiles>,
    vad: VadBackend,
}

impl WhisperEngineFactory {
    /// Resolve the main model and, when realtime transcription is on, the realtime model.
    pub async fn prepare(config: &RecognitionConfig) -> Result<Self> {
        let main = ModelFiles::resolve(&config.model).await?;
        let realtime = if config.enable_realtime_transcription {
            Some(ModelFiles::resolve(&config.realtime_model).await?)
        } else {
            None
        };

        let vad = VadBackend::resolve(config);

        info!(
            "Whisper models ready: main={}, realtime={}, vad={}",
            main.label,
            realtime.as_ref().map(|f| f.label.as_str()).unwrap_or("off"),
            vad.name()
        );
        Ok(Self {
            main,
            realtime,
            vad,
        })
    }
}

impl EngineFactory for WhisperEngineFactory {
    fn name(&self) -> &str {
        "whisper"
    }

    fn create(
        &self,
        config: &RecognitionConfig,
        on_partial: PartialCallback,
    ) -> Result<Arc<dyn RecognitionEngine>> {
        let target =
            ComputeTarget::from_names(&config.device, config.gpu_device_index, &config.compute_type);

        let main = WhisperTranscriber::load(&self.main, &target, &config.language)?;
        let realtime = match &self.realtime {
            Some(files) if config.enable_realtime_transcription => {
                let transcriber = WhisperTranscriber::load(files, &target, &config.language)?;
                Some(Box::new(transcriber) as Box<dyn Transcriber>)
            }
            _ => None,
        };

        let vad = self.vad.build(config)?;
        let recorder = Recorder::new(config, vad, Box::new(main), realtime, on_partial)?;
        Ok(Arc::new(recorder))
    }
}
