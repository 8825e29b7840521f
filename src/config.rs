//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (ops HTTP server only, for deployment platforms)
//! 2. Environment variables (APP_STREAM__PORT, APP_RECOGNITION__LANGUAGE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: ops HTTP API (health, metrics, config, sessions)
//! - **stream**: the WebSocket listener that carries audio and transcripts
//! - **recognition**: the opaque bag handed to every Recognition Worker
//! - **performance**: admission limits

use crate::device::{ComputePrecision, DevicePreference};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The recognition section is cloned into each session at connect time, so keeping it
/// apart from the listener settings means a session never carries more than it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub recognition: RecognitionConfig,
    pub performance: PerformanceConfig,
}

/// Ops HTTP server settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// WebSocket stream listener settings.
///
/// ## Fields:
/// - `host` / `port`: where clients connect to stream audio
/// - `join_timeout_ms`: how long teardown waits for a worker thread to exit
/// - `max_connection_time_secs`: hard deadline per connection (0 disables it)
/// - `max_frame_bytes`: largest accepted WebSocket message and frame (0 = unlimited)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    pub join_timeout_ms: u64,
    pub max_connection_time_secs: u64,
    pub max_frame_bytes: usize,
}

impl StreamConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Connection deadline, or `None` when unlimited.
    pub fn max_connection_time(&self) -> Option<Duration> {
        (self.max_connection_time_secs > 0).then(|| Duration::from_secs(self.max_connection_time_secs))
    }
}

/// Recognition engine settings.
///
/// ## Purpose:
/// This is the flat configuration bag passed into the Recognition Worker's constructor.
/// It is captured by value once per session and never mutated afterwards.
///
/// ## Model selectors:
/// `model` and `realtime_model` accept either a filesystem path to a Whisper model
/// directory or a size name (`tiny`, `base`, `small`, `medium`, `large`) fetched from
/// the Hugging Face hub.
///
/// ## Voice activity:
/// - `vad_model`: Silero VAD ONNX file; when it is missing (or the `vad` feature is off)
///   the energy gate is used instead
/// - `silero_sensitivity` (0-1): a frame is speech when the Silero probability exceeds
///   `1 - silero_sensitivity`
/// - `energy_threshold`: RMS level a frame needs to count as speech under the energy gate
/// - `webrtc_sensitivity` (0-3): aggressiveness; voiced frames needed to open an utterance is this + 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    pub model: String,
    pub realtime_model: String,
    pub language: String,
    pub compute_type: String,
    pub device: String,
    pub gpu_device_index: usize,
    pub vad_model: String,
    pub silero_sensitivity: f32,
    pub energy_threshold: f32,
    pub webrtc_sensitivity: u8,
    /// Seconds of silence that end an utterance.
    pub post_speech_silence_duration: f32,
    /// Shortest utterance (seconds) allowed to end on silence.
    pub min_length_of_recording: f32,
    /// Longest utterance (seconds) before it is finalized regardless of silence.
    pub max_length_of_recording: f32,
    pub enable_realtime_transcription: bool,
    /// Seconds between realtime (partial) transcription passes.
    pub realtime_processing_pause: f32,
    /// Seconds of audio kept from before speech onset.
    pub pre_recording_buffer_duration: f32,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// Every session owns its own engine instance (two Whisper models when realtime
/// transcription is enabled), so this limit is mostly a memory budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            stream: StreamConfig::default(),
            recognition: RecognitionConfig::default(),
            performance: PerformanceConfig {
                max_concurrent_sessions: 4,
            },
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9090,
            join_timeout_ms: 2000,
            max_connection_time_secs: 600,
            max_frame_bytes: 0,
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            model: "base".to_string(),
            realtime_model: "tiny".to_string(),
            language: "en".to_string(),
            compute_type: "default".to_string(),
            device: "auto".to_string(),
            gpu_device_index: 0,
            vad_model: "models/silero_vad.onnx".to_string(),
            silero_sensitivity: 0.6,
            energy_threshold: 0.01,
            webrtc_sensitivity: 3,
            post_speech_silence_duration: 0.4,
            min_length_of_recording: 0.4,
            max_length_of_recording: 30.0,
            enable_realtime_transcription: true,
            realtime_processing_pause: 0.2,
            pre_recording_buffer_duration: 0.5,
        }
    }
}

impl RecognitionConfig {
    /// Validate the recognition bag on its own (also used by engine factories).
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("Recognition model must not be empty"));
        }

        if self.enable_realtime_transcription && self.realtime_model.trim().is_empty() {
            return Err(anyhow!("Realtime model must be set when realtime transcription is enabled"));
        }

        self.device.parse::<DevicePreference>().map_err(|e| anyhow!(e))?;
        self.compute_type.parse::<ComputePrecision>().map_err(|e| anyhow!(e))?;

        if !(0.0..=1.0).contains(&self.silero_sensitivity) {
            return Err(anyhow!(
                "silero_sensitivity must be within 0..=1, got {}",
                self.silero_sensitivity
            ));
        }

        if !(self.energy_threshold > 0.0 && self.energy_threshold <= 1.0) {
            return Err(anyhow!(
                "energy_threshold must be within (0, 1], got {}",
                self.energy_threshold
            ));
        }

        if self.webrtc_sensitivity > 3 {
            return Err(anyhow!(
                "webrtc_sensitivity must be within 0..=3, got {}",
                self.webrtc_sensitivity
            ));
        }

        let durations = [
            ("post_speech_silence_duration", self.post_speech_silence_duration),
            ("min_length_of_recording", self.min_length_of_recording),
            ("pre_recording_buffer_duration", self.pre_recording_buffer_duration),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("{} must be a non-negative number, got {}", name, value));
            }
        }

        if !self.max_length_of_recording.is_finite() || self.max_length_of_recording <= 0.0 {
            return Err(anyhow!("max_length_of_recording must be greater than 0"));
        }

        if self.min_length_of_recording > self.max_length_of_recording {
            return Err(anyhow!(
                "min_length_of_recording ({}) exceeds max_length_of_recording ({})",
                self.min_length_of_recording,
                self.max_length_of_recording
            ));
        }

        if !self.realtime_processing_pause.is_finite() || self.realtime_processing_pause <= 0.0 {
            return Err(anyhow!("realtime_processing_pause must be greater than 0"));
        }

        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_STREAM__PORT=9191`: Override the WebSocket port
    /// - `APP_RECOGNITION__MODEL=/models/whisper-small`: Use a local model directory
    /// - `APP_RECOGNITION__DEVICE=cpu`: Force CPU inference
    /// - `HOST=0.0.0.0` / `PORT=3000`: Ops server overrides for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Neither listener uses port 0, and they don't collide
    /// - At least one concurrent session is allowed
    /// - The recognition bag is internally consistent
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.stream.port == 0 {
            return Err(anyhow!("Stream port cannot be 0"));
        }

        if self.stream.port == self.server.port && self.stream.host == self.server.host {
            return Err(anyhow!(
                "Stream and server listeners cannot share {}:{}",
                self.stream.host,
                self.stream.port
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow!("Max concurrent sessions must be greater than 0"));
        }

        self.recognition.validate()?;

        Ok(())
    }

    pub fn stream_addr(&self) -> String {
        format!("{}:{}", self.stream.host, self.stream.port)
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
