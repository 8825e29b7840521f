//! # Whisper Model Management
//!
//! Resolves Whisper model files and runs greedy Whisper decoding with Candle.
//!
//! ## Model Loading Process:
//! 1. Resolve model files once at startup: a local directory, or a size name
//!    downloaded from the Hugging Face hub (cached locally by hf-hub)
//! 2. Per session, memory-map the weights onto the configured device
//! 3. Build the tokenizer prompt (`<|startoftranscript|><|lang|><|transcribe|><|notimestamps|>`)
//!
//! ## Memory Management:
//! Each session owns its transcribers, so weights are mapped once per engine instance
//! and released when the engine's last handle drops.

use crate::device::ComputeTarget;
use crate::transcription::recorder::Transcriber;
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Available Whisper model sizes.
///
/// ## Trade-offs:
/// - **Size vs Accuracy**: Larger models are more accurate but slower
/// - **Realtime pass**: partial results run far more often than finals, so the realtime
///   model is usually one or two sizes smaller than the main model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// Get the HuggingFace model repository name.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// On-disk location of one Whisper model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Selector the files were resolved from (size name or directory)
    pub label: String,
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    /// Resolve a model selector to files on disk.
    ///
    /// ## Parameters:
    /// - **selector**: a directory containing `config.json`, `tokenizer.json` and
    ///   `model.safetensors`, or a model size name
    ///
    /// ## Returns:
    /// - **Ok(ModelFiles)**: every file exists locally
    /// - **Err(anyhow::Error)**: unknown selector, missing file, or download failure
    pub async fn resolve(selector: &str) -> Result<Self> {
        let path = Path::new(selector);
        if path.is_dir() {
            return Self::from_dir(selector, path);
        }

        let size: ModelSize = selector.parse().with_context(|| {
            format!("'{}' is neither a model directory nor a known model size", selector)
        })?;
        Self::download(size).await
    }

    fn from_dir(label: &str, dir: &Path) -> Result<Self> {
        let file = |name: &str| -> Result<PathBuf> {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(anyhow!("Model directory {} is missing {}", dir.display(), name))
            }
        };

        Ok(Self {
            label: label.to_string(),
            config: file(CONFIG_FILE)?,
            tokenizer: file(TOKENIZER_FILE)?,
            weights: file(WEIGHTS_FILE)?,
        })
    }

    async fn download(size: ModelSize) -> Result<Self> {
        use hf_hub::api::tokio::ApiBuilder;

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Ok(token) = std::env::var("HF_TOKEN") {
            debug!("Using HF token (length: {})", token.len());
            builder = builder.with_token(Some(token));
        }
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            debug!("Using hub cache dir: {}", cache_dir);
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
        }

        let api = builder
            .build()
            .map_err(|e| anyhow!("Failed to create Hugging Face API client: {}", e))?;

        info!("Fetching Whisper {} model from {}", size, size.repo_name());
        let repo = api.model(size.repo_name().to_string());

        Ok(Self {
            label: size.to_string(),
            config: fetch(&repo, size, CONFIG_FILE).await?,
            tokenizer: fetch(&repo, size, TOKENIZER_FILE).await?,
            weights: fetch(&repo, size, WEIGHTS_FILE).await?,
        })
    }
}

async fn fetch(repo: &hf_hub::api::tokio::ApiRepo, size: ModelSize, name: &str) -> Result<PathBuf> {
    repo.get(name)
        .await
        .map_err(|e| anyhow!("Failed to download {} from {}: {}", name, size.repo_name(), e))
}

/// A loaded Whisper model doing greedy, timestamp-free decoding.
pub struct WhisperTranscriber {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    mel_filters: Vec<f32>,
    /// SOT, language, task and no-timestamps tokens
    prompt: Vec<u32>,
    eot_token: u32,
    label: String,
}

impl WhisperTranscriber {
    /// Load weights and tokenizer onto the given compute target.
    ///
    /// Blocking: call from a blocking thread.
    pub fn load(files: &ModelFiles, target: &ComputeTarget, language: &str) -> Result<Self> {
        let start_time = std::time::Instant::now();

        let config: Config = serde_json::from_reader(
            std::fs::File::open(&files.config)
                .with_context(|| format!("opening {}", files.config.display()))?,
        )?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.weights], target.dtype, &target.device)?
        };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let token = |name: &str| {
            tokenizer
                .token_to_id(name)
                .ok_or_else(|| anyhow!("Tokenizer has no {} token", name))
        };
        let mut prompt = vec![token(m::SOT_TOKEN)?];
        match tokenizer.token_to_id(&format!("<|{}|>", language)) {
            Some(lang) => prompt.push(lang),
            None => warn!("No language token for '{}', letting the model detect it", language),
        }
        prompt.push(token(m::TRANSCRIBE_TOKEN)?);
        prompt.push(token(m::NO_TIMESTAMPS_TOKEN)?);
        let eot_token = token(m::EOT_TOKEN)?;

        let mel_filters = mel_filter_bank(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE);

        debug!(
            "Whisper {} loaded in {:.2}s",
            files.label,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            config,
            tokenizer,
            device: target.device.clone(),
            dtype: target.dtype,
            mel_filters,
            prompt,
            eot_token,
            label: files.label.clone(),
        })
    }

    fn mel(&self, samples: &[f32]) -> Result<Tensor> {
        // Whisper is trained on 30 s windows; pad with silence and keep one window.
        let mut padded = samples[..samples.len().min(m::N_SAMPLES)].to_vec();
        padded.resize(m::N_SAMPLES, 0.0);

        let mel = audio::pcm_to_mel(&self.config, &padded, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        Ok(mel.narrow(2, 0, frames.min(m::N_FRAMES))?.to_dtype(self.dtype)?)
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&mut self, samples: &[f32]) -> Result<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let start_time = std::time::Instant::now();

        let mel = self.mel(samples)?;
        let audio_features = self.model.encoder.forward(&mel, true)?;

        let mut tokens = self.prompt.clone();
        let max_tokens = self.config.max_target_positions / 2;
        for i in 0..max_tokens {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_dtype(DType::F32)?;
            let next_token = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

            if next_token == self.eot_token {
                break;
            }
            tokens.push(next_token);
            if is_repetitive(&tokens[self.prompt.len()..]) {
                debug!("Whisper {} stopped on a repetition loop", self.label);
                break;
            }
        }

        let text = self
            .tokenizer
            .decode(&tokens[self.prompt.len()..], true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        debug!(
            "Whisper {} transcribed {:.2}s of audio in {:.2}s",
            self.label,
            samples.len() as f64 / m::SAMPLE_RATE as f64,
            start_time.elapsed().as_secs_f64()
        );
        Ok(text.trim().to_string())
    }
}

/// Greedy decoding can lock into a loop; stop on a triple token or a repeated trigram.
fn is_repetitive(tokens: &[u32]) -> bool {
    let n = tokens.len();
    if n >= 3 && tokens[n - 1] == tokens[n - 2] && tokens[n - 2] == tokens[n - 3] {
        return true;
    }
    n >= 6 && tokens[n - 3..] == tokens[n - 6..n - 3]
}

/// Slaney-style mel filter bank, laid out `n_mels x (n_fft / 2 + 1)` row-major.
pub fn mel_filter_bank(n_mels: usize, n_fft: usize, sample_rate: usize) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;

    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| i as f64 * nyquist / (n_freqs - 1) as f64)
        .collect();

    let max_mel = hz_to_mel(nyquist);
    let mel_freqs: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for band in 0..n_mels {
        let (lower, center, upper) = (mel_freqs[band], mel_freqs[band + 1], mel_freqs[band + 2]);
        let norm = 2.0 / (upper - lower);
        for (k, &f) in fft_freqs.iter().enumerate() {
            let rising = (f - lower) / (center - lower);
            let falling = (upper - f) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[band * n_freqs + k] = (weight * norm) as f32;
        }
    }
    filters
}

const MEL_LINEAR_STEP: f64 = 200.0 / 3.0;
const MEL_LOG_START_HZ: f64 = 1000.0;

fn mel_log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    let log_start_mel = MEL_LOG_START_HZ / MEL_LINEAR_STEP;
    if hz >= MEL_LOG_START_HZ {
        log_start_mel + (hz / MEL_LOG_START_HZ).ln() / mel_log_step()
    } else {
        hz / MEL_LINEAR_STEP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    let log_start_mel = MEL_LOG_START_HZ / MEL_LINEAR_STEP;
    if mel >= log_start_mel {
        MEL_LOG_START_HZ * (mel_log_step() * (mel - log_start_mel)).exp()
    } else {
        mel * MEL_LINEAR_STEP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert!("invalid".parse::<ModelSize>().is_err());
        assert_eq!(ModelSize::Tiny.repo_name(), "openai/whisper-tiny");
    }

    #[test]
    fn test_mel_scale_round_trip() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let filters = mel_filter_bank(80, 400, 16_000);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| *w >= 0.0));
        for m in 0..80 {
            let row = &filters[m * 201..(m + 1) * 201];
            assert!(row.iter().any(|w| *w > 0.0), "mel band {} is empty", m);
        }
    }

    #[test]
    fn test_repetition_guard() {
        assert!(!is_repetitive(&[1, 2, 3, 4]));
        assert!(is_repetitive(&[1, 7, 7, 7]));
        assert!(is_repetitive(&[1, 2, 3, 1, 2, 3]));
    }

    #[tokio::test]
    async fn test_resolve_rejects_unknown_selector() {
        let err = ModelFiles::resolve("definitely-not-a-model").await.unwrap_err();
        assert!(err.to_string().contains("neither a model directory"));
    }

    #[test]
    fn test_model_dir_requires_all_files() {
        let dir = std::env::temp_dir().join(format!("speech-relay-model-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), "{}").unwrap();

        let err = ModelFiles::from_dir("local", &dir).unwrap_err();
        assert!(err.to_string().contains(TOKENIZER_FILE));

        std::fs::write(dir.join(TOKENIZER_FILE), "{}").unwrap();
        std::fs::write(dir.join(WEIGHTS_FILE), "").unwrap();
        let files = ModelFiles::from_dir("local", &dir).unwrap();
        assert_eq!(files.weights, dir.join(WEIGHTS_FILE));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
