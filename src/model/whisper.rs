//! # Whisper Recognizer
//!
//! Production implementation of the recognizer port using Whisper via
//! Candle-rs: pure Rust inference, no FFI into whisper.cpp.
//!
//! ## Loading Process:
//! 1. Download model files from HuggingFace (cached locally by hf-hub)
//! 2. Load the tokenizer and model configuration
//! 3. Initialize the weights on the selected device
//!
//! ## Inference:
//! Incoming samples are padded to Whisper's 30 second window, converted to a
//! log-mel spectrogram, encoded once, then decoded greedily with a
//! repetition guard. The decoder's key-value cache is mutable state, so one
//! internal mutex serializes transcriptions; callers may still issue them
//! concurrently.

use crate::config::AppConfig;
use crate::device::resolve_device;
use crate::model::recognizer::{ModelSize, Recognizer, RecognizerLoader};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use hf_hub::api::tokio::ApiBuilder;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Whisper consumes fixed 30 second windows at 16kHz.
const SAMPLE_RATE: usize = 16000;
const WINDOW_SAMPLES: usize = 30 * SAMPLE_RATE;

/// Upper bound on generated tokens per clip.
const MAX_DECODE_TOKENS: usize = 224;

/// STFT size Whisper's mel front end expects.
const N_FFT: usize = 400;

/// A loaded Whisper model ready for transcription.
pub struct WhisperRecognizer {
    /// Decoder kv-cache mutates during generation, so calls are serialized
    model: Mutex<m::model::Whisper>,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    config: Config,
    device: Device,
    /// Pre-resolved language token, None for auto-detect
    language_token: Option<u32>,
    sot_token: u32,
    eot_token: u32,
    transcribe_token: u32,
    no_timestamps_token: u32,
}

impl WhisperRecognizer {
    fn special_token(tokenizer: &Tokenizer, name: &str, fallback: u32) -> u32 {
        tokenizer.token_to_id(name).unwrap_or(fallback)
    }

    fn new(
        model: m::model::Whisper,
        tokenizer: Tokenizer,
        config: Config,
        device: Device,
        language: &str,
    ) -> Self {
        let language_token = if language.is_empty() {
            None
        } else {
            let token = tokenizer.token_to_id(&format!("<|{}|>", language));
            if token.is_none() {
                warn!(language = %language, "No token for language, falling back to auto-detect");
            }
            token
        };

        let mel_filters = mel_filter_bank(N_FFT, config.num_mel_bins, SAMPLE_RATE as f32);
        let sot_token = Self::special_token(&tokenizer, "<|startoftranscript|>", 50258);
        let eot_token = Self::special_token(&tokenizer, "<|endoftext|>", 50257);
        let transcribe_token = Self::special_token(&tokenizer, "<|transcribe|>", 50359);
        let no_timestamps_token = Self::special_token(&tokenizer, "<|notimestamps|>", 50363);

        Self {
            model: Mutex::new(model),
            tokenizer,
            mel_filters,
            config,
            device,
            language_token,
            sot_token,
            eot_token,
            transcribe_token,
            no_timestamps_token,
        }
    }

    /// Convert samples to the (1, n_mels, n_frames) spectrogram tensor the
    /// encoder expects.
    fn mel_spectrogram(&self, samples: &[f32]) -> Result<Tensor> {
        let padded = pad_to_window(samples);
        let mel = audio::pcm_to_mel(&self.config, &padded, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let n_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, n_frames), &self.device)?;
        Ok(mel)
    }

    /// Greedy decode with the task prompt tokens prepended.
    async fn decode(&self, mel: &Tensor) -> Result<String> {
        let mut model = self.model.lock().await;
        let audio_features = model.encoder.forward(mel, true)?;

        let mut tokens = vec![self.sot_token];
        if let Some(language_token) = self.language_token {
            tokens.push(language_token);
        }
        tokens.push(self.transcribe_token);
        tokens.push(self.no_timestamps_token);
        let prompt_len = tokens.len();

        for step in 0..MAX_DECODE_TOKENS {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &audio_features, step == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;

            let next = logits.argmax(0)?.to_scalar::<u32>()?;
            if next == self.eot_token {
                break;
            }
            if is_repetitive(&tokens[prompt_len..], next) {
                debug!("Stopping decode on repetitive output");
                break;
            }
            tokens.push(next);
        }

        let text = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|err| anyhow!("Tokenizer decode error: {}", err))?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl Recognizer for WhisperRecognizer {
    async fn transcribe(&self, samples: &[f32]) -> Result<String> {
        if samples.is_empty() {
            return Err(anyhow!("Audio data is empty"));
        }
        if samples.len() < SAMPLE_RATE {
            warn!("Audio shorter than 1 second, transcription may be inaccurate");
        }

        let started = Instant::now();
        let mel = self.mel_spectrogram(samples)?;
        let text = self.decode(&mel).await?;

        debug!(
            audio_secs = samples.len() as f64 / SAMPLE_RATE as f64,
            elapsed_secs = started.elapsed().as_secs_f64(),
            chars = text.len(),
            "Transcription finished"
        );
        Ok(text)
    }
}

/// Loader that reads the `model` configuration section at each load, so
/// runtime configuration changes take effect on the next load.
pub struct WhisperLoader {
    config: Arc<RwLock<AppConfig>>,
}

impl WhisperLoader {
    pub fn new(config: Arc<RwLock<AppConfig>>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RecognizerLoader for WhisperLoader {
    async fn load(&self) -> Result<Arc<dyn Recognizer>> {
        let model_config = self.config.read().unwrap().model.clone();
        let size: ModelSize = model_config.size.parse()?;
        let device = resolve_device(&model_config.device);
        let dtype = weight_dtype(&model_config.compute, &device);

        info!(size = %size, repo = size.repo_name(), "Downloading Whisper model files");
        let started = Instant::now();

        let mut builder = ApiBuilder::new()
            .with_token(std::env::var("HF_TOKEN").ok())
            .with_progress(false);
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        }
        let api = builder.build()?;
        let repo = api.model(size.repo_name().to_string());

        let config_path = repo
            .get("config.json")
            .await
            .map_err(|err| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), err))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .await
            .map_err(|err| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), err))?;
        let weights_path = repo
            .get("model.safetensors")
            .await
            .map_err(|err| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), err))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|err| anyhow!("Failed to load tokenizer: {}", err))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        info!(
            size = %size,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Whisper model loaded"
        );

        Ok(Arc::new(WhisperRecognizer::new(
            model,
            tokenizer,
            config,
            device,
            &model_config.language,
        )))
    }
}

/// Map the configured precision to a weight dtype. Candle has no int8
/// inference path for Whisper, so "int8" degrades to f32 on CPU; "float16"
/// only makes sense on an accelerator.
fn weight_dtype(compute: &str, device: &Device) -> DType {
    match compute.to_lowercase().as_str() {
        "float16" | "f16" if !matches!(device, Device::Cpu) => DType::F16,
        "float32" | "f32" => DType::F32,
        "int8" => {
            debug!("int8 weights are not supported, using f32");
            m::DTYPE
        }
        _ => m::DTYPE,
    }
}

/// Pad or truncate samples to exactly one 30 second window.
fn pad_to_window(samples: &[f32]) -> Vec<f32> {
    let mut padded = vec![0.0f32; WINDOW_SAMPLES];
    let copy_len = samples.len().min(WINDOW_SAMPLES);
    padded[..copy_len].copy_from_slice(&samples[..copy_len]);
    padded
}

/// Triangular mel filter bank, (n_mels, n_fft/2 + 1) row-major, matching the
/// layout `audio::pcm_to_mel` consumes.
fn mel_filter_bank(n_fft: usize, n_mels: usize, sample_rate: f32) -> Vec<f32> {
    fn hz_to_mel(hz: f32) -> f32 {
        2595.0 * (1.0 + hz / 700.0).log10()
    }
    fn mel_to_hz(mel: f32) -> f32 {
        700.0 * (10f32.powf(mel / 2595.0) - 1.0)
    }

    let n_freqs = n_fft / 2 + 1;
    let max_mel = hz_to_mel(sample_rate / 2.0);

    // n_mels + 2 points: each filter spans its two neighbors
    let mel_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f32 / (n_mels + 1) as f32))
        .collect();
    let bin_of_hz = |hz: f32| hz * n_fft as f32 / sample_rate;

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for mel_idx in 0..n_mels {
        let left = bin_of_hz(mel_points[mel_idx]);
        let center = bin_of_hz(mel_points[mel_idx + 1]);
        let right = bin_of_hz(mel_points[mel_idx + 2]);

        for freq in 0..n_freqs {
            let f = freq as f32;
            let weight = if f <= center {
                (f - left) / (center - left).max(f32::EPSILON)
            } else {
                (right - f) / (right - center).max(f32::EPSILON)
            };
            filters[mel_idx * n_freqs + freq] = weight.clamp(0.0, 1.0);
        }
    }
    filters
}

/// Detect degenerate output: the same token three times running, or the last
/// three tokens repeating the three before them.
fn is_repetitive(generated: &[u32], next: u32) -> bool {
    let n = generated.len();
    if n >= 2 && generated[n - 1] == next && generated[n - 2] == next {
        return true;
    }
    if n >= 5 {
        let candidate = [generated[n - 2], generated[n - 1], next];
        if generated[n - 5..n - 2] == candidate {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_to_window_length() {
        assert_eq!(pad_to_window(&[0.5; 100]).len(), WINDOW_SAMPLES);
        let oversized = vec![0.5f32; WINDOW_SAMPLES * 2];
        assert_eq!(pad_to_window(&oversized).len(), WINDOW_SAMPLES);
        // Content is preserved up front, zeros after
        let padded = pad_to_window(&[0.5; 100]);
        assert_eq!(padded[99], 0.5);
        assert_eq!(padded[100], 0.0);
    }

    #[test]
    fn test_mel_filter_bank_shape_and_range() {
        let n_mels = 80;
        let filters = mel_filter_bank(N_FFT, n_mels, SAMPLE_RATE as f32);
        assert_eq!(filters.len(), n_mels * (N_FFT / 2 + 1));
        assert!(filters.iter().all(|w| (0.0..=1.0).contains(w)));
        // Every filter must pass some energy somewhere
        let n_freqs = N_FFT / 2 + 1;
        for mel_idx in 0..n_mels {
            let row = &filters[mel_idx * n_freqs..(mel_idx + 1) * n_freqs];
            assert!(row.iter().any(|w| *w > 0.0), "filter {} is all zero", mel_idx);
        }
    }

    #[test]
    fn test_repetition_guard() {
        assert!(is_repetitive(&[7, 7], 7));
        assert!(!is_repetitive(&[7, 8], 7));
        assert!(is_repetitive(&[1, 2, 3, 1, 2], 3));
        assert!(!is_repetitive(&[1, 2, 3, 4, 5], 6));
        assert!(!is_repetitive(&[], 1));
    }

    #[test]
    fn test_weight_dtype_mapping() {
        assert_eq!(weight_dtype("float32", &Device::Cpu), DType::F32);
        assert_eq!(weight_dtype("int8", &Device::Cpu), DType::F32);
        // f16 on CPU degrades to the default dtype
        assert_eq!(weight_dtype("float16", &Device::Cpu), m::DTYPE);
    }
}
