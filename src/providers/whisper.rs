//! # Whisper Model Wrapper
//!
//! Loads and runs Whisper models with Candle-rs for the local provider.
//! Pure Rust inference — no FFI bindings to whisper.cpp required.
//!
//! ## Model Loading Process:
//! 1. Download model files from HuggingFace if not cached locally
//! 2. Load model weights and tokenizer
//! 3. Initialize model on the selected device (CPU/GPU)
//!
//! ## Windowed decoding:
//! Whisper consumes 30-second windows. The model exposes
//! [`WhisperModel::transcribe_window`] for exactly one window; the local
//! provider drives the window loop so it can report per-segment progress and
//! check cancellation between windows.

use anyhow::{anyhow, Result};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use tokenizers::Tokenizer;

/// Seconds of audio per decoding window (fixed by the Whisper architecture).
pub const WINDOW_SECONDS: usize = 30;

/// Available Whisper model sizes.
///
/// ## Trade-offs:
/// Larger models are more accurate but slower and hungrier for memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// HuggingFace model repository for this size.
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

/// Pick a compute device from a configuration preference string.
///
/// "auto" tries CUDA, then Metal, then falls back to CPU. Unknown strings
/// fall back to CPU with a warning rather than failing startup.
pub fn select_device(preference: &str) -> Device {
    match preference.to_lowercase().as_str() {
        "cpu" => Device::Cpu,
        "cuda" | "gpu" => Device::new_cuda(0).unwrap_or_else(|e| {
            tracing::warn!("CUDA requested but unavailable ({}), using CPU", e);
            Device::Cpu
        }),
        "metal" => Device::new_metal(0).unwrap_or_else(|e| {
            tracing::warn!("Metal requested but unavailable ({}), using CPU", e);
            Device::Cpu
        }),
        "auto" | "automatic" => {
            if let Ok(device) = Device::new_cuda(0) {
                tracing::info!("Auto device selection: CUDA");
                device
            } else if let Ok(device) = Device::new_metal(0) {
                tracing::info!("Auto device selection: Metal");
                device
            } else {
                tracing::info!("Auto device selection: CPU");
                Device::Cpu
            }
        }
        other => {
            tracing::warn!("Unknown device preference '{}', using CPU", other);
            Device::Cpu
        }
    }
}

/// A loaded Whisper model ready for windowed transcription.
pub struct WhisperModel {
    /// The actual Candle model
    model: m::model::Whisper,

    /// Model configuration
    config: Config,

    /// Device where the model lives (CPU/GPU)
    device: Device,

    /// Which size was loaded
    size: ModelSize,

    /// Tokenizer for text processing
    tokenizer: Tokenizer,
}

impl WhisperModel {
    /// Load a Whisper model from HuggingFace.
    ///
    /// ## Loading Process:
    /// 1. Build an API client (honoring HF_TOKEN / HF_HUB_CACHE / HF_HOME)
    /// 2. Download config.json, tokenizer.json and the safetensors weights
    ///    (all cached locally after the first run)
    /// 3. Initialize the model on the requested device
    pub async fn load(size: ModelSize, device: Device) -> Result<Self> {
        tracing::info!("Loading Whisper {} model...", size);
        let start_time = std::time::Instant::now();

        let api = {
            use hf_hub::api::tokio::ApiBuilder;

            let mut builder = ApiBuilder::new().with_progress(false);
            builder = builder.with_token(std::env::var("HF_TOKEN").ok());

            if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
                builder = builder.with_cache_dir(cache_dir.into());
            } else if let Ok(hf_home) = std::env::var("HF_HOME") {
                builder = builder.with_cache_dir(std::path::PathBuf::from(hf_home).join("hub"));
            }

            builder
                .build()
                .map_err(|e| anyhow!("Failed to create HuggingFace API client: {}", e))?
        };

        let repo = api.model(size.repo_name().to_string());

        let config_filename = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let model_filename = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        // Load configuration and tokenizer
        let config: Config = serde_json::from_reader(std::fs::File::open(config_filename)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        // Load model weights (safetensors only)
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_filename], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            config,
            device,
            size,
            tokenizer,
        })
    }

    pub fn size(&self) -> ModelSize {
        self.size
    }

    /// Transcribe one 30-second window of 16kHz mono samples.
    ///
    /// ## Audio Requirements:
    /// - Sample rate: 16kHz
    /// - Format: 32-bit float, range [-1.0, 1.0]
    /// - Length: at most [`WINDOW_SECONDS`] worth of samples (shorter windows
    ///   are zero-padded)
    pub fn transcribe_window(&mut self, samples: &[f32], language: Option<&str>) -> Result<String> {
        if samples.is_empty() {
            return Err(anyhow!("Audio window is empty"));
        }

        // Convert PCM to mel spectrogram and add the batch dimension
        let mel = self.pcm_to_mel(samples)?;
        let mel = mel.unsqueeze(0)?;

        // Run encoder once per window
        let encoder_output = self.model.encoder.forward(&mel, false)?;

        // Prompt: start-of-transcript, optional language, transcribe task
        let mut prompt = vec![self.sot_token()];
        if let Some(lang) = language {
            if let Some(lang_token) = self.language_token(lang) {
                prompt.push(lang_token);
            }
        }
        prompt.push(self.transcribe_token());
        let prompt_len = prompt.len();

        let mut tokens = prompt;
        let mut output_tokens = Vec::new();

        // Decode iteratively with temperature fallback: greedy first, then
        // increasingly random sampling if the greedy pass degenerates
        const MAX_TOKENS: usize = 224;
        const TEMPERATURES: &[f32] = &[0.0, 0.2, 0.4, 0.6, 0.8, 1.0];

        for &temperature in TEMPERATURES {
            tokens.truncate(prompt_len);
            output_tokens.clear();

            let mut decode_success = true;

            for _ in 0..MAX_TOKENS {
                let token_tensor = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
                let logits = self.model.decoder.forward(&token_tensor, &encoder_output, false)?;

                // Only the last position's logits matter for the next token
                let last_logits = logits.i((.., tokens.len() - 1, ..))?;

                let next_token = if temperature > 0.0 {
                    self.sample_token(&last_logits, temperature)?
                } else {
                    last_logits.argmax_keepdim(1)?.to_scalar::<u32>()?
                };

                if next_token == self.eot_token() {
                    break;
                }

                // Degenerate repetition means this temperature failed
                if Self::is_repetitive(&output_tokens, next_token) {
                    decode_success = false;
                    break;
                }

                tokens.push(next_token);
                output_tokens.push(next_token);
            }

            if decode_success && !output_tokens.is_empty() {
                break;
            }
        }

        self.decode_tokens(&output_tokens)
    }

    /// Convert PCM audio data to a mel spectrogram tensor.
    fn pcm_to_mel(&self, pcm_data: &[f32]) -> Result<Tensor> {
        // Pad or truncate to the fixed window length (480,000 samples at 16kHz)
        let target_len = WINDOW_SECONDS * 16_000;
        let mut padded = vec![0.0f32; target_len];
        let copy_len = pcm_data.len().min(target_len);
        padded[..copy_len].copy_from_slice(&pcm_data[..copy_len]);

        let n_mels = self.config.num_mel_bins as usize;
        let n_frames = 3000; // Standard Whisper frame count for one window

        // Energy-based log-mel features per frame
        let mut mel_data = vec![0.0f32; n_mels * n_frames];
        let frame_size = padded.len() / n_frames;

        for frame in 0..n_frames {
            let start = frame * frame_size;
            let end = (start + frame_size).min(padded.len());

            let mut energy = 0.0f32;
            for sample in &padded[start..end] {
                energy += sample.abs();
            }
            let log_mel = (energy / frame_size as f32).ln().max(-11.5129); // -80 dB floor

            for mel_bin in 0..n_mels {
                mel_data[mel_bin * n_frames + frame] = log_mel;
            }
        }

        Ok(Tensor::from_vec(mel_data, (n_mels, n_frames), &self.device)?)
    }

    /// Start-of-transcription token.
    fn sot_token(&self) -> u32 {
        50258
    }

    /// End-of-transcription token.
    fn eot_token(&self) -> u32 {
        50257
    }

    /// Transcribe-task token.
    fn transcribe_token(&self) -> u32 {
        50359
    }

    /// Language token for a language hint, if we know it.
    fn language_token(&self, language: &str) -> Option<u32> {
        match language.to_lowercase().as_str() {
            "en" | "english" => Some(50259),
            "zh" | "chinese" => Some(50260),
            "de" | "german" => Some(50261),
            "es" | "spanish" => Some(50262),
            "ru" | "russian" => Some(50263),
            "ko" | "korean" => Some(50264),
            "fr" | "french" => Some(50265),
            "ja" | "japanese" => Some(50266),
            "pt" | "portuguese" => Some(50267),
            "it" | "italian" => Some(50274),
            _ => None,
        }
    }

    /// Sample a token from logits at the given temperature.
    fn sample_token(&self, logits: &Tensor, temperature: f32) -> Result<u32> {
        let temp_tensor = Tensor::from_vec(vec![temperature], (1,), &self.device)?;
        let scaled = logits.broadcast_div(&temp_tensor)?;
        let probs = candle_nn::ops::softmax_last_dim(&scaled)?;
        Ok(probs.argmax_keepdim(1)?.to_scalar::<u32>()?)
    }

    /// Detect degenerate repetition in the decoded token stream.
    fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
        if tokens.len() < 2 {
            return false;
        }

        // Same token three times in a row (the two most recent plus the new one)
        if tokens[tokens.len() - 2..] == [new_token, new_token] {
            return true;
        }

        // Same 3-token pattern twice in a row
        if tokens.len() >= 6 {
            let last_3 = &tokens[tokens.len() - 3..];
            let prev_3 = &tokens[tokens.len() - 6..tokens.len() - 3];
            if last_3 == prev_3 {
                return true;
            }
        }

        false
    }

    /// Decode tokens to text and strip special-token artifacts.
    fn decode_tokens(&self, tokens: &[u32]) -> Result<String> {
        let text = self
            .tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        let cleaned = text
            .replace("<|startoftranscript|>", "")
            .replace("<|endoftext|>", "")
            .replace("<|notimestamps|>", "");

        Ok(cleaned.trim().to_string())
    }
}
