//! # Local Transcription Provider
//!
//! Runs Whisper inference in-process with Candle-rs. The model is lazy-loaded
//! on the first job and kept resident afterwards.
//!
//! ## Segment loop:
//! Audio is split into 30-second windows; each window is one progress segment.
//! The cancel flag is checked between windows so a dual-mode sibling failure
//! stops local inference promptly instead of wasting compute on the remainder
//! of the file.

use super::whisper::{select_device, ModelSize, WhisperModel, WINDOW_SECONDS};
use super::{
    CancelFlag, ProgressSender, ProgressUpdate, ProviderError, ProviderKind, ProviderOutput,
    TranscriptionProvider,
};
use crate::audio::{AudioPayload, WHISPER_SAMPLE_RATE};
use crate::config::ModelsConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// How many trailing characters of decoded text a progress snapshot carries.
const PARTIAL_TEXT_CHARS: usize = 200;

/// Local Whisper engine behind the provider interface.
///
/// ## Thread Safety:
/// The model sits behind `Arc<RwLock<Option<...>>>`: absent until first use,
/// exclusive during a decode (the decoder mutates its KV caches), shared for
/// cheap status reads.
pub struct LocalProvider {
    model: Arc<RwLock<Option<WhisperModel>>>,
    model_size: ModelSize,
    device_preference: String,
    language: Option<String>,
}

impl LocalProvider {
    /// Build the provider from model configuration.
    ///
    /// Fails fast on an unknown model size so a typo in config.toml surfaces
    /// at startup, not on the first job.
    pub fn new(config: &ModelsConfig) -> anyhow::Result<Self> {
        let model_size: ModelSize = config.whisper_model.parse()?;
        Ok(Self {
            model: Arc::new(RwLock::new(None)),
            model_size,
            device_preference: config.device.clone(),
            language: config.language.clone(),
        })
    }

    /// The configured model name, for status reporting.
    pub fn model_name(&self) -> String {
        self.model_size.to_string()
    }

    /// Load the model if it isn't resident yet.
    async fn ensure_loaded(&self) -> Result<(), ProviderError> {
        if self.model.read().await.is_some() {
            return Ok(());
        }

        let device = select_device(&self.device_preference);
        let loaded = WhisperModel::load(self.model_size, device)
            .await
            .map_err(|e| ProviderError::Unavailable(format!("Whisper model load failed: {}", e)))?;

        let mut guard = self.model.write().await;
        if guard.is_none() {
            *guard = Some(loaded);
        }
        Ok(())
    }

    /// Estimate a confidence score for a finished transcription.
    ///
    /// ## Heuristic Approach:
    /// Candle's decoder doesn't surface token probabilities here, so this
    /// scores surface features: speaking-pace plausibility, common words,
    /// capitalization/punctuation, and obvious garbling.
    fn estimate_confidence(text: &str, audio_duration: f64) -> f32 {
        // Empty output is always low confidence
        if text.trim().is_empty() {
            return 0.2;
        }

        let mut confidence = 0.5f32;

        // Factor 1: Text length vs audio duration ratio
        if audio_duration > 0.0 {
            let chars_per_second = text.len() as f64 / audio_duration;
            if chars_per_second > 10.0 && chars_per_second < 100.0 {
                confidence += 0.2; // Reasonable speaking pace
            } else {
                confidence -= 0.1; // Too fast or too slow to be clean speech
            }
        }

        // Factor 2: Presence of common words
        let common_words = ["the", "and", "to", "of", "a", "in", "is", "it", "you", "that"];
        let text_lower = text.to_lowercase();
        let common_word_count = common_words
            .iter()
            .filter(|&&word| text_lower.contains(word))
            .count();
        if common_word_count > 0 {
            confidence += 0.1 * (common_word_count as f32 / common_words.len() as f32);
        }

        // Factor 3: Proper capitalization and single punctuation marks
        if text.chars().next().map_or(false, |c| c.is_uppercase()) {
            confidence += 0.1;
        }
        if (text.contains('.') && !text.contains(".."))
            || (text.contains('?') && !text.contains("??"))
            || (text.contains('!') && !text.contains("!!"))
        {
            confidence += 0.1;
        }

        // Factor 4: Obvious garbling indicators
        if text.contains("...") || text.contains("???") {
            confidence -= 0.2;
        } else {
            confidence += 0.1;
        }

        confidence.clamp(0.0, 1.0)
    }
}

/// Keep only the trailing `limit` characters (char-boundary safe).
fn tail_chars(text: &str, limit: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= limit {
        return text.to_string();
    }
    text.chars().skip(char_count - limit).collect()
}

/// Resample mono audio with linear interpolation.
///
/// Uploads are usually already 16kHz, but WAV files from other tooling arrive
/// at 44.1/48kHz and Whisper silently degrades on mismatched rates.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos.floor() as usize;
        let frac = (src_pos - idx as f64) as f32;
        let a = samples[idx];
        let b = if idx + 1 < samples.len() { samples[idx + 1] } else { a };
        out.push(a + (b - a) * frac);
    }

    out
}

#[async_trait]
impl TranscriptionProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn available(&self) -> bool {
        // The model size was validated at construction; loading happens lazily
        true
    }

    async fn transcribe(
        &self,
        audio: &AudioPayload,
        progress: &ProgressSender,
        cancel: &CancelFlag,
    ) -> Result<ProviderOutput, ProviderError> {
        let started = Instant::now();

        // Decode before touching the model: malformed audio is fatal, not
        // worth a model download
        let decoded = audio
            .decode()
            .map_err(|e| ProviderError::Fatal(format!("Audio decode failed: {}", e)))?;

        let samples = resample_linear(&decoded.samples, decoded.sample_rate, WHISPER_SAMPLE_RATE);
        if samples.is_empty() {
            return Err(ProviderError::Fatal("Audio payload decoded to zero samples".to_string()));
        }

        let duration_seconds = samples.len() as f64 / WHISPER_SAMPLE_RATE as f64;

        self.ensure_loaded().await?;

        let window = WINDOW_SECONDS * WHISPER_SAMPLE_RATE as usize;
        let segment_total = samples.len().div_ceil(window) as u32;

        // First report carries the probed duration
        progress.send_replace(Some(ProgressUpdate {
            segment_index: 0,
            segment_total,
            partial_text: String::new(),
            audio_duration_seconds: Some(duration_seconds),
        }));

        let language = self.language.as_deref();
        let mut text_parts: Vec<String> = Vec::new();

        for (index, chunk) in samples.chunks(window).enumerate() {
            // Cancellation is only honored at segment boundaries
            if cancel.is_cancelled() {
                tracing::info!("Local transcription cancelled at segment {}/{}", index, segment_total);
                return Err(ProviderError::Cancelled);
            }

            let segment_text = {
                let mut guard = self.model.write().await;
                match guard.as_mut() {
                    Some(model) => model
                        .transcribe_window(chunk, language)
                        .map_err(|e| ProviderError::Fatal(format!("Whisper inference failed: {}", e)))?,
                    None => {
                        return Err(ProviderError::Unavailable("Whisper model not loaded".to_string()))
                    }
                }
            };

            if !segment_text.is_empty() {
                text_parts.push(segment_text);
            }

            progress.send_replace(Some(ProgressUpdate {
                segment_index: (index + 1) as u32,
                segment_total,
                partial_text: tail_chars(&text_parts.join(" "), PARTIAL_TEXT_CHARS),
                audio_duration_seconds: Some(duration_seconds),
            }));
        }

        let text = text_parts.join(" ").trim().to_string();
        let processing_time_seconds = started.elapsed().as_secs_f64();
        let confidence = Self::estimate_confidence(&text, duration_seconds);

        tracing::info!(
            "Local transcription completed: {:.2}s audio -> {} chars in {:.2}s (confidence: {:.2})",
            duration_seconds,
            text.len(),
            processing_time_seconds,
            confidence
        );

        Ok(ProviderOutput {
            text,
            language: self.language.clone().unwrap_or_else(|| "en".to_string()),
            confidence,
            duration_seconds,
            processing_time_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_estimation() {
        // Reasonable transcription scores above the midpoint
        let good = LocalProvider::estimate_confidence("Hello, how are you today?", 2.0);
        assert!(good > 0.5);

        // Empty transcription is low confidence
        let empty = LocalProvider::estimate_confidence("", 2.0);
        assert!(empty < 0.5);

        // Garbled output is penalized
        let garbled = LocalProvider::estimate_confidence("zzz... ???", 2.0);
        assert!(garbled < 0.5);
    }

    #[test]
    fn test_confidence_stays_in_range() {
        for text in ["", "a", "The quick brown fox. It is you and that!", "x".repeat(5000).as_str()] {
            let c = LocalProvider::estimate_confidence(text, 1.0);
            assert!((0.0..=1.0).contains(&c));
        }
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("short", 200), "short");
        let long = "a".repeat(250);
        assert_eq!(tail_chars(&long, 200).len(), 200);
        // Multi-byte characters stay on boundaries
        let accented = "é".repeat(250);
        assert_eq!(tail_chars(&accented, 200).chars().count(), 200);
    }

    #[test]
    fn test_resample_identity_and_downsample() {
        let samples = vec![0.0f32, 0.5, 1.0, 0.5];
        // Same rate passes through untouched
        assert_eq!(resample_linear(&samples, 16_000, 16_000), samples);

        // 2:1 downsample halves the length
        let down = resample_linear(&samples, 32_000, 16_000);
        assert_eq!(down.len(), 2);
        assert_eq!(down[0], 0.0);
    }

    #[test]
    fn test_unknown_model_size_rejected() {
        let config = ModelsConfig {
            whisper_model: "enormous".to_string(),
            device: "cpu".to_string(),
            language: None,
        };
        assert!(LocalProvider::new(&config).is_err());
    }
}
