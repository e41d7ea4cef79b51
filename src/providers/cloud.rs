//! # Cloud Transcription Provider
//!
//! Adapter for an OpenAI-compatible `audio/transcriptions` endpoint. The
//! request is a single multipart POST, so progress is coarse: one report when
//! the upload starts and one when the response lands.
//!
//! ## Error mapping:
//! - missing/rejected credentials → `Unavailable` (fails fast, never retried)
//! - timeouts, connection failures, 429, 5xx → `Transient` (orchestrator may retry)
//! - other 4xx (bad audio, unsupported format) → `Fatal`

use super::{
    CancelFlag, ProgressSender, ProgressUpdate, ProviderError, ProviderKind, ProviderOutput,
    TranscriptionProvider,
};
use crate::audio::AudioPayload;
use crate::config::ProvidersConfig;
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Cloud speech-to-text over HTTP.
pub struct CloudProvider {
    api_url: String,
    api_key: Option<String>,
    model: String,
    language: Option<String>,
    client: reqwest::Client,
}

/// Response body of a `verbose_json` transcription request.
#[derive(Debug, Deserialize)]
struct CloudTranscription {
    text: String,
    language: Option<String>,
    duration: Option<f64>,
}

impl CloudProvider {
    pub fn new(config: &ProvidersConfig, language: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            api_url: config.cloud_api_url.trim_end_matches('/').to_string(),
            api_key: config.cloud_api_key.clone(),
            model: config.cloud_model.clone(),
            language,
            client,
        })
    }

    fn credentials(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::Unavailable("Cloud provider requested but no API key is configured".to_string())
            })
    }

    /// Map an HTTP response status to a provider error kind.
    fn map_status(status: u16, body: &str) -> ProviderError {
        match status {
            401 | 403 => ProviderError::Unavailable("Cloud API rejected the configured credentials".to_string()),
            429 => ProviderError::Transient("Cloud API rate limit exceeded".to_string()),
            s if s >= 500 => ProviderError::Transient(format!("Cloud API server error (HTTP {}): {}", s, body)),
            s => ProviderError::Fatal(format!("Cloud API rejected the request (HTTP {}): {}", s, body)),
        }
    }

    /// Map a transport-level failure to a provider error kind.
    fn map_transport_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Transient("Cloud API request timed out".to_string())
        } else {
            ProviderError::Transient(format!("Network error reaching cloud API: {}", err))
        }
    }
}

#[async_trait]
impl TranscriptionProvider for CloudProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    fn available(&self) -> bool {
        self.credentials().is_ok()
    }

    async fn transcribe(
        &self,
        audio: &AudioPayload,
        progress: &ProgressSender,
        cancel: &CancelFlag,
    ) -> Result<ProviderOutput, ProviderError> {
        // Credentials are checked before any work starts
        let api_key = self.credentials()?.to_string();

        if audio.is_empty() {
            return Err(ProviderError::Fatal("Audio payload is empty".to_string()));
        }

        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let started = Instant::now();

        // Probe duration locally: the cost model needs it even if the API
        // omits it from the response
        let probed_duration = audio.probe_duration_seconds();

        // The whole request is one segment from the caller's perspective
        progress.send_replace(Some(ProgressUpdate {
            segment_index: 0,
            segment_total: 1,
            partial_text: String::new(),
            audio_duration_seconds: probed_duration,
        }));

        let file_part = multipart::Part::bytes(audio.bytes().to_vec())
            .file_name(audio.file_name.clone())
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::Fatal(format!("Failed to build upload part: {}", e)))?;

        let mut form = multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .part("file", file_part);

        if let Some(lang) = &self.language {
            form = form.text("language", lang.clone());
        }

        tracing::info!(
            "Cloud transcription request: {} ({} bytes)",
            audio.file_name,
            audio.size_bytes()
        );

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.api_url))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status.as_u16(), &body));
        }

        let parsed: CloudTranscription = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("Cloud API returned unparseable JSON: {}", e)))?;

        let duration_seconds = parsed.duration.or(probed_duration).unwrap_or(0.0);
        let processing_time_seconds = started.elapsed().as_secs_f64();
        let text = parsed.text.trim().to_string();

        progress.send_replace(Some(ProgressUpdate {
            segment_index: 1,
            segment_total: 1,
            partial_text: text.chars().rev().take(200).collect::<Vec<_>>().into_iter().rev().collect(),
            audio_duration_seconds: Some(duration_seconds),
        }));

        tracing::info!(
            "Cloud transcription completed: {} chars in {:.2}s",
            text.len(),
            processing_time_seconds
        );

        Ok(ProviderOutput {
            text,
            language: parsed
                .language
                .or_else(|| self.language.clone())
                .unwrap_or_else(|| "en".to_string()),
            // The API does not return a confidence score; assume high for a
            // successful response
            confidence: 0.95,
            duration_seconds,
            processing_time_seconds,
        })
    }
}
