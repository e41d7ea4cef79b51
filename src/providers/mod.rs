//! # Transcription Providers
//!
//! Uniform adapter interface over the concrete transcription engines: the
//! local Whisper model (Candle-rs) and the cloud transcription API.
//!
//! ## Key Components:
//! - **TranscriptionProvider trait**: the capability contract every engine implements
//! - **Local provider**: segment-windowed Candle Whisper inference
//! - **Cloud provider**: OpenAI-compatible HTTP transcription endpoint
//! - **ProviderError**: retry classification (unavailable / transient / fatal)
//!
//! ## Progress Contract:
//! Adapters report progress through a `tokio::sync::watch` channel. A watch
//! write never blocks and always replaces the unread value, so a slow consumer
//! degrades to latest-only delivery instead of stalling inference.
//!
//! ## Cancellation Contract:
//! Adapters check the shared [`CancelFlag`] between segments and abandon the
//! run promptly when it is set (dual-mode fail-fast relies on this).

pub mod cloud;
pub mod local;
pub mod whisper;

pub use cloud::CloudProvider;
pub use local::LocalProvider;

use crate::audio::AudioPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Which concrete engine produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Cloud,
}

impl ProviderKind {
    /// Wire/name form used in JSON payloads and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Cloud => "cloud",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which providers a job runs, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Local,
    Cloud,
    /// Run both providers concurrently and compare
    Both,
}

impl ProviderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMode::Local => "local",
            ProviderMode::Cloud => "cloud",
            ProviderMode::Both => "both",
        }
    }

    /// True when the mode needs the cloud provider to be configured.
    pub fn requires_cloud(&self) -> bool {
        matches!(self, ProviderMode::Cloud | ProviderMode::Both)
    }

    /// True when the mode needs the local engine.
    pub fn requires_local(&self) -> bool {
        matches!(self, ProviderMode::Local | ProviderMode::Both)
    }
}

impl std::str::FromStr for ProviderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(ProviderMode::Local),
            "cloud" => Ok(ProviderMode::Cloud),
            "both" | "dual" => Ok(ProviderMode::Both),
            other => Err(format!("Unknown provider mode: {}", other)),
        }
    }
}

impl std::fmt::Display for ProviderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider error taxonomy with retry classification.
///
/// ## Retry Policy:
/// Only `Transient` failures may be retried, and only by the orchestrator —
/// adapters themselves never retry.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider cannot run at all (missing credentials, model not
    /// configured). Surfaced before any work starts.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Network failures, timeouts, rate limits — worth another attempt
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Malformed audio, decode failures, provider-side rejections — retrying
    /// cannot help
    #[error("fatal provider failure: {0}")]
    Fatal(String),

    /// The run observed its cancel flag and stopped early
    #[error("provider run cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Returns true if the orchestrator may retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Machine-checkable kind string carried on job errors.
    pub fn kind_str(&self) -> &'static str {
        match self {
            ProviderError::Unavailable(_) => "unavailable",
            ProviderError::Transient(_) => "transient",
            ProviderError::Fatal(_) => "fatal",
            ProviderError::Cancelled => "cancelled",
        }
    }
}

/// One progress report from an adapter.
///
/// ## Snapshot semantics:
/// Each update fully replaces the previous one; `segment_index` is
/// monotonically non-decreasing within one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Completed segment count so far
    pub segment_index: u32,
    /// Best-known total segment count (may be refined upward as decoding
    /// proceeds)
    pub segment_total: u32,
    /// Most recent decoded text, capped to the trailing 200 characters
    pub partial_text: String,
    /// Audio duration, reported with the first update once the adapter has
    /// probed the payload
    pub audio_duration_seconds: Option<f64>,
}

/// Channel the adapter writes progress into. `None` until the first update.
pub type ProgressSender = tokio::sync::watch::Sender<Option<ProgressUpdate>>;

/// Successful output of one adapter run.
#[derive(Debug, Clone)]
pub struct ProviderOutput {
    /// Full transcribed text
    pub text: String,
    /// Detected or configured language
    pub language: String,
    /// Confidence score (0.0 to 1.0)
    pub confidence: f32,
    /// Audio duration the adapter measured (seconds)
    pub duration_seconds: f64,
    /// Wall-clock inference time (seconds)
    pub processing_time_seconds: f64,
}

/// Cooperative cancellation signal shared between the orchestrator and an
/// adapter run.
///
/// ## Why an atomic and not a channel:
/// The adapter only ever needs "should I stop?" at segment boundaries; an
/// `AtomicBool` behind an `Arc` answers that without any await point.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Unified transcription provider trait.
///
/// ## Contract:
/// - `transcribe` runs to completion, reporting progress at least once per
///   finished segment, and never blocks on a slow progress consumer
/// - no side effects beyond producing text; persistence belongs to the caller
/// - implementations never retry internally (see [`ProviderError`])
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Which engine this is.
    fn kind(&self) -> ProviderKind;

    /// Whether the provider is configured well enough to accept work.
    fn available(&self) -> bool;

    /// Transcribe the payload, reporting progress through `progress` and
    /// honoring `cancel` between segments.
    async fn transcribe(
        &self,
        audio: &AudioPayload,
        progress: &ProgressSender,
        cancel: &CancelFlag,
    ) -> Result<ProviderOutput, ProviderError>;
}
