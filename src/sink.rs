//! # Transcript Sink
//!
//! Outbound boundary to the persistence collaborator. When a job completes,
//! the orchestrator emits one finished-transcript record here, fire-and-forget:
//! a sink failure is logged and never affects the job's terminal state or the
//! caller-visible result.
//!
//! The record's field names mirror the storage schema on the other side of
//! the boundary and are part of the contract.

use crate::cost::CostBreakdown;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// One finished transcript, as handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptRecord {
    /// Opaque caller identity (authentication lives outside this service)
    pub user_id: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub audio_duration_seconds: Option<f64>,
    pub text: String,
    pub language: Option<String>,
    pub confidence: Option<f32>,
    /// "local" | "cloud" | "both"
    pub provider: String,
    pub cost_metrics: CostBreakdown,
    pub created_at: DateTime<Utc>,
}

/// Storage sink accepting finished transcript records.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn store(&self, record: &TranscriptRecord) -> anyhow::Result<()>;
}

/// HTTP sink: POSTs each record as JSON to a configured endpoint.
pub struct HttpSink {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(endpoint: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl TranscriptSink for HttpSink {
    async fn store(&self, record: &TranscriptRecord) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(record)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Transcript sink returned HTTP {} for job record '{}'",
                response.status(),
                record.file_name
            );
        }

        tracing::debug!("Stored transcript record for {}", record.file_name);
        Ok(())
    }
}
