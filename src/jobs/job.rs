//! # Job Data Model and State Machine
//!
//! One [`Job`] represents one transcription request from creation through a
//! terminal state. The struct itself enforces the lifecycle rules so no caller
//! can bypass them:
//!
//! ## Job Lifecycle:
//! `queued → uploading → transcribing → {complete | error}`
//!
//! - transitions are monotone and single-directional
//! - `complete` and `error` are terminal: nothing transitions out of them
//! - `result` and `error` are mutually exclusive and each set at most once
//!
//! ## Ownership:
//! A job is mutated exclusively by its own worker task; everyone else reads
//! snapshot clones taken through the registry. That's why nothing here locks —
//! the synchronization lives one level up.

use crate::cost::CostBreakdown;
use crate::providers::{ProviderKind, ProviderMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current status of a transcription job.
///
/// Serialized lowercase — the frontend matches on these strings verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job created, audio not yet ingested
    Queued,
    /// Audio payload being received/validated
    Uploading,
    /// At least one adapter is running
    Transcribing,
    /// All required adapters finished successfully; result frozen
    Complete,
    /// A required adapter failed terminally; error frozen
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Uploading => "uploading",
            JobStatus::Transcribing => "transcribing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    /// Whether `next` is a legal direct successor of `self`.
    fn can_advance_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Uploading)
                | (JobStatus::Uploading, JobStatus::Transcribing)
                | (JobStatus::Transcribing, JobStatus::Complete)
                | (JobStatus::Transcribing, JobStatus::Error)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest-known progress for a job. A snapshot, not an event log: each new
/// value fully replaces the previous one and consumers must tolerate missing
/// intermediates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Completed segments so far (monotonically non-decreasing)
    pub segment_index: u32,
    /// Best-known total segment count
    pub segment_total: u32,
    /// Wall-clock seconds since the worker started
    pub elapsed_seconds: f64,
    /// Segment-rate extrapolation of remaining time
    pub estimated_remaining_seconds: f64,
    /// Last-known decoded text fragment (may change; not authoritative)
    pub partial_text: String,
}

/// Output of one adapter run, as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub text: String,
    pub language: String,
    /// Confidence score (0.0 to 1.0)
    pub confidence: f32,
    pub processing_time_seconds: f64,
    /// What this particular run cost (USD)
    pub cost: f64,
}

/// Terminal payload of a successful job.
///
/// A tagged variant rather than a bag of optional fields: single-provider
/// jobs carry one result, dual jobs always carry both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum JobResult {
    Single {
        provider: ProviderKind,
        result: ProviderResult,
        cost_metrics: CostBreakdown,
    },
    Dual {
        local: ProviderResult,
        cloud: ProviderResult,
        cost_metrics: CostBreakdown,
    },
}

impl JobResult {
    /// The representative run surfaced to the persistence sink. Dual jobs
    /// prefer the local side, whose cost story the product tells.
    pub fn primary(&self) -> &ProviderResult {
        match self {
            JobResult::Single { result, .. } => result,
            JobResult::Dual { local, .. } => local,
        }
    }

    pub fn cost_metrics(&self) -> &CostBreakdown {
        match self {
            JobResult::Single { cost_metrics, .. } => cost_metrics,
            JobResult::Dual { cost_metrics, .. } => cost_metrics,
        }
    }
}

/// Terminal payload of a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Which provider failed (absent for failures not tied to one side)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    /// Machine-checkable kind: "unavailable" | "transient" | "fatal" | "cancelled"
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// A sibling result that completed before the failure (dual mode only):
    /// finished work is surfaced even though the job itself failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<ProviderResult>,
}

/// One transcription request.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// Opaque unique identifier, immutable after creation
    pub id: String,
    pub status: JobStatus,
    /// Which providers run, fixed at creation
    pub provider_mode: ProviderMode,
    pub file_name: String,
    /// Filled in once an adapter reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_duration_seconds: Option<f64>,
    pub file_size_bytes: u64,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: String, provider_mode: ProviderMode, file_name: String, file_size_bytes: u64) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            provider_mode,
            file_name,
            audio_duration_seconds: None,
            file_size_bytes,
            progress: Progress::default(),
            result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Advance the status along a legal edge.
    ///
    /// ## Errors:
    /// Rejects any transition not in the state machine, including every
    /// transition out of a terminal state.
    pub fn advance(&mut self, next: JobStatus) -> Result<(), String> {
        if !self.status.can_advance_to(next) {
            return Err(format!(
                "Illegal job status transition: {} -> {}",
                self.status, next
            ));
        }
        self.status = next;
        Ok(())
    }

    /// Replace the progress snapshot. Only the owning worker calls this.
    pub fn update_progress(&mut self, progress: Progress) {
        self.progress = progress;
    }

    /// Freeze the job as complete with its result.
    pub fn finish(&mut self, result: JobResult) -> Result<(), String> {
        if self.result.is_some() || self.error.is_some() {
            return Err("Job outcome already set".to_string());
        }
        self.advance(JobStatus::Complete)?;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Freeze the job as failed with its error.
    pub fn fail(&mut self, error: JobError) -> Result<(), String> {
        if self.result.is_some() || self.error.is_some() {
            return Err("Job outcome already set".to_string());
        }
        self.advance(JobStatus::Error)?;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CostConfig;
    use crate::cost;

    fn job() -> Job {
        Job::new("job-1".to_string(), ProviderMode::Local, "clip.wav".to_string(), 1024)
    }

    fn provider_result() -> ProviderResult {
        ProviderResult {
            text: "hello world".to_string(),
            language: "en".to_string(),
            confidence: 0.92,
            processing_time_seconds: 6.0,
            cost: 0.0006,
        }
    }

    fn job_result() -> JobResult {
        let rates = CostConfig {
            cloud_rate_per_minute: 0.006,
            local_rate_per_second: 0.0001,
        };
        JobResult::Single {
            provider: ProviderKind::Local,
            result: provider_result(),
            cost_metrics: cost::breakdown(&rates, 120.0, 1024, 6.0),
        }
    }

    /// Every legal edge is accepted in order.
    #[test]
    fn test_legal_transitions() {
        let mut j = job();
        assert!(j.advance(JobStatus::Uploading).is_ok());
        assert!(j.advance(JobStatus::Transcribing).is_ok());
        assert!(j.advance(JobStatus::Complete).is_ok());
        assert!(j.is_terminal());
    }

    /// Skipping states or moving backwards is rejected.
    #[test]
    fn test_illegal_transitions() {
        let mut j = job();
        // Can't skip uploading
        assert!(j.advance(JobStatus::Transcribing).is_err());
        // Can't fail from queued
        assert!(j.advance(JobStatus::Error).is_err());

        j.advance(JobStatus::Uploading).unwrap();
        // Can't regress
        assert!(j.advance(JobStatus::Queued).is_err());
        // Can't complete before transcribing
        assert!(j.advance(JobStatus::Complete).is_err());
    }

    /// Terminal states are frozen.
    #[test]
    fn test_terminal_states_frozen() {
        let mut j = job();
        j.advance(JobStatus::Uploading).unwrap();
        j.advance(JobStatus::Transcribing).unwrap();
        j.finish(job_result()).unwrap();

        assert!(j.advance(JobStatus::Uploading).is_err());
        assert!(j.advance(JobStatus::Error).is_err());
        assert!(j.advance(JobStatus::Transcribing).is_err());
    }

    /// result and error are mutually exclusive and set at most once.
    #[test]
    fn test_outcome_exclusivity() {
        let mut j = job();
        j.advance(JobStatus::Uploading).unwrap();
        j.advance(JobStatus::Transcribing).unwrap();
        j.finish(job_result()).unwrap();

        // Second outcome of either kind is rejected
        assert!(j.finish(job_result()).is_err());
        assert!(j
            .fail(JobError {
                provider: None,
                kind: "fatal".to_string(),
                message: "nope".to_string(),
                partial: None,
            })
            .is_err());

        assert!(j.result.is_some());
        assert!(j.error.is_none());
        assert!(j.finished_at.is_some());
    }

    /// Statuses serialize to the lowercase wire strings.
    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&JobStatus::Queued).unwrap(), "\"queued\"");
        assert_eq!(serde_json::to_string(&JobStatus::Transcribing).unwrap(), "\"transcribing\"");
        assert_eq!(serde_json::to_string(&JobStatus::Complete).unwrap(), "\"complete\"");
    }

    /// The result variant is tagged, not a bag of optional fields.
    #[test]
    fn test_result_tagged_serialization() {
        let json = serde_json::to_value(&job_result()).unwrap();
        assert_eq!(json["mode"], "single");
        assert_eq!(json["provider"], "local");
        assert_eq!(json["result"]["text"], "hello world");

        let dual = JobResult::Dual {
            local: provider_result(),
            cloud: provider_result(),
            cost_metrics: job_result().cost_metrics().clone(),
        };
        let json = serde_json::to_value(&dual).unwrap();
        assert_eq!(json["mode"], "dual");
        assert!(json.get("local").is_some());
        assert!(json.get("cloud").is_some());
    }
}
