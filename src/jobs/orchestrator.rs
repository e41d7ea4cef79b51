//! # Job Orchestrator
//!
//! Top-level coordinator of the job engine: validates requests, creates jobs
//! in the registry, spawns one worker task per job, and drives one or two
//! provider adapters to a terminal Result or Error.
//!
//! ## Worker shape:
//! Each adapter run gets its own `watch` channel (latest-only progress) and
//! cancel flag. The worker is the only task that mutates the Job; it converts
//! adapter updates into [`Progress`] snapshots (elapsed time, segment-rate
//! ETA) and publishes them through the broadcaster.
//!
//! ## Dual mode:
//! Both adapters run concurrently. Progress publishes whichever side is
//! further along (clamped so the published `segment_index` never regresses).
//! The job completes only when both sides succeed; when one side fails
//! terminally the sibling is cancelled (fail-fast), and a sibling result that
//! finished before the failure is preserved on the job error.
//!
//! ## Retries:
//! Only `Transient` provider failures are retried, with exponential backoff,
//! up to the configured attempt budget. Exhaustion converts to a job error.

use super::broadcaster::{ProgressBroadcaster, ProgressFrame, TerminalFrame};
use super::job::{JobError, JobResult, JobStatus, Progress, ProviderResult};
use super::registry::{JobHandle, JobRegistry};
use crate::audio::AudioPayload;
use crate::config::CostConfig;
use crate::cost;
use crate::error::AppError;
use crate::providers::{
    CancelFlag, ProgressUpdate, ProviderError, ProviderKind, ProviderMode, ProviderOutput,
    TranscriptionProvider,
};
use crate::sink::{TranscriptRecord, TranscriptSink};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub struct JobOrchestrator {
    registry: Arc<JobRegistry>,
    broadcaster: Arc<ProgressBroadcaster>,
    local: Option<Arc<dyn TranscriptionProvider>>,
    cloud: Option<Arc<dyn TranscriptionProvider>>,
    rates: CostConfig,
    max_retries: u8,
    retry_base_delay: Duration,
    sink: Option<Arc<dyn TranscriptSink>>,
}

impl JobOrchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        broadcaster: Arc<ProgressBroadcaster>,
        local: Option<Arc<dyn TranscriptionProvider>>,
        cloud: Option<Arc<dyn TranscriptionProvider>>,
        rates: CostConfig,
        max_retries: u8,
        sink: Option<Arc<dyn TranscriptSink>>,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            local,
            cloud,
            rates,
            max_retries,
            retry_base_delay: Duration::from_secs(2),
            sink,
        }
    }

    /// Shrink the retry backoff (tests don't want to sleep for real).
    #[cfg(test)]
    fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Provider availability as shown to callers before they pick a mode.
    pub fn availability(&self) -> (bool, bool) {
        let local = self.local.as_ref().map(|p| p.available()).unwrap_or(false);
        let cloud = self.cloud.as_ref().map(|p| p.available()).unwrap_or(false);
        (local, cloud)
    }

    fn provider_for(&self, kind: ProviderKind) -> Option<Arc<dyn TranscriptionProvider>> {
        match kind {
            ProviderKind::Local => self.local.clone(),
            ProviderKind::Cloud => self.cloud.clone(),
        }
    }

    /// Reject a mode whose providers can't serve it — before any job exists.
    fn check_mode_available(&self, mode: ProviderMode) -> Result<(), AppError> {
        let (local_ok, cloud_ok) = self.availability();
        if mode.requires_local() && !local_ok {
            return Err(AppError::ProviderUnavailable(
                "Local transcription engine is not available".to_string(),
            ));
        }
        if mode.requires_cloud() && !cloud_ok {
            return Err(AppError::ProviderUnavailable(
                "Cloud provider requested but no API key is configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Start a job and return immediately with its id.
    ///
    /// ## Validation order:
    /// Payload presence and provider availability are checked first; a job id
    /// is only ever returned for work that has actually been admitted.
    pub fn start(
        self: &Arc<Self>,
        audio: AudioPayload,
        mode: ProviderMode,
        user_id: String,
    ) -> Result<String, AppError> {
        if audio.is_empty() {
            return Err(AppError::ValidationError("No audio supplied".to_string()));
        }
        self.check_mode_available(mode)?;

        let job_id = self
            .registry
            .create(mode, audio.file_name.clone(), audio.size_bytes())
            .map_err(AppError::BadRequest)?;

        self.broadcaster.register(&job_id);

        let orchestrator = Arc::clone(self);
        let id = job_id.clone();
        tokio::spawn(async move {
            orchestrator.run_job(id, audio, user_id).await;
        });

        tracing::info!("Started {} job {}", mode, job_id);
        Ok(job_id)
    }

    /// Blocking variant: start a job and wait for its terminal outcome.
    pub async fn run_sync(
        self: &Arc<Self>,
        audio: AudioPayload,
        mode: ProviderMode,
        user_id: String,
    ) -> Result<JobResult, AppError> {
        let job_id = self.start(audio, mode, user_id)?;
        self.wait_result(&job_id).await
    }

    /// Wait for an already-started job to reach a terminal state.
    pub async fn wait_result(&self, job_id: &str) -> Result<JobResult, AppError> {
        let mut subscription = self
            .broadcaster
            .subscribe(job_id)
            .ok_or_else(|| AppError::Internal("Job stream vanished before completion".to_string()))?;

        while let Some(frame) = subscription.next().await {
            match frame {
                ProgressFrame::Snapshot(_) => continue,
                ProgressFrame::Terminal(TerminalFrame::Complete(result)) => return Ok(result),
                ProgressFrame::Terminal(TerminalFrame::Failed(error)) => {
                    return Err(Self::job_error_to_app(error));
                }
            }
        }

        Err(AppError::Internal("Job stream closed without a terminal frame".to_string()))
    }

    fn job_error_to_app(error: JobError) -> AppError {
        let provider = error
            .provider
            .map(|p| format!("{} provider: ", p))
            .unwrap_or_default();
        let message = format!("{}{}", provider, error.message);
        match error.kind.as_str() {
            "unavailable" => AppError::ProviderUnavailable(message),
            _ => AppError::Internal(message),
        }
    }

    /// The worker: owns all mutation of one job from `queued` to terminal.
    async fn run_job(self: Arc<Self>, job_id: String, audio: AudioPayload, user_id: String) {
        let Some(handle) = self.registry.handle(&job_id) else {
            tracing::error!("Worker started for unknown job {}", job_id);
            return;
        };
        let mode = handle.read().unwrap().provider_mode;
        let started = Instant::now();

        // Payload is already in memory; the uploading state is brief but the
        // machine still walks every edge
        Self::advance(&handle, JobStatus::Uploading);
        self.broadcaster
            .publish(&job_id, ProgressFrame::Snapshot(Progress::default()));
        Self::advance(&handle, JobStatus::Transcribing);

        let outcome = match mode {
            ProviderMode::Local => self.run_single(&handle, &job_id, ProviderKind::Local, &audio, started).await,
            ProviderMode::Cloud => self.run_single(&handle, &job_id, ProviderKind::Cloud, &audio, started).await,
            ProviderMode::Both => self.run_dual(&handle, &job_id, &audio, started).await,
        };

        match outcome {
            Ok(result) => self.finalize_success(&handle, &job_id, result, &user_id),
            Err(error) => self.finalize_error(&handle, &job_id, error),
        }
    }

    /// Run one adapter to completion, streaming its progress.
    async fn run_single(
        &self,
        handle: &JobHandle,
        job_id: &str,
        kind: ProviderKind,
        audio: &AudioPayload,
        started: Instant,
    ) -> Result<JobResult, JobError> {
        // Availability was verified in start(); a missing provider here is a bug
        let provider = self.provider_for(kind).ok_or_else(|| JobError {
            provider: Some(kind),
            kind: "unavailable".to_string(),
            message: format!("{} provider not configured", kind),
            partial: None,
        })?;

        let (progress_tx, mut progress_rx) = watch::channel(None);
        let cancel = CancelFlag::new();

        let mut adapter = tokio::spawn(Self::run_with_retry(
            provider,
            audio.clone(),
            progress_tx,
            cancel.clone(),
            self.max_retries,
            self.retry_base_delay,
        ));

        let mut watch_open = true;
        let run_result = loop {
            tokio::select! {
                joined = &mut adapter => {
                    break joined.unwrap_or_else(|e| {
                        Err(ProviderError::Fatal(format!("Adapter task failed: {}", e)))
                    });
                }
                changed = progress_rx.changed(), if watch_open => {
                    match changed {
                        Ok(()) => {
                            let update = progress_rx.borrow_and_update().clone();
                            if let Some(update) = update {
                                self.apply_progress(handle, job_id, &update, started);
                            }
                        }
                        Err(_) => watch_open = false,
                    }
                }
            }
        };

        // Apply the last progress report the select loop may not have seen
        if let Some(update) = progress_rx.borrow().clone() {
            self.apply_progress(handle, job_id, &update, started);
        }

        match run_result {
            Ok(output) => {
                let breakdown = cost::breakdown(
                    &self.rates,
                    output.duration_seconds,
                    audio.size_bytes(),
                    output.processing_time_seconds,
                );
                let result = self.to_provider_result(kind, &output);
                Ok(JobResult::Single {
                    provider: kind,
                    result,
                    cost_metrics: breakdown,
                })
            }
            Err(error) => Err(JobError {
                provider: Some(kind),
                kind: error.kind_str().to_string(),
                message: error.to_string(),
                partial: None,
            }),
        }
    }

    /// Run both adapters concurrently and merge their outcomes.
    async fn run_dual(
        &self,
        handle: &JobHandle,
        job_id: &str,
        audio: &AudioPayload,
        started: Instant,
    ) -> Result<JobResult, JobError> {
        let local_provider = self.provider_for(ProviderKind::Local);
        let cloud_provider = self.provider_for(ProviderKind::Cloud);
        let (Some(local_provider), Some(cloud_provider)) = (local_provider, cloud_provider) else {
            return Err(JobError {
                provider: None,
                kind: "unavailable".to_string(),
                message: "Dual mode requires both providers".to_string(),
                partial: None,
            });
        };

        let (local_tx, mut local_rx) = watch::channel(None);
        let (cloud_tx, mut cloud_rx) = watch::channel(None);
        let local_cancel = CancelFlag::new();
        let cloud_cancel = CancelFlag::new();

        let mut local_task = tokio::spawn(Self::run_with_retry(
            local_provider,
            audio.clone(),
            local_tx,
            local_cancel.clone(),
            self.max_retries,
            self.retry_base_delay,
        ));
        let mut cloud_task = tokio::spawn(Self::run_with_retry(
            cloud_provider,
            audio.clone(),
            cloud_tx,
            cloud_cancel.clone(),
            self.max_retries,
            self.retry_base_delay,
        ));

        let mut local_result: Option<Result<ProviderOutput, ProviderError>> = None;
        let mut cloud_result: Option<Result<ProviderOutput, ProviderError>> = None;
        let mut local_watch_open = true;
        let mut cloud_watch_open = true;
        let mut merge = DualProgressMerge::default();

        while local_result.is_none() || cloud_result.is_none() {
            tokio::select! {
                joined = &mut local_task, if local_result.is_none() => {
                    let result = joined.unwrap_or_else(|e| {
                        Err(ProviderError::Fatal(format!("Local adapter task failed: {}", e)))
                    });
                    if result.is_err() {
                        // Fail-fast: stop the sibling, its remaining work is wasted
                        cloud_cancel.cancel();
                    }
                    local_result = Some(result);
                }
                joined = &mut cloud_task, if cloud_result.is_none() => {
                    let result = joined.unwrap_or_else(|e| {
                        Err(ProviderError::Fatal(format!("Cloud adapter task failed: {}", e)))
                    });
                    if result.is_err() {
                        local_cancel.cancel();
                    }
                    cloud_result = Some(result);
                }
                changed = local_rx.changed(), if local_watch_open => {
                    match changed {
                        Ok(()) => {
                            let update = local_rx.borrow_and_update().clone();
                            if let Some(update) = update {
                                merge.local = Some(update);
                                if let Some(chosen) = merge.choose() {
                                    self.apply_progress(handle, job_id, &chosen, started);
                                }
                            }
                        }
                        Err(_) => local_watch_open = false,
                    }
                }
                changed = cloud_rx.changed(), if cloud_watch_open => {
                    match changed {
                        Ok(()) => {
                            let update = cloud_rx.borrow_and_update().clone();
                            if let Some(update) = update {
                                merge.cloud = Some(update);
                                if let Some(chosen) = merge.choose() {
                                    self.apply_progress(handle, job_id, &chosen, started);
                                }
                            }
                        }
                        Err(_) => cloud_watch_open = false,
                    }
                }
            }
        }

        let local_result = local_result.expect("loop exits only when set");
        let cloud_result = cloud_result.expect("loop exits only when set");

        match (local_result, cloud_result) {
            (Ok(local_out), Ok(cloud_out)) => {
                // The differential comparison: what local compute cost versus
                // what the cloud charges for this audio
                let breakdown = cost::breakdown(
                    &self.rates,
                    local_out.duration_seconds.max(cloud_out.duration_seconds),
                    audio.size_bytes(),
                    local_out.processing_time_seconds,
                );
                Ok(JobResult::Dual {
                    local: self.to_provider_result(ProviderKind::Local, &local_out),
                    cloud: self.to_provider_result(ProviderKind::Cloud, &cloud_out),
                    cost_metrics: breakdown,
                })
            }
            (Err(error), Ok(cloud_out)) => Err(JobError {
                provider: Some(ProviderKind::Local),
                kind: error.kind_str().to_string(),
                message: error.to_string(),
                partial: Some(self.to_provider_result(ProviderKind::Cloud, &cloud_out)),
            }),
            (Ok(local_out), Err(error)) => Err(JobError {
                provider: Some(ProviderKind::Cloud),
                kind: error.kind_str().to_string(),
                message: error.to_string(),
                partial: Some(self.to_provider_result(ProviderKind::Local, &local_out)),
            }),
            (Err(local_err), Err(cloud_err)) => {
                // One of the two usually failed first and cancelled the other;
                // report the one that wasn't merely cancelled
                let (provider, error) = if matches!(local_err, ProviderError::Cancelled) {
                    (ProviderKind::Cloud, cloud_err)
                } else {
                    (ProviderKind::Local, local_err)
                };
                Err(JobError {
                    provider: Some(provider),
                    kind: error.kind_str().to_string(),
                    message: error.to_string(),
                    partial: None,
                })
            }
        }
    }

    /// Invoke an adapter, retrying transient failures with exponential backoff.
    async fn run_with_retry(
        provider: Arc<dyn TranscriptionProvider>,
        audio: AudioPayload,
        progress: watch::Sender<Option<ProgressUpdate>>,
        cancel: CancelFlag,
        max_retries: u8,
        base_delay: Duration,
    ) -> Result<ProviderOutput, ProviderError> {
        let mut attempt: u8 = 0;
        loop {
            match provider.transcribe(&audio, &progress, &cancel).await {
                Ok(output) => return Ok(output),
                Err(error) => {
                    if !error.is_retryable() || attempt >= max_retries || cancel.is_cancelled() {
                        return Err(error);
                    }
                    let delay = base_delay * 2u32.saturating_pow(attempt as u32);
                    tracing::warn!(
                        "{} provider transient failure (attempt {}/{}), retrying in {:?}: {}",
                        provider.kind(),
                        attempt + 1,
                        max_retries + 1,
                        delay,
                        error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn to_provider_result(&self, kind: ProviderKind, output: &ProviderOutput) -> ProviderResult {
        ProviderResult {
            text: output.text.clone(),
            language: output.language.clone(),
            confidence: output.confidence,
            processing_time_seconds: output.processing_time_seconds,
            cost: cost::run_cost(
                &self.rates,
                kind,
                output.duration_seconds,
                output.processing_time_seconds,
            ),
        }
    }

    /// Convert an adapter update into a Progress snapshot and publish it.
    fn apply_progress(&self, handle: &JobHandle, job_id: &str, update: &ProgressUpdate, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();

        // Segment-rate extrapolation; zero until the first segment lands
        let estimated_remaining = if update.segment_index > 0 && update.segment_total > update.segment_index {
            elapsed / update.segment_index as f64
                * (update.segment_total - update.segment_index) as f64
        } else {
            0.0
        };

        let progress = Progress {
            segment_index: update.segment_index,
            segment_total: update.segment_total,
            elapsed_seconds: elapsed,
            estimated_remaining_seconds: estimated_remaining,
            partial_text: update.partial_text.clone(),
        };

        {
            let mut job = handle.write().unwrap();
            if job.is_terminal() {
                // A straggling update lost the race with finalization
                return;
            }
            // A retried adapter restarts its segment count from zero; published
            // progress must never regress, so those early re-runs stay silent
            if progress.segment_index < job.progress.segment_index {
                return;
            }
            if let Some(duration) = update.audio_duration_seconds {
                job.audio_duration_seconds = Some(duration);
            }
            job.update_progress(progress.clone());
        }

        self.broadcaster
            .publish(job_id, ProgressFrame::Snapshot(progress));
    }

    fn advance(handle: &JobHandle, next: JobStatus) {
        let mut job = handle.write().unwrap();
        if let Err(e) = job.advance(next) {
            tracing::error!("Job {}: {}", job.id, e);
        }
    }

    fn finalize_success(&self, handle: &JobHandle, job_id: &str, result: JobResult, user_id: &str) {
        {
            let mut job = handle.write().unwrap();
            if let Err(e) = job.finish(result.clone()) {
                tracing::error!("Job {}: {}", job_id, e);
                return;
            }
        }

        self.broadcaster
            .publish(job_id, ProgressFrame::Terminal(TerminalFrame::Complete(result.clone())));
        tracing::info!("Job {} complete", job_id);

        self.dispatch_sink(handle, result, user_id);
    }

    fn finalize_error(&self, handle: &JobHandle, job_id: &str, error: JobError) {
        {
            let mut job = handle.write().unwrap();
            if let Err(e) = job.fail(error.clone()) {
                tracing::error!("Job {}: {}", job_id, e);
                return;
            }
        }

        self.broadcaster
            .publish(job_id, ProgressFrame::Terminal(TerminalFrame::Failed(error.clone())));
        tracing::warn!(
            "Job {} failed ({}): {}",
            job_id,
            error.provider.map(|p| p.as_str()).unwrap_or("engine"),
            error.message
        );
    }

    /// Emit the finished-transcript record, fire-and-forget. The job is
    /// already terminal; nothing that happens here can change that.
    fn dispatch_sink(&self, handle: &JobHandle, result: JobResult, user_id: &str) {
        let Some(sink) = self.sink.clone() else {
            tracing::debug!("No transcript sink configured, skipping persistence");
            return;
        };

        let job = handle.read().unwrap();
        let primary = result.primary();
        let record = TranscriptRecord {
            user_id: user_id.to_string(),
            file_name: job.file_name.clone(),
            file_size_bytes: job.file_size_bytes,
            audio_duration_seconds: job.audio_duration_seconds,
            text: primary.text.clone(),
            language: Some(primary.language.clone()),
            confidence: Some(primary.confidence),
            provider: job.provider_mode.as_str().to_string(),
            cost_metrics: result.cost_metrics().clone(),
            created_at: chrono::Utc::now(),
        };
        drop(job);

        tokio::spawn(async move {
            if let Err(e) = sink.store(&record).await {
                tracing::error!("Transcript sink failure (job state unaffected): {}", e);
            }
        });
    }
}

/// Latest update per side plus the clamp that keeps published progress
/// monotone across the merge.
#[derive(Default)]
struct DualProgressMerge {
    local: Option<ProgressUpdate>,
    cloud: Option<ProgressUpdate>,
    last_published_index: u32,
}

impl DualProgressMerge {
    /// Pick whichever side is further along by completed fraction. Returns
    /// None when publishing the candidate would regress `segment_index`.
    fn choose(&mut self) -> Option<ProgressUpdate> {
        fn fraction(update: &ProgressUpdate) -> f64 {
            if update.segment_total == 0 {
                return 0.0;
            }
            update.segment_index as f64 / update.segment_total as f64
        }

        let candidate = match (&self.local, &self.cloud) {
            (Some(l), Some(c)) => {
                if fraction(l) >= fraction(c) {
                    l.clone()
                } else {
                    c.clone()
                }
            }
            (Some(l), None) => l.clone(),
            (None, Some(c)) => c.clone(),
            (None, None) => return None,
        };

        if candidate.segment_index < self.last_published_index {
            return None;
        }
        self.last_published_index = candidate.segment_index;
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::Job;
    use crate::providers::ProgressSender;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// How a scripted provider behaves for a test.
    enum MockBehavior {
        /// Emit the segments, then succeed
        Succeed,
        /// Fail fatally before emitting anything
        FailFatal,
        /// Fail transiently on the first `n` attempts, then succeed
        FailTransientTimes(usize),
        /// Fail transiently on every attempt
        AlwaysTransient,
    }

    /// Scripted provider for orchestrator tests.
    struct MockProvider {
        kind: ProviderKind,
        available: bool,
        behavior: MockBehavior,
        segments: Vec<&'static str>,
        duration_seconds: f64,
        processing_time_seconds: f64,
        segment_delay: Duration,
        attempts: AtomicUsize,
    }

    impl MockProvider {
        fn succeeding(kind: ProviderKind) -> Self {
            Self {
                kind,
                available: true,
                behavior: MockBehavior::Succeed,
                segments: vec!["hello", "world"],
                duration_seconds: 120.0,
                processing_time_seconds: 6.0,
                segment_delay: Duration::from_millis(2),
                attempts: AtomicUsize::new(0),
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TranscriptionProvider for MockProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn available(&self) -> bool {
            self.available
        }

        async fn transcribe(
            &self,
            _audio: &AudioPayload,
            progress: &ProgressSender,
            cancel: &CancelFlag,
        ) -> Result<ProviderOutput, ProviderError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

            match &self.behavior {
                MockBehavior::FailFatal => {
                    return Err(ProviderError::Fatal("scripted fatal failure".to_string()))
                }
                MockBehavior::AlwaysTransient => {
                    return Err(ProviderError::Transient("scripted network error".to_string()))
                }
                MockBehavior::FailTransientTimes(n) if attempt < *n => {
                    return Err(ProviderError::Transient("scripted network error".to_string()))
                }
                _ => {}
            }

            let total = self.segments.len() as u32;
            let mut parts: Vec<&str> = Vec::new();

            for (index, segment) in self.segments.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Cancelled);
                }
                tokio::time::sleep(self.segment_delay).await;
                parts.push(segment);
                progress.send_replace(Some(ProgressUpdate {
                    segment_index: (index + 1) as u32,
                    segment_total: total,
                    partial_text: parts.join(" "),
                    audio_duration_seconds: Some(self.duration_seconds),
                }));
            }

            Ok(ProviderOutput {
                text: parts.join(" "),
                language: "en".to_string(),
                confidence: 0.92,
                duration_seconds: self.duration_seconds,
                processing_time_seconds: self.processing_time_seconds,
            })
        }
    }

    /// Sink that records what was stored.
    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<TranscriptRecord>>,
    }

    #[async_trait]
    impl crate::sink::TranscriptSink for RecordingSink {
        async fn store(&self, record: &TranscriptRecord) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn rates() -> CostConfig {
        CostConfig {
            cloud_rate_per_minute: 0.006,
            local_rate_per_second: 0.0001,
        }
    }

    fn build(
        local: Option<MockProvider>,
        cloud: Option<MockProvider>,
        sink: Option<Arc<dyn TranscriptSink>>,
    ) -> Arc<JobOrchestrator> {
        let registry = Arc::new(JobRegistry::new(8, 300));
        let broadcaster = Arc::new(ProgressBroadcaster::new(64));
        Arc::new(
            JobOrchestrator::new(
                registry,
                broadcaster,
                local.map(|p| Arc::new(p) as Arc<dyn TranscriptionProvider>),
                cloud.map(|p| Arc::new(p) as Arc<dyn TranscriptionProvider>),
                rates(),
                2,
                sink,
            )
            .with_retry_base_delay(Duration::from_millis(1)),
        )
    }

    fn payload() -> AudioPayload {
        AudioPayload::new(vec![0u8; 2048], "clip.wav")
    }

    async fn wait_terminal(orchestrator: &Arc<JobOrchestrator>, job_id: &str) -> Job {
        let mut subscription = orchestrator.broadcaster.subscribe(job_id).unwrap();
        while let Some(frame) = subscription.next().await {
            if frame.is_terminal() {
                break;
            }
        }
        orchestrator.registry.get(job_id).unwrap()
    }

    /// A single local job runs its segments and completes with the
    /// expected cost breakdown.
    #[tokio::test]
    async fn test_single_local_job_completes() {
        let mut local = MockProvider::succeeding(ProviderKind::Local);
        local.segments = vec!["seg1", "seg2", "seg3", "hello world"];
        let orchestrator = build(Some(local), None, None);

        let job_id = orchestrator
            .start(payload(), ProviderMode::Local, "user-1".to_string())
            .unwrap();
        let job = wait_terminal(&orchestrator, &job_id).await;

        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.audio_duration_seconds, Some(120.0));
        assert_eq!(job.progress.segment_index, 4);

        let Some(JobResult::Single { provider, result, cost_metrics }) = job.result else {
            panic!("expected single result");
        };
        assert_eq!(provider, ProviderKind::Local);
        assert_eq!(result.confidence, 0.92);
        assert_eq!(result.processing_time_seconds, 6.0);
        // 2 minutes at $0.006/min vs 6s at $0.0001/s
        assert_eq!(cost_metrics.cloud_api_cost, 0.012);
        assert_eq!(cost_metrics.local_compute_cost, 0.0006);
        assert_eq!(cost_metrics.savings, 0.012 - 0.0006);
        assert!(job.error.is_none());
    }

    /// A subscriber observes non-decreasing segment indexes and the terminal
    /// frame last.
    #[tokio::test]
    async fn test_progress_stream_is_monotone() {
        let orchestrator = build(Some(MockProvider::succeeding(ProviderKind::Local)), None, None);
        let job_id = orchestrator
            .start(payload(), ProviderMode::Local, "user-1".to_string())
            .unwrap();

        let mut subscription = orchestrator.broadcaster.subscribe(&job_id).unwrap();
        let mut last_index = 0;
        let mut saw_terminal = false;
        while let Some(frame) = subscription.next().await {
            match frame {
                ProgressFrame::Snapshot(p) => {
                    assert!(!saw_terminal, "snapshot after terminal frame");
                    assert!(p.segment_index >= last_index);
                    last_index = p.segment_index;
                }
                ProgressFrame::Terminal(_) => {
                    saw_terminal = true;
                    break;
                }
            }
        }
        assert!(saw_terminal);
    }

    /// Cloud mode without a configured cloud provider is rejected before any
    /// job is registered.
    #[tokio::test]
    async fn test_cloud_unavailable_rejected_up_front() {
        let orchestrator = build(Some(MockProvider::succeeding(ProviderKind::Local)), None, None);

        let err = orchestrator
            .start(payload(), ProviderMode::Cloud, "user-1".to_string())
            .unwrap_err();
        assert!(matches!(err, AppError::ProviderUnavailable(_)));

        let err = orchestrator
            .start(payload(), ProviderMode::Both, "user-1".to_string())
            .unwrap_err();
        assert!(matches!(err, AppError::ProviderUnavailable(_)));

        // No job was ever created
        assert_eq!(orchestrator.registry.counts(), (0, 0));
    }

    /// Empty payloads never become jobs.
    #[tokio::test]
    async fn test_empty_audio_rejected() {
        let orchestrator = build(Some(MockProvider::succeeding(ProviderKind::Local)), None, None);
        let err = orchestrator
            .start(
                AudioPayload::new(Vec::new(), "empty.wav"),
                ProviderMode::Local,
                "user-1".to_string(),
            )
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        assert_eq!(orchestrator.registry.counts(), (0, 0));
    }

    /// Transient failures are retried up to the budget, then succeed.
    #[tokio::test]
    async fn test_transient_retry_then_success() {
        let mut local = MockProvider::succeeding(ProviderKind::Local);
        local.behavior = MockBehavior::FailTransientTimes(2);
        let local = Arc::new(local);

        let orchestrator = Arc::new(
            JobOrchestrator::new(
                Arc::new(JobRegistry::new(8, 300)),
                Arc::new(ProgressBroadcaster::new(64)),
                Some(local.clone() as Arc<dyn TranscriptionProvider>),
                None,
                rates(),
                2,
                None,
            )
            .with_retry_base_delay(Duration::from_millis(1)),
        );

        let job_id = orchestrator
            .start(payload(), ProviderMode::Local, "user-1".to_string())
            .unwrap();
        let job = wait_terminal(&orchestrator, &job_id).await;
        assert_eq!(job.status, JobStatus::Complete);
        // Two transient failures plus the successful attempt
        assert_eq!(local.attempts(), 3);
    }

    /// Retry exhaustion converts to a job error with the transient kind.
    #[tokio::test]
    async fn test_transient_retry_exhaustion() {
        let mut local = MockProvider::succeeding(ProviderKind::Local);
        local.behavior = MockBehavior::AlwaysTransient;
        let orchestrator = build(Some(local), None, None);

        let job_id = orchestrator
            .start(payload(), ProviderMode::Local, "user-1".to_string())
            .unwrap();
        let job = wait_terminal(&orchestrator, &job_id).await;

        assert_eq!(job.status, JobStatus::Error);
        let error = job.error.unwrap();
        assert_eq!(error.kind, "transient");
        assert_eq!(error.provider, Some(ProviderKind::Local));
        assert!(job.result.is_none());
    }

    /// Dual mode with both sides succeeding carries both results.
    #[tokio::test]
    async fn test_dual_both_succeed() {
        let local = MockProvider::succeeding(ProviderKind::Local);
        let mut cloud = MockProvider::succeeding(ProviderKind::Cloud);
        cloud.segments = vec!["hello world"];
        cloud.processing_time_seconds = 2.5;
        let orchestrator = build(Some(local), Some(cloud), None);

        let job_id = orchestrator
            .start(payload(), ProviderMode::Both, "user-1".to_string())
            .unwrap();
        let job = wait_terminal(&orchestrator, &job_id).await;

        assert_eq!(job.status, JobStatus::Complete);
        let Some(JobResult::Dual { local, cloud, cost_metrics }) = job.result else {
            panic!("expected dual result");
        };
        assert_eq!(local.processing_time_seconds, 6.0);
        assert_eq!(cloud.processing_time_seconds, 2.5);
        // The differential breakdown uses the local side's processing time
        assert_eq!(cost_metrics.processing_time_seconds, 6.0);
        assert_eq!(cost_metrics.cloud_api_cost, 0.012);
    }

    /// Local succeeds while cloud exhausts its transient retries: the job
    /// fails identifying cloud, but local's finished result is preserved.
    #[tokio::test]
    async fn test_dual_cloud_fails_local_result_preserved() {
        let local = MockProvider::succeeding(ProviderKind::Local);
        let mut cloud = MockProvider::succeeding(ProviderKind::Cloud);
        cloud.behavior = MockBehavior::AlwaysTransient;

        // Cloud's retry backoff (20ms + 40ms) comfortably outlasts local's
        // ~4ms run, so local has always finished when cloud gives up
        let orchestrator = Arc::new(
            JobOrchestrator::new(
                Arc::new(JobRegistry::new(8, 300)),
                Arc::new(ProgressBroadcaster::new(64)),
                Some(Arc::new(local) as Arc<dyn TranscriptionProvider>),
                Some(Arc::new(cloud) as Arc<dyn TranscriptionProvider>),
                rates(),
                2,
                None,
            )
            .with_retry_base_delay(Duration::from_millis(20)),
        );

        let job_id = orchestrator
            .start(payload(), ProviderMode::Both, "user-1".to_string())
            .unwrap();
        let job = wait_terminal(&orchestrator, &job_id).await;

        assert_eq!(job.status, JobStatus::Error);
        let error = job.error.unwrap();
        assert_eq!(error.provider, Some(ProviderKind::Cloud));
        assert_eq!(error.kind, "transient");

        let partial = error.partial.expect("local result preserved");
        assert_eq!(partial.text, "hello world");
        assert_eq!(partial.confidence, 0.92);
    }

    /// Dual fail-fast: a fatal local failure cancels the slow cloud sibling
    /// and the error identifies local.
    #[tokio::test]
    async fn test_dual_fail_fast_cancels_sibling() {
        let mut local = MockProvider::succeeding(ProviderKind::Local);
        local.behavior = MockBehavior::FailFatal;
        let mut cloud = MockProvider::succeeding(ProviderKind::Cloud);
        // Enough slow segments that cancellation must cut it short
        cloud.segments = vec!["a"; 50];
        cloud.segment_delay = Duration::from_millis(10);
        let orchestrator = build(Some(local), Some(cloud), None);

        let job_id = orchestrator
            .start(payload(), ProviderMode::Both, "user-1".to_string())
            .unwrap();
        let job = wait_terminal(&orchestrator, &job_id).await;

        assert_eq!(job.status, JobStatus::Error);
        let error = job.error.unwrap();
        assert_eq!(error.provider, Some(ProviderKind::Local));
        assert_eq!(error.kind, "fatal");
        // The cancelled sibling produced no partial result
        assert!(error.partial.is_none());
    }

    /// run_sync blocks until the terminal outcome and returns it.
    #[tokio::test]
    async fn test_run_sync() {
        let orchestrator = build(Some(MockProvider::succeeding(ProviderKind::Local)), None, None);
        let result = orchestrator
            .run_sync(payload(), ProviderMode::Local, "user-1".to_string())
            .await
            .unwrap();
        assert_eq!(result.primary().text, "hello world");

        let mut failing = MockProvider::succeeding(ProviderKind::Local);
        failing.behavior = MockBehavior::FailFatal;
        let orchestrator = build(Some(failing), None, None);
        let err = orchestrator
            .run_sync(payload(), ProviderMode::Local, "user-1".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    /// Completion emits exactly one transcript record to the sink.
    #[tokio::test]
    async fn test_sink_receives_record() {
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = build(
            Some(MockProvider::succeeding(ProviderKind::Local)),
            None,
            Some(sink.clone() as Arc<dyn TranscriptSink>),
        );

        let job_id = orchestrator
            .start(payload(), ProviderMode::Local, "user-42".to_string())
            .unwrap();
        wait_terminal(&orchestrator, &job_id).await;

        // The sink task is fire-and-forget; give it a beat to run
        tokio::time::sleep(Duration::from_millis(20)).await;

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id, "user-42");
        assert_eq!(records[0].text, "hello world");
        assert_eq!(records[0].provider, "local");
        assert_eq!(records[0].audio_duration_seconds, Some(120.0));
    }

    /// A late subscriber to a finished job immediately receives the terminal
    /// frame straight from the replay cache.
    #[tokio::test]
    async fn test_late_subscriber_after_completion() {
        let orchestrator = build(Some(MockProvider::succeeding(ProviderKind::Local)), None, None);
        let job_id = orchestrator
            .start(payload(), ProviderMode::Local, "user-1".to_string())
            .unwrap();
        wait_terminal(&orchestrator, &job_id).await;

        let mut late = orchestrator.broadcaster.subscribe(&job_id).unwrap();
        let frame = late.next().await.unwrap();
        assert!(frame.is_terminal());
    }

    #[tokio::test]
    async fn test_availability_reporting() {
        let orchestrator = build(Some(MockProvider::succeeding(ProviderKind::Local)), None, None);
        assert_eq!(orchestrator.availability(), (true, false));

        let mut cloud = MockProvider::succeeding(ProviderKind::Cloud);
        cloud.available = false;
        let orchestrator = build(
            Some(MockProvider::succeeding(ProviderKind::Local)),
            Some(cloud),
            None,
        );
        assert_eq!(orchestrator.availability(), (true, false));
    }
}
