//! # Job Registry
//!
//! In-memory table of live and recently finished jobs, keyed by job id.
//! Owns job lifecycle bookkeeping and garbage collection.
//!
//! ## Concurrency contract:
//! - registration and eviction synchronize on the map's lock
//! - each job's fields are written only by its own worker through the
//!   `Arc<RwLock<Job>>` handle; every other reader gets a cloned snapshot
//!   from [`JobRegistry::get`], never a live reference, so streaming readers
//!   can't observe torn state
//!
//! ## Resource Management:
//! - enforces a maximum number of concurrently live (non-terminal) jobs
//! - a periodic sweep evicts jobs whose terminal timestamp is older than the
//!   retention window, bounding memory growth from abandoned jobs
//!
//! The registry is an explicit injected object, not a process-wide singleton,
//! so tests can run several instances side by side.

use super::job::Job;
use crate::providers::ProviderMode;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Shared handle to one job's mutable state. Only the job's worker writes
/// through this; the registry hands it out crate-internally.
pub type JobHandle = Arc<RwLock<Job>>;

pub struct JobRegistry {
    /// Registered jobs mapped by job id
    jobs: RwLock<HashMap<String, JobHandle>>,

    /// Maximum number of non-terminal jobs allowed at once
    max_live_jobs: usize,

    /// How long finished jobs stay queryable before eviction
    retention_seconds: u64,
}

impl JobRegistry {
    pub fn new(max_live_jobs: usize, retention_seconds: u64) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_live_jobs,
            retention_seconds,
        }
    }

    /// Allocate an id and register a new job in `queued` state.
    ///
    /// ## Errors:
    /// Fails when the live-job limit is reached (finished jobs awaiting
    /// eviction don't count against the limit).
    pub fn create(
        &self,
        provider_mode: ProviderMode,
        file_name: String,
        file_size_bytes: u64,
    ) -> Result<String, String> {
        let mut jobs = self.jobs.write().unwrap();

        let live = jobs
            .values()
            .filter(|handle| !handle.read().unwrap().is_terminal())
            .count();
        if live >= self.max_live_jobs {
            return Err(format!(
                "Maximum concurrent jobs ({}) reached",
                self.max_live_jobs
            ));
        }

        let id = Uuid::new_v4().to_string();
        let job = Job::new(id.clone(), provider_mode, file_name, file_size_bytes);
        jobs.insert(id.clone(), Arc::new(RwLock::new(job)));

        Ok(id)
    }

    /// Get a consistent snapshot of a job. The clone is deliberate: callers
    /// never receive a live reference.
    pub fn get(&self, id: &str) -> Option<Job> {
        let jobs = self.jobs.read().unwrap();
        jobs.get(id).map(|handle| handle.read().unwrap().clone())
    }

    /// The mutable handle for a job's worker. Crate-internal by design.
    pub(crate) fn handle(&self, id: &str) -> Option<JobHandle> {
        let jobs = self.jobs.read().unwrap();
        jobs.get(id).cloned()
    }

    /// Remove terminal jobs whose finish time is older than the retention
    /// window. Returns the evicted ids so the caller can tear down their
    /// progress channels.
    pub fn evict_expired(&self) -> Vec<String> {
        let cutoff = Utc::now() - Duration::seconds(self.retention_seconds as i64);
        let mut jobs = self.jobs.write().unwrap();

        let expired: Vec<String> = jobs
            .iter()
            .filter(|(_, handle)| {
                let job = handle.read().unwrap();
                job.is_terminal() && job.finished_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            jobs.remove(id);
            tracing::debug!("Evicted expired job {}", id);
        }

        expired
    }

    /// Counts for the health/metrics surface: (total registered, live).
    pub fn counts(&self) -> (usize, usize) {
        let jobs = self.jobs.read().unwrap();
        let live = jobs
            .values()
            .filter(|handle| !handle.read().unwrap().is_terminal())
            .count();
        (jobs.len(), live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{JobError, JobStatus, Progress};

    fn registry() -> JobRegistry {
        JobRegistry::new(4, 300)
    }

    fn fail_job(registry: &JobRegistry, id: &str) {
        let handle = registry.handle(id).unwrap();
        let mut job = handle.write().unwrap();
        job.advance(JobStatus::Uploading).unwrap();
        job.advance(JobStatus::Transcribing).unwrap();
        job.fail(JobError {
            provider: None,
            kind: "fatal".to_string(),
            message: "test failure".to_string(),
            partial: None,
        })
        .unwrap();
    }

    #[test]
    fn test_create_and_get() {
        let r = registry();
        let id = r
            .create(ProviderMode::Local, "clip.wav".to_string(), 1024)
            .unwrap();

        let job = r.get(&id).unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.file_size_bytes, 1024);
        assert!(r.get("missing").is_none());
    }

    /// get returns a deep snapshot: later mutation doesn't alter it.
    #[test]
    fn test_snapshot_isolation() {
        let r = registry();
        let id = r
            .create(ProviderMode::Local, "clip.wav".to_string(), 1024)
            .unwrap();

        let before = r.get(&id).unwrap();

        let handle = r.handle(&id).unwrap();
        handle.write().unwrap().update_progress(Progress {
            segment_index: 3,
            segment_total: 4,
            ..Default::default()
        });

        // The earlier snapshot is untouched; a fresh one sees the update
        assert_eq!(before.progress.segment_index, 0);
        assert_eq!(r.get(&id).unwrap().progress.segment_index, 3);
    }

    /// Repeated reads after terminal state are byte-identical.
    #[test]
    fn test_terminal_snapshot_idempotent() {
        let r = registry();
        let id = r
            .create(ProviderMode::Local, "clip.wav".to_string(), 1024)
            .unwrap();
        fail_job(&r, &id);

        let first = serde_json::to_string(&r.get(&id).unwrap()).unwrap();
        let second = serde_json::to_string(&r.get(&id).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    /// Live-job limit blocks new work but finished jobs don't count.
    #[test]
    fn test_live_job_limit() {
        let r = JobRegistry::new(2, 300);
        let a = r.create(ProviderMode::Local, "a.wav".to_string(), 1).unwrap();
        let _b = r.create(ProviderMode::Local, "b.wav".to_string(), 1).unwrap();

        assert!(r.create(ProviderMode::Local, "c.wav".to_string(), 1).is_err());

        // Finishing one frees a slot even before eviction
        fail_job(&r, &a);
        assert!(r.create(ProviderMode::Local, "c.wav".to_string(), 1).is_ok());
    }

    /// Only terminal jobs older than the retention window are evicted.
    #[test]
    fn test_eviction() {
        let r = JobRegistry::new(8, 300);
        let fresh = r.create(ProviderMode::Local, "fresh.wav".to_string(), 1).unwrap();
        let live = r.create(ProviderMode::Local, "live.wav".to_string(), 1).unwrap();
        let old = r.create(ProviderMode::Local, "old.wav".to_string(), 1).unwrap();

        fail_job(&r, &fresh);
        fail_job(&r, &old);

        // Backdate one finish time past the retention window
        {
            let handle = r.handle(&old).unwrap();
            handle.write().unwrap().finished_at =
                Some(Utc::now() - Duration::seconds(301));
        }

        let evicted = r.evict_expired();
        assert_eq!(evicted, vec![old.clone()]);
        assert!(r.get(&old).is_none());
        // Recently finished and live jobs survive
        assert!(r.get(&fresh).is_some());
        assert!(r.get(&live).is_some());
    }

    #[test]
    fn test_counts() {
        let r = registry();
        let a = r.create(ProviderMode::Local, "a.wav".to_string(), 1).unwrap();
        let _b = r.create(ProviderMode::Both, "b.wav".to_string(), 1).unwrap();
        fail_job(&r, &a);

        assert_eq!(r.counts(), (2, 1));
    }
}
