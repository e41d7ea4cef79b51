//! # Application State Management
//!
//! This module manages shared state that needs to be accessed by multiple HTTP request handlers
//! simultaneously.
//!
//! ## Key Rust Concepts (IMPORTANT for beginners):
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Multiple HTTP requests run simultaneously and all need access to the same state
//! - **Memory safety**: Automatically cleans up data when the last reference is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time (but not both)
//! - **Why needed**: Many requests read config/metrics simultaneously, few update them
//!
//! ### Arc<RwLock<T>> Pattern
//! Thread-safe shared mutable state: the configuration and request metrics use
//! it directly. The job engine pieces (registry, broadcaster, orchestrator)
//! handle their own internal synchronization, so they only need the Arc.

use crate::config::AppConfig;
use crate::jobs::{JobOrchestrator, JobRegistry, ProgressBroadcaster};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
///
/// ## Thread Safety Pattern:
/// - `config` and `metrics` are Arc<RwLock<T>>: many readers or one writer
/// - `start_time` never changes, so it's shared directly (Instant is Copy)
/// - the engine handles are Arc'd objects that synchronize internally
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics (constantly being updated by middleware)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Job table: live and recently finished transcription jobs
    pub registry: Arc<JobRegistry>,

    /// Progress fan-out for streaming subscribers
    pub broadcaster: Arc<ProgressBroadcaster>,

    /// Job creation and worker coordination
    pub orchestrator: Arc<JobOrchestrator>,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Transcription jobs admitted since server start
    pub jobs_started: u64,

    /// Detailed metrics per endpoint template (job ids normalized away)
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Assemble the shared state from the already-built engine pieces.
    pub fn new(
        config: AppConfig,
        registry: Arc<JobRegistry>,
        broadcaster: Arc<ProgressBroadcaster>,
        orchestrator: Arc<JobOrchestrator>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            registry,
            broadcaster,
            orchestrator,
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    /// AppConfig is designed to be cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Update the configuration after validating it.
    ///
    /// Engine-level settings (provider wiring, cost rates) are captured by
    /// the orchestrator at startup; updates here affect what the API reports
    /// and take full effect on the next restart.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Count an admitted transcription job.
    pub fn increment_jobs_started(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.jobs_started += 1;
    }

    /// Record detailed metrics for a specific endpoint template.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// ## Why a snapshot:
    /// Clones the data so the lock isn't held while the HTTP response is
    /// serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            jobs_started: metrics.jobs_started,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CostConfig;

    fn state() -> AppState {
        let config = AppConfig::default();
        let registry = Arc::new(JobRegistry::new(4, 300));
        let broadcaster = Arc::new(ProgressBroadcaster::new(16));
        let orchestrator = Arc::new(JobOrchestrator::new(
            registry.clone(),
            broadcaster.clone(),
            None,
            None,
            CostConfig {
                cloud_rate_per_minute: 0.006,
                local_rate_per_second: 0.0001,
            },
            2,
            None,
        ));
        AppState::new(config, registry, broadcaster, orchestrator)
    }

    #[test]
    fn test_metrics_counters() {
        let s = state();
        s.increment_request_count();
        s.increment_request_count();
        s.increment_error_count();
        s.increment_jobs_started();

        let snapshot = s.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.jobs_started, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let s = state();
        s.record_endpoint_request("POST /api/v1/jobs", 40, false);
        s.record_endpoint_request("POST /api/v1/jobs", 60, true);

        let snapshot = s.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["POST /api/v1/jobs"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 50.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_config_update_validation() {
        let s = state();
        let mut bad = s.get_config();
        bad.server.port = 0;
        assert!(s.update_config(bad).is_err());

        let mut good = s.get_config();
        good.server.port = 9090;
        assert!(s.update_config(good).is_ok());
        assert_eq!(s.get_config().server.port, 9090);
    }
}
