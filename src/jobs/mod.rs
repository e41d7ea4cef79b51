//! # Job Engine
//!
//! The asynchronous transcription job engine: lifecycle, progress fan-out,
//! multi-provider execution and the cost comparison computed from results.
//!
//! ## Key Components:
//! - **Job**: one transcription request and its state machine
//! - **Job Registry**: in-memory table of live and recently finished jobs
//! - **Progress Broadcaster**: non-blocking fan-out of progress snapshots
//! - **Job Orchestrator**: creates jobs, spawns workers, merges dual runs
//!
//! ## Ownership model:
//! One worker task per job owns all mutation of that job. Everyone else —
//! status pollers, streaming subscribers, the sweeper — sees snapshot clones
//! or broadcast frames, never live references.

pub mod broadcaster;
pub mod job;
pub mod orchestrator;
pub mod registry;

pub use broadcaster::{ProgressBroadcaster, ProgressFrame, Subscription, TerminalFrame};
pub use job::{Job, JobError, JobResult, JobStatus, Progress, ProviderResult};
pub use orchestrator::JobOrchestrator;
pub use registry::JobRegistry;
