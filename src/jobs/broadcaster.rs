//! # Progress Broadcaster
//!
//! Fans out progress snapshots for a job to any number of subscribers without
//! ever blocking the worker that publishes them.
//!
//! ## Delivery semantics:
//! - one `tokio::sync::broadcast` channel per job: sends never block, and a
//!   subscriber that falls behind the buffer capacity loses its *oldest*
//!   undelivered frames (`Lagged`), preserving per-subscriber ordering
//! - the last published frame is cached so a subscriber attaching late —
//!   including after the job already finished — immediately observes the
//!   current state before the live stream
//! - the terminal frame carries the Result or Error and is always the last
//!   frame a subscriber sees; dropping the channel afterwards closes every
//!   stream
//!
//! Cross-subscriber fairness is explicitly not guaranteed; each receiver
//! drains at its own pace.

use super::job::{JobError, JobResult, Progress};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tokio::sync::broadcast;

/// One frame of the progress stream.
#[derive(Debug, Clone)]
pub enum ProgressFrame {
    /// A replaceable progress snapshot
    Snapshot(Progress),
    /// The final frame: the job's outcome
    Terminal(TerminalFrame),
}

/// Outcome carried by the final frame.
#[derive(Debug, Clone)]
pub enum TerminalFrame {
    Complete(JobResult),
    Failed(JobError),
}

impl ProgressFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressFrame::Terminal(_))
    }
}

/// Per-job fan-out state.
struct JobChannel {
    sender: broadcast::Sender<ProgressFrame>,
    /// Cached most-recent frame, replayed to late subscribers
    last: Mutex<Option<ProgressFrame>>,
}

pub struct ProgressBroadcaster {
    channels: RwLock<HashMap<String, JobChannel>>,
    /// Per-subscriber buffer capacity before oldest-frame drops kick in
    capacity: usize,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Create the channel for a job. Called once at job creation.
    pub fn register(&self, job_id: &str) {
        let mut channels = self.channels.write().unwrap();
        channels.entry(job_id.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.capacity);
            JobChannel {
                sender,
                last: Mutex::new(None),
            }
        });
    }

    /// Publish a frame. Never blocks; frames to jobs without subscribers just
    /// update the cached replay frame.
    pub fn publish(&self, job_id: &str, frame: ProgressFrame) {
        let channels = self.channels.read().unwrap();
        let Some(channel) = channels.get(job_id) else {
            tracing::warn!("Progress published for unknown job {}", job_id);
            return;
        };

        // Holding the cache lock across the send keeps replay + live delivery
        // consistent with subscribe()
        let mut last = channel.last.lock().unwrap();
        *last = Some(frame.clone());
        let _ = channel.sender.send(frame);
    }

    /// Attach a subscriber to a job's stream, or None if the job is unknown
    /// (never created, or already evicted).
    pub fn subscribe(&self, job_id: &str) -> Option<Subscription> {
        let channels = self.channels.read().unwrap();
        let channel = channels.get(job_id)?;

        // Lock order mirrors publish(): subscribing and snapshotting the
        // cached frame under the same lock means no frame can fall between
        // the replay and the live stream
        let last = channel.last.lock().unwrap();
        let receiver = channel.sender.subscribe();
        Some(Subscription {
            replay: last.clone(),
            receiver,
        })
    }

    /// Tear down a job's channel (registry eviction). Subscribers drain any
    /// buffered frames, then their streams close.
    pub fn remove(&self, job_id: &str) {
        let mut channels = self.channels.write().unwrap();
        channels.remove(job_id);
    }

    /// Number of registered channels, for the metrics surface.
    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap().len()
    }
}

/// One subscriber's view of a job's progress stream.
pub struct Subscription {
    replay: Option<ProgressFrame>,
    receiver: broadcast::Receiver<ProgressFrame>,
}

impl Subscription {
    /// Next frame, or None when the stream is closed.
    ///
    /// Lag is absorbed here: a slow consumer silently loses the oldest
    /// undelivered frames and continues with what remains, so observed
    /// `segment_index` values stay non-decreasing.
    pub async fn next(&mut self) -> Option<ProgressFrame> {
        if let Some(frame) = self.replay.take() {
            return Some(frame);
        }

        loop {
            match self.receiver.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Progress subscriber lagged, skipped {} frames", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::Progress;

    fn snapshot(segment_index: u32) -> ProgressFrame {
        ProgressFrame::Snapshot(Progress {
            segment_index,
            segment_total: 10,
            ..Default::default()
        })
    }

    fn terminal() -> ProgressFrame {
        ProgressFrame::Terminal(TerminalFrame::Failed(JobError {
            provider: None,
            kind: "fatal".to_string(),
            message: "boom".to_string(),
            partial: None,
        }))
    }

    fn frame_index(frame: &ProgressFrame) -> Option<u32> {
        match frame {
            ProgressFrame::Snapshot(p) => Some(p.segment_index),
            ProgressFrame::Terminal(_) => None,
        }
    }

    #[tokio::test]
    async fn test_subscriber_sees_frames_in_order() {
        let b = ProgressBroadcaster::new(16);
        b.register("job-1");

        let mut sub = b.subscribe("job-1").unwrap();
        for i in 1..=3 {
            b.publish("job-1", snapshot(i));
        }
        b.publish("job-1", terminal());

        let mut indexes = Vec::new();
        while let Some(frame) = sub.next().await {
            let is_terminal = frame.is_terminal();
            if let Some(i) = frame_index(&frame) {
                indexes.push(i);
            }
            if is_terminal {
                break;
            }
        }
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    /// A subscriber attaching after terminal state immediately receives the
    /// terminal frame.
    #[tokio::test]
    async fn test_late_subscriber_gets_terminal_replay() {
        let b = ProgressBroadcaster::new(16);
        b.register("job-1");
        b.publish("job-1", snapshot(4));
        b.publish("job-1", terminal());

        let mut sub = b.subscribe("job-1").unwrap();
        let frame = sub.next().await.unwrap();
        assert!(frame.is_terminal());
    }

    /// A lagged subscriber loses oldest frames but ordering stays
    /// non-decreasing and the terminal frame still arrives last.
    #[tokio::test]
    async fn test_lagged_subscriber_stays_monotonic() {
        let b = ProgressBroadcaster::new(4);
        b.register("job-1");

        let mut sub = b.subscribe("job-1").unwrap();
        // Flood well past the buffer capacity before the subscriber reads
        for i in 1..=20 {
            b.publish("job-1", snapshot(i));
        }
        b.publish("job-1", terminal());

        let mut last_seen = 0;
        let mut saw_terminal = false;
        while let Some(frame) = sub.next().await {
            if frame.is_terminal() {
                saw_terminal = true;
                break;
            }
            let i = frame_index(&frame).unwrap();
            assert!(i >= last_seen, "segment_index regressed: {} after {}", i, last_seen);
            last_seen = i;
        }
        assert!(saw_terminal);
        // Early frames were dropped, not replayed out of order
        assert!(last_seen > 0);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let b = ProgressBroadcaster::new(16);
        assert!(b.subscribe("ghost").is_none());
        // Publishing to an unknown job must not panic
        b.publish("ghost", snapshot(1));
    }

    #[tokio::test]
    async fn test_remove_closes_stream() {
        let b = ProgressBroadcaster::new(16);
        b.register("job-1");
        let mut sub = b.subscribe("job-1").unwrap();
        b.publish("job-1", snapshot(1));
        b.remove("job-1");

        // Buffered frame drains, then the stream closes
        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
        assert!(b.subscribe("job-1").is_none());
    }
}
