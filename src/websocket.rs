//! # WebSocket Progress Streaming
//!
//! Clients subscribe to `/ws/jobs/{job_id}/progress` and receive the job's
//! progress snapshots as JSON text frames, terminated by one final frame that
//! carries the Result or Error, after which the server closes the socket.
//!
//! ## Protocol (server → client):
//! - `{"type": "progress", "job_id", "segment_index", "segment_total", ...}`
//! - `{"type": "complete", "job_id", "result": {...}}`
//! - `{"type": "error", "job_id", "error": {...}}`
//! - `{"type": "ping", "timestamp"}` heartbeats; clients answer with pongs
//!
//! ## Semantics:
//! - any number of subscribers may attach to the same job
//! - a subscriber attaching after the job finished immediately receives the
//!   terminal frame (the broadcaster replays it)
//! - closing the socket only detaches this subscriber — it never cancels the
//!   underlying job, which other subscribers or pollers may still need

use crate::jobs::{JobError, JobResult, Progress, ProgressFrame, Subscription, TerminalFrame};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often the server pings an idle connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long without any client traffic before the connection is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Server → client messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamMessage {
    Progress {
        job_id: String,
        #[serde(flatten)]
        progress: Progress,
    },
    Complete {
        job_id: String,
        result: JobResult,
    },
    Error {
        job_id: String,
        error: JobError,
    },
    Ping {
        timestamp: u64,
    },
}

/// WebSocket actor forwarding one subscription to one client.
pub struct ProgressWebSocket {
    job_id: String,

    /// Taken by `started()` and moved into the forwarding task
    subscription: Option<Subscription>,

    /// Last time the client showed signs of life
    last_heartbeat: Instant,
}

impl ProgressWebSocket {
    pub fn new(job_id: String, subscription: Subscription) -> Self {
        Self {
            job_id,
            subscription: Some(subscription),
            last_heartbeat: Instant::now(),
        }
    }

    fn send_json(&self, ctx: &mut ws::WebsocketContext<Self>, message: &StreamMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => warn!("Failed to serialize stream message: {}", e),
        }
    }
}

/// Internal message: one frame pulled from the broadcaster.
#[derive(Message)]
#[rtype(result = "()")]
struct ForwardFrame(ProgressFrame);

/// Internal message: the subscription ended without a terminal frame
/// (job evicted mid-stream).
#[derive(Message)]
#[rtype(result = "()")]
struct StreamClosed;

impl Actor for ProgressWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Progress stream opened for job {}", self.job_id);

        // Heartbeat timer: ping the client, drop it when it goes silent
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Progress stream heartbeat timeout for job {}", act.job_id);
                ctx.stop();
                return;
            }
            let ping = StreamMessage::Ping {
                timestamp: chrono::Utc::now().timestamp_millis() as u64,
            };
            act.send_json(ctx, &ping);
        });

        // Pump frames from the broadcaster into this actor. The task ends at
        // the terminal frame or when the channel closes.
        let Some(mut subscription) = self.subscription.take() else {
            ctx.stop();
            return;
        };
        let addr = ctx.address();

        tokio::spawn(async move {
            while let Some(frame) = subscription.next().await {
                let is_terminal = frame.is_terminal();
                if addr.try_send(ForwardFrame(frame)).is_err() {
                    // Client went away; nothing left to forward to
                    return;
                }
                if is_terminal {
                    return;
                }
            }
            let _ = addr.try_send(StreamClosed);
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Detaching a subscriber never cancels the job itself
        debug!("Progress stream closed for job {}", self.job_id);
    }
}

impl Handler<ForwardFrame> for ProgressWebSocket {
    type Result = ();

    fn handle(&mut self, msg: ForwardFrame, ctx: &mut Self::Context) {
        match msg.0 {
            ProgressFrame::Snapshot(progress) => {
                let message = StreamMessage::Progress {
                    job_id: self.job_id.clone(),
                    progress,
                };
                self.send_json(ctx, &message);
            }
            ProgressFrame::Terminal(TerminalFrame::Complete(result)) => {
                let message = StreamMessage::Complete {
                    job_id: self.job_id.clone(),
                    result,
                };
                self.send_json(ctx, &message);
                ctx.close(Some(ws::CloseReason::from(ws::CloseCode::Normal)));
                ctx.stop();
            }
            ProgressFrame::Terminal(TerminalFrame::Failed(error)) => {
                let message = StreamMessage::Error {
                    job_id: self.job_id.clone(),
                    error,
                };
                self.send_json(ctx, &message);
                ctx.close(Some(ws::CloseReason::from(ws::CloseCode::Normal)));
                ctx.stop();
            }
        }
    }
}

impl Handler<StreamClosed> for ProgressWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: StreamClosed, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseReason::from(ws::CloseCode::Away)));
        ctx.stop();
    }
}

/// Client → server traffic: only connection housekeeping.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ProgressWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(_)) => {
                // The stream is one-way; any client text just proves liveness
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!("Client closed progress stream: {:?}", reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Progress stream protocol error: {}", e);
                ctx.stop();
            }
        }
    }
}

/// HTTP → WebSocket upgrade handler.
///
/// Subscribing to an unknown (never created or already evicted) job is a 404
/// before the upgrade happens.
pub async fn job_progress_ws(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let job_id = path.into_inner();

    let Some(subscription) = state.broadcaster.subscribe(&job_id) else {
        return Err(crate::error::AppError::NotFound(format!("Job '{}' not found", job_id)).into());
    };

    ws::start(ProgressWebSocket::new(job_id, subscription), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_message_wire_format() {
        let progress = StreamMessage::Progress {
            job_id: "job-1".to_string(),
            progress: Progress {
                segment_index: 2,
                segment_total: 4,
                elapsed_seconds: 3.5,
                estimated_remaining_seconds: 3.5,
                partial_text: "hello".to_string(),
            },
        };

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&progress).unwrap()).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["job_id"], "job-1");
        // Progress fields are flattened into the frame
        assert_eq!(json["segment_index"], 2);
        assert_eq!(json["segment_total"], 4);
        assert_eq!(json["partial_text"], "hello");
    }

    #[test]
    fn test_error_message_wire_format() {
        let error = StreamMessage::Error {
            job_id: "job-1".to_string(),
            error: JobError {
                provider: Some(crate::providers::ProviderKind::Cloud),
                kind: "transient".to_string(),
                message: "network error".to_string(),
                partial: None,
            },
        };

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&error).unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["kind"], "transient");
        assert_eq!(json["error"]["provider"], "cloud");
        // Absent partial results are omitted, not null
        assert!(json["error"].get("partial").is_none());
    }
}
