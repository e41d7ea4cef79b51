//! # Job Endpoints
//!
//! The inbound boundary of the job engine:
//! - `POST /api/v1/jobs` — upload audio, start an async job, get a job id
//! - `GET /api/v1/jobs/{id}` — poll a job snapshot
//! - `POST /api/v1/transcribe` — blocking "do it now" variant
//! - `GET /api/v1/providers/status` — provider availability for mode pickers
//!
//! Uploads arrive as multipart forms with a `file` field and an optional
//! `provider_mode` field (`local` | `cloud` | `both`, defaulting to `local`).
//! The caller identity is taken from the `X-User-Id` header — authentication
//! itself lives outside this service.

use crate::audio::AudioPayload;
use crate::error::AppError;
use crate::providers::ProviderMode;
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use serde_json::json;

/// Upload fields extracted from the multipart form.
struct UploadForm {
    audio: AudioPayload,
    mode: ProviderMode,
}

/// Caller identity from the auth layer in front of us.
fn caller_identity(req: &HttpRequest) -> String {
    req.headers()
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

/// Uploads larger than this are rejected before a job is created.
const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

/// Collect the multipart upload into memory.
async fn read_upload(mut payload: Multipart) -> Result<UploadForm, AppError> {
    let mut audio_bytes: Option<Vec<u8>> = None;
    let mut file_name = "upload.wav".to_string();
    let mut mode = ProviderMode::Local;

    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?;

        let content_disposition = field.content_disposition().ok_or_else(|| {
            AppError::ValidationError("Missing content disposition".to_string())
        })?;
        let field_name = content_disposition
            .get_name()
            .unwrap_or("")
            .to_string();

        match field_name.as_str() {
            "file" => {
                if let Some(name) = content_disposition.get_filename() {
                    file_name = name.to_string();
                }
                let mut bytes = Vec::new();
                while let Some(chunk) = field.next().await {
                    let chunk = chunk
                        .map_err(|e| AppError::BadRequest(format!("Upload read failed: {}", e)))?;
                    bytes.extend_from_slice(&chunk);
                    if bytes.len() > MAX_FILE_SIZE {
                        return Err(AppError::ValidationError(format!(
                            "File too large (max: {} bytes)",
                            MAX_FILE_SIZE
                        )));
                    }
                }
                audio_bytes = Some(bytes);
            }
            "provider_mode" => {
                let mut bytes = Vec::new();
                while let Some(chunk) = field.next().await {
                    let chunk = chunk
                        .map_err(|e| AppError::BadRequest(format!("Upload read failed: {}", e)))?;
                    bytes.extend_from_slice(&chunk);
                }
                let value = String::from_utf8_lossy(&bytes);
                mode = value
                    .trim()
                    .parse()
                    .map_err(AppError::ValidationError)?;
            }
            other => {
                tracing::debug!("Ignoring unexpected multipart field '{}'", other);
            }
        }
    }

    let audio_bytes =
        audio_bytes.ok_or_else(|| AppError::ValidationError("No audio supplied".to_string()))?;

    Ok(UploadForm {
        audio: AudioPayload::new(audio_bytes, file_name),
        mode,
    })
}

/// `POST /api/v1/jobs` — start an asynchronous transcription job.
///
/// Returns 202 with the job id immediately; progress is available via the
/// status endpoint or the WebSocket stream.
pub async fn start_job(
    req: HttpRequest,
    payload: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let form = read_upload(payload).await?;
    let user_id = caller_identity(&req);

    let job_id = state.orchestrator.start(form.audio, form.mode, user_id)?;
    state.increment_jobs_started();

    Ok(HttpResponse::Accepted().json(json!({
        "job_id": job_id,
        "status": "queued",
        "provider_mode": form.mode.as_str()
    })))
}

/// `GET /api/v1/jobs/{id}` — consistent snapshot of one job.
pub async fn job_status(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let job_id = path.into_inner();
    let job = state
        .registry
        .get(&job_id)
        .ok_or_else(|| AppError::NotFound(format!("Job '{}' not found", job_id)))?;

    Ok(HttpResponse::Ok().json(job))
}

/// `POST /api/v1/transcribe` — blocking variant: responds only once the job
/// reaches a terminal state.
pub async fn transcribe_sync(
    req: HttpRequest,
    payload: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let form = read_upload(payload).await?;
    let user_id = caller_identity(&req);

    let job_id = state.orchestrator.start(form.audio, form.mode, user_id)?;
    state.increment_jobs_started();
    let result = state.orchestrator.wait_result(&job_id).await?;

    Ok(HttpResponse::Ok().json(result))
}

/// `GET /api/v1/providers/status` — which modes callers can offer.
pub async fn provider_status(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let (local_available, cloud_available) = state.orchestrator.availability();

    Ok(HttpResponse::Ok().json(json!({
        "local_available": local_available,
        "cloud_available": cloud_available
    })))
}
