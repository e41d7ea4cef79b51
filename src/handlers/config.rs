//! # Configuration Endpoints
//!
//! Read and partially update the runtime configuration. The cloud API key is
//! never echoed back — only whether one is configured.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

fn config_body(config: &crate::config::AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "models": {
            "whisper_model": config.models.whisper_model,
            "device": config.models.device,
            "language": config.models.language
        },
        "providers": {
            "cloud_api_url": config.providers.cloud_api_url,
            "cloud_api_key_configured": config.cloud_available(),
            "cloud_model": config.providers.cloud_model,
            "request_timeout_seconds": config.providers.request_timeout_seconds,
            "max_retries": config.providers.max_retries
        },
        "cost": {
            "cloud_rate_per_minute": config.cost.cloud_rate_per_minute,
            "local_rate_per_second": config.cost.local_rate_per_second
        },
        "jobs": {
            "max_live_jobs": config.jobs.max_live_jobs,
            "retention_seconds": config.jobs.retention_seconds,
            "sweep_interval_seconds": config.jobs.sweep_interval_seconds,
            "progress_buffer": config.jobs.progress_buffer
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_body(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_body(&current_config)
    })))
}
