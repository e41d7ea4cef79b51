//! # TranscribeGlobal Backend - Main Application Entry Point
//!
//! This is the main entry point for the transcription backend web server.
//! It sets up an Actix-web HTTP server around the asynchronous transcription
//! job engine.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous for better performance
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & RwLock**: Thread-safe shared state management
//! - **static**: Global variables that live for the entire program duration
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (TOML files + environment variables)
//! - **state**: Shared application state and request metrics
//! - **jobs**: The job engine — registry, broadcaster, orchestrator
//! - **providers**: Local (Candle Whisper) and cloud transcription adapters
//! - **cost**: Deterministic cost/savings comparison
//! - **handlers / websocket**: The HTTP and streaming surface
//! - **sink**: Fire-and-forget persistence of finished transcripts

// Module declarations - These tell Rust about our other source files
mod audio;       // Audio payload decoding (audio.rs)
mod config;      // Configuration management (config.rs)
mod cost;        // Cost model (cost.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod jobs;        // Job engine (jobs/ directory)
mod middleware;  // Custom middleware (middleware/ directory)
mod providers;   // Transcription providers (providers/ directory)
mod sink;        // Finished-transcript persistence boundary (sink.rs)
mod state;       // Application state management (state.rs)
mod websocket;   // Progress streaming (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use jobs::{JobOrchestrator, JobRegistry, ProgressBroadcaster};
use providers::{CloudProvider, LocalProvider, TranscriptionProvider};
use sink::{HttpSink, TranscriptSink};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal that can be accessed from anywhere in the program.
/// AtomicBool is thread-safe, meaning multiple threads can safely read/write to it.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the job engine** (registry, broadcaster, providers, orchestrator)
/// 4. **Spawns the eviction sweeper** that garbage-collects finished jobs
/// 5. **Configures the HTTP server** with middleware and routes
/// 6. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    // Load application configuration from config.toml and environment variables
    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting transcribe-global-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    // Build the job engine pieces. Each is an explicit object with injected
    // lifetime rather than a process-wide singleton.
    let registry = Arc::new(JobRegistry::new(
        config.jobs.max_live_jobs,
        config.jobs.retention_seconds,
    ));
    let broadcaster = Arc::new(ProgressBroadcaster::new(config.jobs.progress_buffer));

    let local: Option<Arc<dyn TranscriptionProvider>> = match LocalProvider::new(&config.models) {
        Ok(provider) => Some(Arc::new(provider)),
        Err(e) => {
            error!("Local provider disabled: {}", e);
            None
        }
    };

    let cloud: Option<Arc<dyn TranscriptionProvider>> =
        match CloudProvider::new(&config.providers, config.models.language.clone()) {
            Ok(provider) => Some(Arc::new(provider)),
            Err(e) => {
                error!("Cloud provider disabled: {}", e);
                None
            }
        };

    let transcript_sink: Option<Arc<dyn TranscriptSink>> = match &config.sink.endpoint {
        Some(endpoint) => match HttpSink::new(endpoint.clone()) {
            Ok(sink) => {
                info!("Transcript sink configured: {}", endpoint);
                Some(Arc::new(sink))
            }
            Err(e) => {
                warn!("Transcript sink disabled: {}", e);
                None
            }
        },
        None => {
            info!("No transcript sink configured; finished transcripts are not persisted");
            None
        }
    };

    let orchestrator = Arc::new(JobOrchestrator::new(
        registry.clone(),
        broadcaster.clone(),
        local,
        cloud,
        config.cost.clone(),
        config.providers.max_retries,
        transcript_sink,
    ));

    let (local_available, cloud_available) = orchestrator.availability();
    info!(
        "Providers initialized: local={}, cloud={}",
        local_available, cloud_available
    );

    // Background sweep: evict finished jobs past the retention window and
    // tear down their progress channels
    spawn_eviction_sweeper(
        registry.clone(),
        broadcaster.clone(),
        config.jobs.sweep_interval_seconds,
    );

    let app_state = AppState::new(config.clone(), registry, broadcaster, orchestrator);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Set up signal handlers for graceful shutdown (Ctrl+C, SIGTERM, etc.)
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // Configure CORS so the web frontend can call us from another origin
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            // Share our application state with all request handlers
            .app_data(web::Data::new(app_state.clone()))
            // Add middleware in order (they execute in reverse order for responses)
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            // Define API routes under /api/v1 prefix
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/jobs", web::post().to(handlers::start_job))
                    .route("/jobs/{job_id}", web::get().to(handlers::job_status))
                    .route("/transcribe", web::post().to(handlers::transcribe_sync))
                    .route("/providers/status", web::get().to(handlers::provider_status)),
            )
            // Streaming progress subscription
            .route("/ws/jobs/{job_id}/progress", web::get().to(websocket::job_progress_ws))
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    // Get a handle to control the server and spawn it in a separate task
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "transcribe_global_backend=debug")
/// - If not set, defaults to "transcribe_global_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcribe_global_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodically evict finished jobs older than the retention window.
///
/// Eviction and channel teardown happen together so a subscriber can never
/// find a channel for a job the registry no longer knows.
fn spawn_eviction_sweeper(
    registry: Arc<JobRegistry>,
    broadcaster: Arc<ProgressBroadcaster>,
    interval_seconds: u64,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
        loop {
            ticker.tick().await;
            let evicted = registry.evict_expired();
            if !evicted.is_empty() {
                info!("Evicted {} expired jobs", evicted.len());
            }
            for job_id in evicted {
                broadcaster.remove(&job_id);
            }
        }
    });
}

/// Set up signal handlers for graceful shutdown.
///
/// ## Why this matters:
/// Graceful shutdown means the server can finish processing current requests
/// before shutting down, rather than just stopping immediately.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
///
/// Polls the atomic flag every 100ms; simple and good enough for a shutdown
/// path that runs once per process lifetime.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
