//! # Whisper Gateway - Main Application Entry Point
//!
//! An HTTP speech-to-text gateway: clients upload an audio file and get back the
//! transcript, detected language and timing information.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, config.toml, environment variables)
//! - **audio**: Container decoding, resampling, voice activity detection, temporary files
//! - **transcription**: Whisper inference with candle behind the `SpeechEngine` trait
//! - **pipeline**: Request validation and the bounded-concurrency transcription flow
//! - **handlers**: The `POST /transcribe` endpoint
//! - **health**: Liveness and metrics endpoints
//! - **middleware**: Per-route request metrics
//! - **state**: Shared application state
//! - **error**: HTTP error responses

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod state;
mod transcription;

#[cfg(test)]
mod testing;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use pipeline::TranscriptionPipeline;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio::TemporaryAudioStore;
use transcription::WhisperEngine;

/// Seconds in-flight requests get to finish once shutdown starts.
const SHUTDOWN_GRACE_SECS: u64 = 60;

/// ## Startup order:
/// 1. Load `.env`, set up logging, load and validate configuration
/// 2. Create the temporary audio directory
/// 3. Download (or reuse cached) model files and load `workers` model replicas
/// 4. Serve HTTP until SIGTERM/SIGINT, then stop gracefully
///
/// Any failure before the server binds aborts startup with the error.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting whisper-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.engine.model,
        device = %config.engine.device,
        workers = config.engine.workers,
        language = config.engine.language.as_deref().unwrap_or("auto"),
        beam_size = config.engine.beam_size,
        vad_filter = config.engine.vad_filter,
        auth = config.auth.api_key.is_some(),
        "Configuration loaded"
    );

    let store = TemporaryAudioStore::new(&config.storage.temp_dir);
    store
        .prepare()
        .await
        .with_context(|| format!("cannot create temp dir {}", config.storage.temp_dir.display()))?;

    let engine = WhisperEngine::load(&config.engine).await?;
    let device = engine.device();

    let pipeline = TranscriptionPipeline::new(
        Arc::new(engine),
        store,
        config.auth.policy(),
        config.engine.decode_options(),
        config.engine.workers,
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config, pipeline, device);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Middleware runs bottom-up on the way in
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .wrap(cors)
            .route("/", web::get().to(health::health_check))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/transcribe", web::post().to(handlers::transcribe))
    })
    .disable_signals()
    .shutdown_timeout(SHUTDOWN_GRACE_SECS)
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
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

/// Structured logging to stdout.
///
/// `RUST_LOG` overrides the default filter `whisper_gateway=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve once SIGTERM or SIGINT arrives.
#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to install signal handlers ({}), falling back to Ctrl+C", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
