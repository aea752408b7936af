//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Every actix worker thread holds a clone of `AppState`; cloning only bumps reference counts
//! - The configuration and the pipeline are read-only after startup, so a plain `Arc` is enough
//!
//! ### Arc<RwLock<T>> for metrics
//! - Metrics are the only state that changes while the server runs
//! - Every request takes the write lock briefly to update counters
//! - A poisoned lock still holds valid counters, so it is recovered instead of panicking

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde::Serialize;

use crate::config::AppConfig;
use crate::pipeline::{PipelineError, TranscriptionPipeline, TranscriptionResult};

/// State shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Validated configuration, fixed for the life of the process
    pub config: Arc<AppConfig>,

    /// Validation, storage and inference for `/transcribe`
    pub pipeline: Arc<TranscriptionPipeline>,

    /// Compute device the engine actually runs on ("cpu", "cuda", "metal")
    pub device: &'static str,

    /// Request and transcription counters, updated by every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Requests that ended with a 4xx or 5xx status
    pub error_count: u64,

    /// Per-route statistics, keyed by e.g. "POST /transcribe"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    /// Outcomes of transcription attempts that reached the pipeline
    pub transcriptions: TranscriptionMetric,
}

/// Performance metrics for one route.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    /// Total time spent serving this route (milliseconds)
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Transcription outcomes, independent of the HTTP layer.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TranscriptionMetric {
    pub succeeded: u64,
    /// Requests refused by validation (auth, format, empty payload)
    pub rejected: u64,
    /// Persist or engine failures, timeouts included
    pub failed: u64,
    /// Successful results that carried the no-speech sentinel
    pub no_speech: u64,
    /// Engine time summed over successful transcriptions (milliseconds)
    pub total_processing_ms: u64,
    /// Audio seconds transcribed
    pub total_audio_seconds: f64,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: TranscriptionPipeline, device: &'static str) -> Self {
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            device,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    /// Increment the total error counter (called when a response has an error status).
    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record one request to `endpoint` (e.g. "GET /health").
    ///
    /// The first time an endpoint is seen a zeroed entry is created for it.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_transcription(&self, result: &TranscriptionResult) {
        let mut metrics = self.metrics_mut();
        let transcriptions = &mut metrics.transcriptions;
        transcriptions.succeeded += 1;
        if result.no_speech {
            transcriptions.no_speech += 1;
        }
        transcriptions.total_processing_ms += result.processing_time.as_millis() as u64;
        transcriptions.total_audio_seconds += result.duration;
    }

    pub fn record_transcription_failure(&self, error: &PipelineError) {
        let mut metrics = self.metrics_mut();
        match error {
            PipelineError::AuthenticationFailed
            | PipelineError::UnsupportedFormat(_)
            | PipelineError::EmptyPayload => metrics.transcriptions.rejected += 1,
            PipelineError::PersistFailure(_) | PipelineError::EngineFailure(_) => {
                metrics.transcriptions.failed += 1
            }
        }
    }

    /// A transcription that outlived the request timeout.
    pub fn record_transcription_timeout(&self) {
        self.metrics_mut().transcriptions.failed += 1;
    }

    /// Copy of the current metrics, so the lock is not held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time, or 0.0 before the first request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl TranscriptionMetric {
    pub fn average_processing_ms(&self) -> f64 {
        if self.succeeded > 0 {
            self.total_processing_ms as f64 / self.succeeded as f64
        } else {
            0.0
        }
    }
}
