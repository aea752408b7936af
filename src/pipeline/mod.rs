//! # Transcription Pipeline
//!
//! Drives one request from raw upload to shaped result:
//!
//! ```text
//! Received ──validate──▶ Validated ──persist──▶ Persisted ──permit + blocking pool──▶ Transcribed | Failed
//!                                                                                         │
//!                                                                    release temp file ◀──┘
//! ```
//!
//! ## Resource guarantees:
//! - Rejected requests allocate nothing: validation runs before any disk I/O
//! - Inference never runs on the async scheduler; it is dispatched to tokio's
//!   blocking pool behind a semaphore with one permit per engine worker
//! - The temporary file and the permit move into the blocking task, so once
//!   dispatched the call always runs to completion and its file is released
//!   exactly once, even if the engine panics or the HTTP caller goes away

pub mod validator;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::audio::{StoreError, TemporaryAudioStore};
use crate::transcription::{DecodeOptions, Segment, SpeechEngine};

use validator::{validate, AuthPolicy, Rejection, TranscriptionRequest};

/// Text returned when the engine found no speech at all.
pub const NO_SPEECH_SENTINEL: &str = "[no speech detected]";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("missing or invalid API key")]
    AuthenticationFailed,
    #[error("unsupported audio format: {0:?} (allowed: mp3, wav, m4a, ogg, oga)")]
    UnsupportedFormat(String),
    #[error("audio payload is empty")]
    EmptyPayload,
    #[error("failed to store audio: {0}")]
    PersistFailure(#[from] StoreError),
    #[error("{0}")]
    EngineFailure(String),
}

impl From<Rejection> for PipelineError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Forbidden => PipelineError::AuthenticationFailed,
            Rejection::UnsupportedFormat(name) => PipelineError::UnsupportedFormat(name),
            Rejection::EmptyPayload => PipelineError::EmptyPayload,
        }
    }
}

/// Outcome of a successful transcription.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub segments: Vec<Segment>,
    /// Joined segment text, or [`NO_SPEECH_SENTINEL`]
    pub text: String,
    pub no_speech: bool,
    pub language: String,
    /// Audio duration in seconds
    pub duration: f64,
    /// Wall-clock time of the engine call
    pub processing_time: Duration,
    pub model: String,
}

/// Join segment texts with single spaces and trim the result.
pub fn join_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|segment| segment.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decrements the in-flight counter when the blocking call ends, however it ends.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a request needs, shared across all handlers.
pub struct TranscriptionPipeline {
    engine: Arc<dyn SpeechEngine>,
    store: TemporaryAudioStore,
    auth: AuthPolicy,
    options: Arc<DecodeOptions>,
    permits: Arc<Semaphore>,
    workers: usize,
    in_flight: Arc<AtomicUsize>,
}

impl TranscriptionPipeline {
    pub fn new(
        engine: Arc<dyn SpeechEngine>,
        store: TemporaryAudioStore,
        auth: AuthPolicy,
        options: DecodeOptions,
        workers: usize,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            engine,
            store,
            auth,
            options: Arc::new(options),
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn model_name(&self) -> &str {
        self.engine.model_name()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Whether `credential` passes the auth policy. Lets callers refuse a
    /// request from its headers alone; `run` still applies the same check.
    pub fn authorizes(&self, credential: Option<&str>) -> bool {
        self.auth.permits(credential)
    }

    /// Engine calls currently running on the blocking pool.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run one request through validation, storage, inference and cleanup.
    pub async fn run(&self, request: TranscriptionRequest) -> Result<TranscriptionResult, PipelineError> {
        let upload = validate(&self.auth, &request).map_err(|rejection| {
            warn!(source = request.source.kind(), reason = %rejection, "Transcription request rejected");
            PipelineError::from(rejection)
        })?;

        let handle = self
            .store
            .persist(request.source.bytes(), &upload.extension, upload.original_name.as_deref())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to persist upload");
                PipelineError::from(e)
            })?;
        // The request's copy of the payload is no longer needed
        drop(request);

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.store.release(handle).await;
                return Err(PipelineError::EngineFailure("worker pool is shut down".to_string()));
            }
        };

        let engine = self.engine.clone();
        let options = self.options.clone();
        let in_flight = self.in_flight.clone();

        debug!(path = %handle.path().display(), "Dispatching transcription");
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _in_flight = InFlight::enter(&in_flight);
            let started = Instant::now();
            let outcome = engine.transcribe(handle.path(), &options);
            (outcome, started.elapsed(), handle)
        });

        let (outcome, processing_time, handle) = match task.await {
            Ok(finished) => finished,
            Err(join_error) => {
                // The handle was dropped while unwinding, which deleted the file
                error!(error = %join_error, "Transcription worker panicked");
                return Err(PipelineError::EngineFailure("transcription worker panicked".to_string()));
            }
        };
        self.store.release(handle).await;

        let output = outcome.map_err(|e| {
            error!(error = %e, "Transcription failed");
            PipelineError::EngineFailure(e.to_string())
        })?;

        let joined = join_segments(&output.segments);
        let no_speech = joined.is_empty();
        let text = if no_speech { NO_SPEECH_SENTINEL.to_string() } else { joined };

        info!(
            segments = output.segments.len(),
            chars = text.len(),
            language = %output.language,
            duration_secs = output.duration,
            processing_secs = processing_time.as_secs_f64(),
            no_speech,
            "Transcription completed"
        );

        Ok(TranscriptionResult {
            segments: output.segments,
            text,
            no_speech,
            language: output.language,
            duration: output.duration,
            processing_time,
            model: self.engine.model_name().to_string(),
        })
    }
}
