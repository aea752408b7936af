//! # Transcription Engine
//!
//! The boundary between the request pipeline and speech recognition.
//!
//! ## Key Responsibilities:
//! - **Contract**: [`SpeechEngine`] takes an audio file path plus decoding options and
//!   returns ordered segments, the language and the audio duration
//! - **Replica pool**: [`WhisperEngine`] owns `workers` independent model copies, each
//!   serving one call at a time
//! - **Preprocessing**: decoding, resampling and optional silence filtering happen
//!   before the model sees the signal
//!
//! ## Blocking:
//! `transcribe` is synchronous and CPU-bound. Callers on an async runtime must run
//! it on a blocking thread (see `pipeline`).

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::audio::decoder::{decode_file, DecodeError, TARGET_SAMPLE_RATE};
use crate::audio::vad::{detect_speech, VadError, VadParameters};
use crate::config::EngineConfig;
use crate::device::{self, DevicePreference};

use super::model::{self, ModelFiles, WhisperModel};

/// Decoding policy for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOptions {
    /// Number of hypotheses kept per decoding step
    pub beam_size: usize,
    /// Forced language code; `None` means detect from the audio
    pub language: Option<String>,
    /// Priming text that biases recognition toward domain vocabulary
    pub initial_prompt: Option<String>,
    /// Silence filtering; `None` transcribes the signal as-is
    pub vad: Option<VadParameters>,
    /// Feed each window's text to the next window as context
    pub condition_on_previous_text: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            beam_size: 5,
            language: None,
            initial_prompt: None,
            vad: None,
            condition_on_previous_text: true,
        }
    }
}

/// A piece of recognized text, positioned in the original audio (seconds).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    /// Chronological; may be empty when no speech was found
    pub segments: Vec<Segment>,
    pub language: String,
    /// Length of the decoded source audio in seconds
    pub duration: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("could not decode audio: {0}")]
    Decode(#[from] DecodeError),
    #[error("voice activity detection failed: {0}")]
    Vad(#[from] VadError),
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("model inference failed: {0}")]
    Inference(#[from] candle_core::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

/// Speech recognition as seen by the pipeline.
///
/// Implementations must be shareable across threads; concurrency is bounded by the caller.
pub trait SpeechEngine: Send + Sync {
    /// Name reported to clients as `model_used`.
    fn model_name(&self) -> &str;

    fn transcribe(&self, audio: &Path, options: &DecodeOptions) -> Result<EngineOutput, EngineError>;
}

/// Whisper running on candle, with one model replica per worker.
pub struct WhisperEngine {
    name: String,
    device: &'static str,
    replicas: Vec<Mutex<WhisperModel>>,
}

impl WhisperEngine {
    /// Download (if needed) and load `config.workers` replicas of the configured model.
    pub async fn load(config: &EngineConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(config.workers > 0, "engine needs at least one worker");

        let start_time = Instant::now();
        let repo = model::repository_for(&config.model)?;
        let preference: DevicePreference = config.device.parse().map_err(anyhow::Error::msg)?;
        let device = device::resolve(preference);

        let files = ModelFiles::fetch(&repo).await?;
        let replicas = (0..config.workers)
            .map(|_| WhisperModel::from_files(&files, &device).map(Mutex::new))
            .collect::<anyhow::Result<Vec<_>>>()?;

        info!(
            model = %config.model,
            repo = %repo,
            device = device::describe(&device),
            replicas = replicas.len(),
            "Whisper model loaded in {:.2}s",
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            name: config.model.clone(),
            device: device::describe(&device),
            replicas,
        })
    }

    pub fn device(&self) -> &'static str {
        self.device
    }

    /// Take a free replica, or wait for the first one when all are busy.
    fn checkout(&self) -> MutexGuard<'_, WhisperModel> {
        for replica in &self.replicas {
            match replica.try_lock() {
                Ok(guard) => return guard,
                // A panic mid-call leaves no state behind that the next call relies on
                Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => continue,
            }
        }
        self.replicas[0].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SpeechEngine for WhisperEngine {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn transcribe(&self, audio: &Path, options: &DecodeOptions) -> Result<EngineOutput, EngineError> {
        let decoded = decode_file(audio)?;
        let duration = decoded.duration_seconds();
        debug!(source_rate = decoded.source_sample_rate, duration_secs = duration, "Audio ready for inference");

        let (pcm, timeline) = match &options.vad {
            Some(params) => {
                let timeline = detect_speech(&decoded.samples, params)?;
                if timeline.is_empty() {
                    info!(total_secs = duration, "Silence filter found no speech");
                }
                debug!(
                    regions = timeline.spans().len(),
                    kept_secs = timeline.speech_samples() as f64 / TARGET_SAMPLE_RATE as f64,
                    total_secs = duration,
                    "Silence filter applied"
                );
                (timeline.collect(&decoded.samples), Some(timeline))
            }
            None => (decoded.samples, None),
        };

        let transcript = self.checkout().transcribe(&pcm, options)?;

        let to_seconds = |sample: usize| match &timeline {
            Some(timeline) => timeline.to_source_seconds(sample),
            None => sample as f64 / TARGET_SAMPLE_RATE as f64,
        };
        let segments = transcript
            .windows
            .into_iter()
            .map(|window| Segment {
                start: to_seconds(window.start_sample),
                end: to_seconds(window.end_sample),
                text: window.text,
            })
            .collect();

        Ok(EngineOutput { segments, language: transcript.language, duration })
    }
}
