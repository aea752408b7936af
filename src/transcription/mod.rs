//! # Transcription Module
//!
//! Speech-to-text using Whisper models via the Candle-rs framework.
//!
//! ## Key Components:
//! - **engine**: the [`SpeechEngine`] contract and the replica-pool implementation
//! - **model**: model resolution, download and per-window inference
//! - **decoder**: beam search over decoder logits and the no-speech gate
//! - **mel**: Slaney mel filter bank for the log-mel front end

pub mod decoder; // Beam search and silence gating
pub mod engine; // Engine contract and Whisper replica pool
pub mod mel; // Mel filter bank
pub mod model; // Whisper model loading and windowed inference

pub use engine::{DecodeOptions, EngineError, EngineOutput, Segment, SpeechEngine, WhisperEngine};
