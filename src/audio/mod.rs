//! # Audio Module
//!
//! Everything that touches raw audio before it reaches the model.
//!
//! ## Components:
//! - **decoder**: container probing (plus Ogg Opus), downmix and resampling to 16 kHz mono
//! - **vad**: Silero speech detection with a map back to source time
//! - **store**: per-request temporary files with guaranteed cleanup

pub mod decoder;
pub mod store;
pub mod vad;

pub use store::{StoreError, TemporaryAudioStore};
