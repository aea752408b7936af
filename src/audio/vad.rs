//! # Voice-Activity Filtering
//!
//! Silero VAD decides which parts of a recording contain speech so long
//! silences can be cut before decoding. Whisper tends to hallucinate text
//! over silence; dropping those stretches also shortens decoding.
//!
//! ## Algorithm:
//! 1. Run the Silero model over 32 ms windows (512 samples at 16 kHz) to get a
//!    speech probability per window
//! 2. A region opens when a window reaches [`SPEECH_THRESHOLD`] and stays open
//!    until the probability has stayed below the lower release threshold for
//!    `min_silence_duration_ms`
//! 3. Regions shorter than [`MIN_SPEECH_MS`] are discarded
//! 4. Each region is padded by `speech_pad_ms`; closer neighbours split the gap

use serde::{Deserialize, Serialize};
use tracing::debug;
use voice_activity_detector::VoiceActivityDetector;

use super::decoder::TARGET_SAMPLE_RATE;

/// Samples per Silero window at 16 kHz.
const WINDOW_SAMPLES: usize = 512;

/// Probability at which a window counts as speech.
pub const SPEECH_THRESHOLD: f32 = 0.5;

/// An open region only closes once the probability drops this far below the threshold.
const RELEASE_MARGIN: f32 = 0.15;

/// Regions shorter than this are treated as noise.
pub const MIN_SPEECH_MS: usize = 250;

#[derive(Debug, thiserror::Error)]
pub enum VadError {
    #[error("failed to load the Silero VAD model: {0}")]
    Model(String),
}

/// Tuning knobs for the silence filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VadParameters {
    /// Silences at least this long are removed
    pub min_silence_duration_ms: u32,
    /// Audio kept on each side of a speech region
    pub speech_pad_ms: u32,
}

impl Default for VadParameters {
    fn default() -> Self {
        Self {
            min_silence_duration_ms: 2000,
            speech_pad_ms: 400,
        }
    }
}

/// Speech regions of a signal, as sample ranges in source time.
///
/// The spans are sorted and non-overlapping. The timeline can stitch the
/// regions into one continuous buffer and map offsets in that buffer back
/// to positions in the original audio.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpeechTimeline {
    spans: Vec<(usize, usize)>,
}

impl SpeechTimeline {
    pub fn spans(&self) -> &[(usize, usize)] {
        &self.spans
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Number of samples kept after filtering.
    pub fn speech_samples(&self) -> usize {
        self.spans.iter().map(|(start, end)| end - start).sum()
    }

    /// Concatenate the speech regions of `samples`.
    pub fn collect(&self, samples: &[f32]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.speech_samples());
        for &(start, end) in &self.spans {
            out.extend_from_slice(&samples[start.min(samples.len())..end.min(samples.len())]);
        }
        out
    }

    /// Map an offset in the filtered buffer back to a sample in the source.
    pub fn to_source_sample(&self, filtered: usize) -> usize {
        let mut consumed = 0;
        for &(start, end) in &self.spans {
            let len = end - start;
            if filtered <= consumed + len {
                return start + (filtered - consumed);
            }
            consumed += len;
        }
        self.spans.last().map(|&(_, end)| end).unwrap_or(filtered)
    }

    /// Same as [`Self::to_source_sample`], expressed in seconds.
    pub fn to_source_seconds(&self, filtered: usize) -> f64 {
        self.to_source_sample(filtered) as f64 / TARGET_SAMPLE_RATE as f64
    }
}

/// Find the speech regions in 16 kHz mono PCM.
pub fn detect_speech(samples: &[f32], params: &VadParameters) -> Result<SpeechTimeline, VadError> {
    if samples.is_empty() {
        return Ok(SpeechTimeline::default());
    }

    let mut detector = VoiceActivityDetector::builder()
        .sample_rate(16_000)
        .chunk_size(WINDOW_SAMPLES)
        .build()
        .map_err(|e| VadError::Model(e.to_string()))?;

    let probabilities: Vec<f32> = samples
        .chunks(WINDOW_SAMPLES)
        .map(|window| {
            if window.len() == WINDOW_SAMPLES {
                detector.predict(window.iter().copied())
            } else {
                let mut padded = window.to_vec();
                padded.resize(WINDOW_SAMPLES, 0.0);
                detector.predict(padded)
            }
        })
        .collect();

    let timeline = speech_spans(&probabilities, samples.len(), params);
    debug!(windows = probabilities.len(), regions = timeline.spans.len(), "Silero VAD finished");
    Ok(timeline)
}

/// Turn per-window speech probabilities into padded sample spans.
///
/// `probabilities[i]` covers samples `i * 512 .. (i + 1) * 512`.
fn speech_spans(probabilities: &[f32], total_samples: usize, params: &VadParameters) -> SpeechTimeline {
    let rate = TARGET_SAMPLE_RATE as usize;
    let min_silence = params.min_silence_duration_ms as usize * rate / 1000;
    let min_speech = MIN_SPEECH_MS * rate / 1000;
    let pad = params.speech_pad_ms as usize * rate / 1000;
    let release = SPEECH_THRESHOLD - RELEASE_MARGIN;

    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut open: Option<usize> = None;
    let mut silence_from: Option<usize> = None;

    for (index, &probability) in probabilities.iter().enumerate() {
        let position = (index * WINDOW_SAMPLES).min(total_samples);

        if probability >= SPEECH_THRESHOLD {
            silence_from = None;
            open.get_or_insert(position);
            continue;
        }

        let Some(start) = open else { continue };
        if probability >= release {
            continue;
        }

        let end = *silence_from.get_or_insert(position);
        if position - end < min_silence {
            continue;
        }
        if end - start > min_speech {
            spans.push((start, end));
        }
        open = None;
        silence_from = None;
    }

    if let Some(start) = open {
        if total_samples - start > min_speech {
            spans.push((start, total_samples));
        }
    }

    for i in 0..spans.len() {
        if i == 0 {
            spans[0].0 = spans[0].0.saturating_sub(pad);
        }
        match spans.get(i + 1).map(|next| next.0) {
            Some(next_start) => {
                let gap = next_start - spans[i].1;
                if gap < 2 * pad {
                    spans[i].1 += gap / 2;
                    spans[i + 1].0 -= gap / 2;
                } else {
                    spans[i].1 = (spans[i].1 + pad).min(total_samples);
                    spans[i + 1].0 = next_start.saturating_sub(pad);
                }
            }
            None => spans[i].1 = (spans[i].1 + pad).min(total_samples),
        }
    }

    SpeechTimeline { spans }
}
