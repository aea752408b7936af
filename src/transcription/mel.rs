//! # Mel Filter Bank
//!
//! Whisper's log-mel front end projects each 400-point FFT frame onto a bank of
//! triangular filters spaced on the Slaney mel scale (linear below 1 kHz,
//! logarithmic above). The bank is computed here so loading a model never
//! needs a separate filter download.
//!
//! ## Layout:
//! Row-major `n_mels x (n_fft / 2 + 1)`, the layout
//! `candle_transformers::models::whisper::audio::pcm_to_mel` expects.

const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;
const F_SP: f64 = 200.0 / 3.0;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

/// Convert a frequency to the Slaney mel scale.
pub fn hz_to_mel(hz: f64) -> f64 {
    if hz < MIN_LOG_HZ {
        hz / F_SP
    } else {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    }
}

/// Inverse of [`hz_to_mel`].
pub fn mel_to_hz(mel: f64) -> f64 {
    if mel < MIN_LOG_MEL {
        mel * F_SP
    } else {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    }
}

/// Build an area-normalized Slaney filter bank covering `0..sample_rate/2`.
pub fn filter_bank(n_mels: usize, n_fft: usize, sample_rate: u32) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;

    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let max_mel = hz_to_mel(nyquist);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut weights = vec![0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (left, center, right) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
        let norm = 2.0 / (right - left);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - left) / (center - left);
            let falling = (right - freq) / (right - center);
            let weight = rising.min(falling).max(0.0);
            weights[m * n_freqs + k] = (weight * norm) as f32;
        }
    }
    weights
}
