//! # Beam Search Decoding
//!
//! Token-level search over a Whisper decoder, independent of how logits are produced.
//!
//! ## How it works:
//! 1. The prompt prefix (priming text + start-of-transcript sequence) is fed as one batch row
//! 2. Each step scores the next token for every live beam
//! 3. Special tokens are masked, logits become log-probabilities
//! 4. The best `beam_size` continuations survive; any that emit end-of-text are finished
//! 5. Finished hypotheses are ranked by length-normalized log-probability
//!
//! ## Determinism:
//! Candidates are ordered by score, then beam, then token id, so identical
//! inputs always produce identical output.

use std::cmp::Ordering;

/// A window is silent when the no-speech probability is above this...
pub const NO_SPEECH_THRESHOLD: f64 = 0.6;

/// ...and the average log-probability of the decoded text is below this.
pub const LOGPROB_THRESHOLD: f64 = -1.0;

/// Logits produced by one decoder step.
#[derive(Debug, Clone, Default)]
pub struct StepLogits {
    /// Next-token logits, one row per input sequence
    pub next: Vec<Vec<f32>>,
    /// Logits predicted at the start-of-transcript position of the first row, when requested
    pub at_sot: Option<Vec<f32>>,
}

/// Anything that can score the next token of a batch of equal-length sequences.
pub trait TokenScorer {
    type Error;

    fn step(&mut self, sequences: &[Vec<u32>], sot_position: Option<usize>) -> Result<StepLogits, Self::Error>;
}

/// Token ids the search needs to know about.
#[derive(Debug, Clone)]
pub struct SearchTokens {
    pub eot: u32,
    pub no_speech: u32,
    /// Token for a lone space; never allowed as the first token
    pub blank: Option<u32>,
    /// Always masked (timestamps, task and language markers, model-specific suppressions)
    pub suppressed: Vec<u32>,
}

/// Best hypothesis for one 30 second window.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedWindow {
    /// Generated text tokens, without the prefix or end-of-text
    pub tokens: Vec<u32>,
    pub sum_logprob: f64,
    pub avg_logprob: f64,
    pub no_speech_prob: f64,
}

impl DecodedWindow {
    /// Whisper's no-speech gate: confident silence and an unconvincing transcript.
    pub fn is_silent(&self) -> bool {
        self.no_speech_prob > NO_SPEECH_THRESHOLD && self.avg_logprob < LOGPROB_THRESHOLD
    }
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    sum_logprob: f64,
}

impl Hypothesis {
    fn generated(&self, prefix_len: usize) -> usize {
        self.tokens.len() - prefix_len
    }

    fn score(&self, generated: usize) -> f64 {
        self.sum_logprob / generated.max(1) as f64
    }
}

/// Beam search configuration for one window.
#[derive(Debug, Clone)]
pub struct BeamSearch<'a> {
    pub beam_size: usize,
    pub max_new_tokens: usize,
    pub tokens: &'a SearchTokens,
}

impl BeamSearch<'_> {
    /// Decode one window starting from `prefix`.
    ///
    /// `sot_position` is the index of the start-of-transcript token in `prefix`;
    /// the no-speech probability is read from the logits at that position.
    pub fn run<S: TokenScorer>(
        &self,
        scorer: &mut S,
        prefix: &[u32],
        sot_position: usize,
    ) -> Result<DecodedWindow, S::Error> {
        let beam_size = self.beam_size.max(1);
        let prefix_len = prefix.len();

        let mut live = vec![Hypothesis { tokens: prefix.to_vec(), sum_logprob: 0.0 }];
        let mut finished: Vec<Hypothesis> = Vec::new();
        let mut no_speech_prob = 0.0;

        for step in 0..self.max_new_tokens {
            let sequences: Vec<Vec<u32>> = live.iter().map(|h| h.tokens.clone()).collect();
            let logits = scorer.step(&sequences, (step == 0).then_some(sot_position))?;

            if let Some(at_sot) = logits.at_sot.as_deref() {
                no_speech_prob = softmax_at(at_sot, self.tokens.no_speech as usize);
            }

            // (score, beam, token)
            let mut candidates: Vec<(f64, usize, u32)> = Vec::new();
            for (beam, row) in logits.next.iter().enumerate().take(live.len()) {
                let mut row = row.clone();
                self.mask(&mut row, step == 0);
                let logprobs = log_softmax(&row);
                for (token, logprob) in top_k(&logprobs, beam_size + 1) {
                    candidates.push((live[beam].sum_logprob + logprob, beam, token));
                }
            }
            candidates.sort_by(|a, b| {
                b.0.total_cmp(&a.0)
                    .then_with(|| a.1.cmp(&b.1))
                    .then_with(|| a.2.cmp(&b.2))
            });

            let mut next: Vec<Hypothesis> = Vec::with_capacity(beam_size);
            for (sum_logprob, beam, token) in candidates {
                if token == self.tokens.eot {
                    if finished.len() < beam_size {
                        finished.push(Hypothesis { tokens: live[beam].tokens.clone(), sum_logprob });
                    }
                } else if next.len() < beam_size {
                    let mut tokens = live[beam].tokens.clone();
                    tokens.push(token);
                    next.push(Hypothesis { tokens, sum_logprob });
                }
                if next.len() == beam_size {
                    break;
                }
            }

            live = next;
            if finished.len() >= beam_size || live.is_empty() {
                break;
            }
        }

        // Out of budget: unfinished beams compete too
        if finished.is_empty() {
            finished = live;
        }

        let best = finished
            .into_iter()
            .max_by(|a, b| {
                let (la, lb) = (a.generated(prefix_len), b.generated(prefix_len));
                a.score(la)
                    .total_cmp(&b.score(lb))
                    .then_with(|| b.tokens.cmp(&a.tokens))
            })
            .unwrap_or(Hypothesis { tokens: prefix.to_vec(), sum_logprob: 0.0 });

        let generated = best.generated(prefix_len);
        Ok(DecodedWindow {
            tokens: best.tokens[prefix_len..].to_vec(),
            sum_logprob: best.sum_logprob,
            avg_logprob: best.sum_logprob / (generated + 1) as f64,
            no_speech_prob,
        })
    }

    fn mask(&self, logits: &mut [f32], first_step: bool) {
        let eot = self.tokens.eot as usize;
        // Everything after end-of-text is a special token
        for logit in logits.iter_mut().skip(eot + 1) {
            *logit = f32::NEG_INFINITY;
        }
        for &id in &self.tokens.suppressed {
            if let Some(logit) = logits.get_mut(id as usize) {
                *logit = f32::NEG_INFINITY;
            }
        }
        if first_step {
            for id in std::iter::once(self.tokens.eot).chain(self.tokens.blank) {
                if let Some(logit) = logits.get_mut(id as usize) {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }
    }
}

/// Numerically stable log-softmax. A row of all `-inf` stays `-inf`.
pub fn log_softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    if !max.is_finite() {
        return vec![f64::NEG_INFINITY; logits.len()];
    }
    let sum: f64 = logits.iter().map(|l| (*l as f64 - max).exp()).sum();
    let log_sum = max + sum.ln();
    logits.iter().map(|l| *l as f64 - log_sum).collect()
}

fn softmax_at(logits: &[f32], index: usize) -> f64 {
    log_softmax(logits).get(index).map(|lp| lp.exp()).unwrap_or(0.0)
}

/// The `k` highest finite log-probabilities, best first, ties broken by token id.
pub fn top_k(logprobs: &[f64], k: usize) -> Vec<(u32, f64)> {
    let mut ranked: Vec<(u32, f64)> = logprobs
        .iter()
        .enumerate()
        .filter(|(_, lp)| lp.is_finite())
        .map(|(id, lp)| (id as u32, *lp))
        .collect();
    ranked.sort_by(|a, b| match b.1.total_cmp(&a.1) {
        Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    });
    ranked.truncate(k);
    ranked
}
