//! # Whisper Model
//!
//! One loaded copy of the Whisper weights plus everything needed to turn 16 kHz
//! PCM into text: tokenizer, mel filters and the special-token table.
//!
//! ## Model Loading Process:
//! 1. Resolve the configured name (`small`, `base.en`, `org/repo`) to a hub repository
//! 2. Download config, tokenizer and safetensors weights from Hugging Face (cached locally)
//! 3. Build the model on the selected device; the mel filter bank is computed locally
//!
//! ## Transcription:
//! Audio is converted to a log-mel spectrogram and processed in 30 second windows.
//! Each window is beam-searched independently; the decoded text of earlier windows
//! can be fed back as context through the `<|startofprev|>` prompt.
//!
//! ## Key Rust Concepts:
//! - **`&mut self` inference**: the candle decoder keeps a cross-attention cache,
//!   so a model replica serves one request at a time
//! - **Disjoint field borrows**: the scorer borrows `self.model` mutably while the
//!   search reads `self.search_tokens`

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::decoder::{BeamSearch, SearchTokens, StepLogits, TokenScorer};
use super::engine::{DecodeOptions, EngineError};
use super::mel;

/// Vocabulary size from which a checkpoint carries language tokens.
const MULTILINGUAL_VOCAB: usize = 51865;

/// Language reported when nothing could be decoded and nothing was forced.
pub const UNDETERMINED_LANGUAGE: &str = "und";

/// Language codes in token order, as understood by multilingual checkpoints.
pub const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv", "it",
    "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no", "th", "ur",
    "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr", "az", "sl", "kn",
    "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw", "gl", "mr", "pa", "si",
    "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu", "am", "yi", "lo", "uz", "fo",
    "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl", "mg", "as", "tt", "haw", "ln", "ha",
    "ba", "jw", "su", "yue",
];

/// Published Whisper checkpoint sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    LargeV2,
    LargeV3,
}

impl ModelSize {
    fn repo_stem(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::LargeV2 => "large-v2",
            ModelSize::LargeV3 => "large-v3",
        }
    }

    /// Whether an English-only (`.en`) checkpoint exists for this size.
    fn has_english_variant(&self) -> bool {
        !matches!(self, ModelSize::LargeV2 | ModelSize::LargeV3)
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large-v2" => Ok(ModelSize::LargeV2),
            "large" | "large-v3" => Ok(ModelSize::LargeV3),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.repo_stem())
    }
}

/// Resolve a configured model name to a Hugging Face repository id.
///
/// `org/name` ids are used verbatim; short names map to `openai/whisper-*`.
pub fn repository_for(name: &str) -> Result<String> {
    let name = name.trim();
    if name.contains('/') {
        return Ok(name.to_string());
    }

    let (stem, english_only) = match name.strip_suffix(".en") {
        Some(stem) => (stem, true),
        None => (name, false),
    };
    let size: ModelSize = stem.parse()?;
    if english_only && !size.has_english_variant() {
        return Err(anyhow!("No English-only checkpoint exists for {}", size));
    }

    Ok(format!(
        "openai/whisper-{}{}",
        size.repo_stem(),
        if english_only { ".en" } else { "" }
    ))
}

/// Local paths of the files a model is built from.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    /// Download (or reuse from cache) the files of `repo_id`.
    ///
    /// Honours `HF_TOKEN` for gated repositories and `HF_HUB_CACHE` / `HF_HOME`
    /// for the cache location.
    pub async fn fetch(repo_id: &str) -> Result<Self> {
        use hf_hub::api::tokio::ApiBuilder;

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Ok(token) = std::env::var("HF_TOKEN") {
            debug!("Using HF token (length: {})", token.len());
            builder = builder.with_token(Some(token));
        }
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
        }
        let api = builder
            .build()
            .map_err(|e| anyhow!("Failed to initialise Hugging Face client: {}", e))?;

        info!(repo = repo_id, "Fetching model files");
        let repo = api.model(repo_id.to_string());
        let config = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", repo_id, e))?;
        let tokenizer = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", repo_id, e))?;
        let weights = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model.safetensors from {}: {}", repo_id, e))?;

        Ok(Self { config, tokenizer, weights })
    }
}

/// Ids of the special tokens the decoder needs.
#[derive(Debug, Clone)]
struct SpecialTokens {
    sot: u32,
    transcribe: u32,
    no_timestamps: u32,
    start_of_prev: Option<u32>,
    languages: Vec<(&'static str, u32)>,
}

impl SpecialTokens {
    fn lookup(tokenizer: &Tokenizer) -> Result<(Self, SearchTokens)> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer is missing {}", token))
        };

        let no_speech = m::NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| tokenizer.token_to_id(token))
            .ok_or_else(|| anyhow!("Tokenizer has no no-speech token"))?;

        let languages = LANGUAGES
            .iter()
            .filter_map(|code| tokenizer.token_to_id(&format!("<|{code}|>")).map(|id| (*code, id)))
            .collect();

        let special = Self {
            sot: id(m::SOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
            start_of_prev: tokenizer.token_to_id("<|startofprev|>"),
            languages,
        };
        let search = SearchTokens {
            eot: id(m::EOT_TOKEN)?,
            no_speech,
            blank: tokenizer.token_to_id("Ġ"),
            suppressed: Vec::new(),
        };
        Ok((special, search))
    }

    fn language(&self, code: &str) -> Option<(&'static str, u32)> {
        self.languages.iter().copied().find(|(c, _)| *c == code)
    }
}

/// Decoder input for one window: optional prompt, then the start-of-transcript sequence.
///
/// Returns the tokens and the index of the start-of-transcript token.
fn build_prefix(
    special: &SpecialTokens,
    context: &[u32],
    language: Option<u32>,
    max_target_positions: usize,
) -> (Vec<u32>, usize) {
    let mut prefix = Vec::new();
    if let (Some(start_of_prev), false) = (special.start_of_prev, context.is_empty()) {
        let keep = (max_target_positions / 2).saturating_sub(1);
        prefix.push(start_of_prev);
        prefix.extend_from_slice(&context[context.len().saturating_sub(keep)..]);
    }
    let sot_position = prefix.len();
    prefix.push(special.sot);
    if let Some(language) = language {
        prefix.push(language);
        prefix.push(special.transcribe);
    }
    prefix.push(special.no_timestamps);
    (prefix, sot_position)
}

/// Text decoded from one window, positioned in samples of the input PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowText {
    pub start_sample: usize,
    pub end_sample: usize,
    pub text: String,
}

/// Result of running the model over a whole signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub language: String,
    pub windows: Vec<WindowText>,
}

/// A loaded Whisper model ready for transcription.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    special: SpecialTokens,
    search_tokens: SearchTokens,
}

impl WhisperModel {
    /// Build a model replica from downloaded files.
    pub fn from_files(files: &ModelFiles, device: &Device) -> Result<Self> {
        let config: Config = serde_json::from_reader(std::fs::File::open(&files.config)?)?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let (special, mut search_tokens) = SpecialTokens::lookup(&tokenizer)?;
        search_tokens.suppressed = config.suppress_tokens.clone();

        let mel_filters = mel::filter_bank(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE as u32);

        // SAFETY: safetensors files are memory-mapped read-only
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], m::DTYPE, device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        Ok(Self {
            model,
            config,
            device: device.clone(),
            tokenizer,
            mel_filters,
            special,
            search_tokens,
        })
    }

    pub fn is_multilingual(&self) -> bool {
        self.config.vocab_size >= MULTILINGUAL_VOCAB
    }

    /// Check a forced language against what this checkpoint can decode.
    fn forced_language(&self, code: &str) -> Result<(&'static str, Option<u32>), EngineError> {
        if !self.is_multilingual() {
            return match code {
                "en" => Ok(("en", None)),
                _ => Err(EngineError::UnsupportedLanguage(code.to_string())),
            };
        }
        self.special
            .language(code)
            .map(|(code, id)| (code, Some(id)))
            .ok_or_else(|| EngineError::UnsupportedLanguage(code.to_string()))
    }

    /// Transcribe 16 kHz mono PCM.
    ///
    /// Windows judged to be silence produce no text. An empty signal yields an
    /// empty transcript, not an error.
    pub fn transcribe(&mut self, pcm: &[f32], options: &DecodeOptions) -> Result<Transcript, EngineError> {
        let mut language: Option<(&'static str, Option<u32>)> = match options.language.as_deref() {
            Some(code) => Some(self.forced_language(code)?),
            None if !self.is_multilingual() => Some(("en", None)),
            None => None,
        };

        let content_frames = pcm.len().div_ceil(m::HOP_LENGTH);
        if content_frames == 0 {
            let code = language.map(|(code, _)| code).unwrap_or(UNDETERMINED_LANGUAGE);
            return Ok(Transcript { language: code.to_string(), windows: Vec::new() });
        }

        let mel = self.log_mel(pcm)?;
        let (_, _, total_frames) = mel.dims3()?;

        let mut history = match options.initial_prompt.as_deref().map(str::trim) {
            Some(prompt) if !prompt.is_empty() => self.encode(&format!(" {prompt}"))?,
            _ => Vec::new(),
        };

        let max_target_positions = self.config.max_target_positions;
        let mut windows = Vec::new();
        let mut seek = 0;

        while seek < content_frames {
            let frames = m::N_FRAMES.min(total_frames.saturating_sub(seek));
            if frames == 0 {
                break;
            }
            let span = m::N_FRAMES.min(content_frames - seek);
            let features = self.model.encoder.forward(&mel.narrow(2, seek, frames)?, true)?;

            let (code, language_token) = match language {
                Some(resolved) => resolved,
                None => {
                    let detected = self.detect_language(&features)?;
                    info!(language = detected.0, "Detected language");
                    language = Some(detected);
                    detected
                }
            };

            let (prefix, sot_position) = build_prefix(&self.special, &history, language_token, max_target_positions);
            let search = BeamSearch {
                beam_size: options.beam_size,
                max_new_tokens: (max_target_positions / 2).min(max_target_positions.saturating_sub(prefix.len())),
                tokens: &self.search_tokens,
            };
            let mut scorer = WindowScorer::new(&mut self.model, &features, &self.device);
            let decoded = search.run(&mut scorer, &prefix, sot_position)?;

            if decoded.is_silent() {
                debug!(
                    seek,
                    no_speech_prob = decoded.no_speech_prob,
                    avg_logprob = decoded.avg_logprob,
                    "Window skipped as silence"
                );
            } else {
                let text = self
                    .tokenizer
                    .decode(&decoded.tokens, true)
                    .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
                let text = text.trim();
                debug!(seek, language = code, avg_logprob = decoded.avg_logprob, text, "Window decoded");
                if !text.is_empty() {
                    windows.push(WindowText {
                        start_sample: seek * m::HOP_LENGTH,
                        end_sample: ((seek + span) * m::HOP_LENGTH).min(pcm.len()),
                        text: text.to_string(),
                    });
                }
                if options.condition_on_previous_text {
                    history.extend_from_slice(&decoded.tokens);
                }
            }

            seek += span;
        }

        self.model.reset_kv_cache();

        let code = language.map(|(code, _)| code).unwrap_or(UNDETERMINED_LANGUAGE);
        Ok(Transcript { language: code.to_string(), windows })
    }

    fn log_mel(&self, pcm: &[f32]) -> Result<Tensor, EngineError> {
        let mel = m::audio::pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        Ok(Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Pick the most likely language token after start-of-transcript.
    fn detect_language(&mut self, features: &Tensor) -> Result<(&'static str, Option<u32>), EngineError> {
        let tokens = Tensor::new(&[[self.special.sot]], &self.device)?;
        let ys = self.model.decoder.forward(&tokens, features, true)?;
        let logits: Vec<f32> = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?.to_vec1()?;

        self.special
            .languages
            .iter()
            .filter(|(_, id)| (*id as usize) < logits.len())
            .max_by(|a, b| logits[a.1 as usize].total_cmp(&logits[b.1 as usize]))
            .map(|(code, id)| (*code, Some(*id)))
            .ok_or_else(|| EngineError::UnsupportedLanguage(UNDETERMINED_LANGUAGE.to_string()))
    }
}

/// Scores beam-search steps with the candle decoder over one window's audio features.
struct WindowScorer<'a> {
    model: &'a mut m::model::Whisper,
    features: &'a Tensor,
    device: &'a Device,
    batched: Tensor,
    batch: usize,
    fresh: bool,
}

impl<'a> WindowScorer<'a> {
    fn new(model: &'a mut m::model::Whisper, features: &'a Tensor, device: &'a Device) -> Self {
        Self { model, features, device, batched: features.clone(), batch: 1, fresh: true }
    }
}

impl TokenScorer for WindowScorer<'_> {
    type Error = candle_core::Error;

    fn step(&mut self, sequences: &[Vec<u32>], sot_position: Option<usize>) -> candle_core::Result<StepLogits> {
        let batch = sequences.len();
        let seq_len = sequences.first().map(Vec::len).unwrap_or(0);
        if batch == 0 || seq_len == 0 {
            return Ok(StepLogits::default());
        }

        // The cross-attention cache is per batch row, so it is rebuilt when the beam count changes
        let flush = self.fresh || batch != self.batch;
        if batch != self.batch {
            self.batched = Tensor::cat(&vec![self.features.clone(); batch], 0)?;
            self.batch = batch;
        }
        self.fresh = false;

        let flat: Vec<u32> = sequences.iter().flatten().copied().collect();
        let tokens = Tensor::from_vec(flat, (batch, seq_len), self.device)?;
        let ys = self.model.decoder.forward(&tokens, &self.batched, flush)?;

        let last = self.model.decoder.final_linear(&ys.i((.., seq_len - 1..))?)?;
        let next: Vec<Vec<f32>> = last.squeeze(1)?.to_vec2()?;

        let at_sot = match sot_position {
            Some(position) => Some(
                self.model
                    .decoder
                    .final_linear(&ys.i((..1, position..position + 1))?)?
                    .i(0)?
                    .i(0)?
                    .to_vec1()?,
            ),
            None => None,
        };

        Ok(StepLogits { next, at_sot })
    }
}
