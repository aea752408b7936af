//! Shared fixtures for unit tests: synthetic audio and a scripted engine.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audio::decoder::DecodeError;
use crate::audio::TemporaryAudioStore;
use crate::pipeline::validator::AuthPolicy;
use crate::pipeline::TranscriptionPipeline;
use crate::transcription::{DecodeOptions, EngineError, EngineOutput, Segment, SpeechEngine};

/// A sine tone at half amplitude.
pub fn sine_wave(frequency: f32, seconds: f32, sample_rate: u32) -> Vec<f32> {
    let n = (seconds * sample_rate as f32) as usize;
    (0..n)
        .map(|i| 0.5 * (2.0 * std::f32::consts::PI * frequency * i as f32 / sample_rate as f32).sin())
        .collect()
}

/// Encode interleaved samples as a 16-bit PCM WAV file.
pub fn write_wav(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for sample in samples {
            writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Encode interleaved 48 kHz samples as an Ogg Opus stream, the way voice notes arrive.
pub fn write_ogg_opus(samples: &[f32], channels: u8) -> Vec<u8> {
    use ogg::writing::{PacketWriteEndInfo, PacketWriter};

    const FRAME: usize = 960;
    const PRE_SKIP: u16 = 312;
    const SERIAL: u32 = 0x5eed;

    let layout = if channels == 2 { opus::Channels::Stereo } else { opus::Channels::Mono };
    let mut encoder = opus::Encoder::new(48_000, layout, opus::Application::Audio).unwrap();

    let mut head = b"OpusHead".to_vec();
    head.push(1);
    head.push(channels);
    head.extend_from_slice(&PRE_SKIP.to_le_bytes());
    head.extend_from_slice(&48_000u32.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes());
    head.push(0);

    let vendor = b"whisper-gateway tests";
    let mut tags = b"OpusTags".to_vec();
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&0u32.to_le_bytes());

    let mut bytes = Vec::new();
    {
        let mut writer = PacketWriter::new(&mut bytes);
        writer.write_packet(head, SERIAL, PacketWriteEndInfo::EndPage, 0).unwrap();
        writer.write_packet(tags, SERIAL, PacketWriteEndInfo::EndPage, 0).unwrap();

        let step = FRAME * channels as usize;
        let frames: Vec<Vec<f32>> = samples
            .chunks(step)
            .map(|chunk| {
                let mut frame = chunk.to_vec();
                frame.resize(step, 0.0);
                frame
            })
            .collect();
        let total = (samples.len() / channels as usize) as u64;

        for (i, frame) in frames.iter().enumerate() {
            let packet = encoder.encode_vec_float(frame, 4000).unwrap();
            let last = i + 1 == frames.len();
            let granule = PRE_SKIP as u64 + if last { total } else { ((i + 1) * FRAME) as u64 };
            let end = if last { PacketWriteEndInfo::EndStream } else { PacketWriteEndInfo::NormalPacket };
            writer.write_packet(packet, SERIAL, end, granule).unwrap();
        }
    }
    bytes
}

/// A [`SpeechEngine`] that returns canned output and records how it was called.
pub struct ScriptedEngine {
    segments: Vec<Segment>,
    language: String,
    fail_with: Option<String>,
    panic: bool,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<(PathBuf, Vec<u8>)>>,
}

impl ScriptedEngine {
    fn new(texts: &[&str]) -> Self {
        let segments = texts
            .iter()
            .enumerate()
            .map(|(i, text)| Segment { start: i as f64, end: i as f64 + 1.0, text: text.to_string() })
            .collect();
        Self {
            segments,
            language: "es".to_string(),
            fail_with: None,
            panic: false,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn speaking(texts: &[&str]) -> Self {
        Self::new(texts)
    }

    pub fn silent() -> Self {
        Self::new(&[])
    }

    pub fn failing(message: &str) -> Self {
        Self { fail_with: Some(message.to_string()), ..Self::new(&[]) }
    }

    pub fn panicking() -> Self {
        Self { panic: true, ..Self::new(&[]) }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `transcribe` calls observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn seen_paths(&self) -> Vec<PathBuf> {
        self.seen.lock().unwrap().iter().map(|(path, _)| path.clone()).collect()
    }

    pub fn seen_payloads(&self) -> Vec<Vec<u8>> {
        self.seen.lock().unwrap().iter().map(|(_, bytes)| bytes.clone()).collect()
    }
}

impl SpeechEngine for ScriptedEngine {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn transcribe(&self, audio: &Path, _options: &DecodeOptions) -> Result<EngineOutput, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let payload = std::fs::read(audio).unwrap_or_default();
        self.seen.lock().unwrap().push((audio.to_path_buf(), payload));

        std::thread::sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.panic {
            panic!("scripted engine panic");
        }
        if let Some(message) = &self.fail_with {
            return Err(EngineError::Decode(DecodeError::Container(message.clone())));
        }
        Ok(EngineOutput {
            segments: self.segments.clone(),
            language: self.language.clone(),
            duration: 2.345,
        })
    }
}

/// A pipeline over `engine` storing files in `dir`.
pub fn pipeline_with(
    engine: Arc<ScriptedEngine>,
    dir: &Path,
    api_key: Option<&str>,
    workers: usize,
) -> TranscriptionPipeline {
    TranscriptionPipeline::new(
        engine,
        TemporaryAudioStore::new(dir),
        AuthPolicy::new(api_key.map(str::to_string)),
        DecodeOptions::default(),
        workers,
    )
}
