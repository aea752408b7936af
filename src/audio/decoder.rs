//! # Audio Decoding
//!
//! Turns an uploaded audio file into the 16 kHz mono PCM that Whisper expects.
//!
//! ## Pipeline:
//! 1. **Detect**: Symphonia sniffs the container (WAV, MP3, MP4/M4A, OGG, ...).
//!    Ogg streams starting with an `OpusHead` packet go to libopus instead,
//!    since Symphonia has no Opus decoder
//! 2. **Decode**: Packets of the first audio track are decoded to `f32`
//! 3. **Downmix**: Multi-channel frames are averaged into one channel
//! 4. **Resample**: Anything not already at 16 kHz goes through a sinc resampler

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use ogg::PacketReader;
use opus::Channels;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Sample rate every Whisper model is trained on.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Input block size fed to the resampler.
const RESAMPLE_CHUNK: usize = 1024;

/// Opus always decodes at 48 kHz; granule positions count samples at this rate.
const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Longest Opus frame (120 ms at 48 kHz), per channel.
const OPUS_MAX_FRAME: usize = 5_760;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to open audio file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unrecognised audio container: {0}")]
    Container(String),
    #[error("no decodable audio track found")]
    NoTrack,
    #[error("audio track does not declare a sample rate")]
    UnknownSampleRate,
    #[error("unsupported codec: {0}")]
    Codec(String),
    #[error("failed to read audio packet: {0}")]
    Packet(String),
    #[error("resampling failed: {0}")]
    Resample(String),
}

/// Mono PCM at [`TARGET_SAMPLE_RATE`], normalized to `[-1.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    /// Sample rate of the file before resampling
    pub source_sample_rate: u32,
}

impl DecodedAudio {
    /// Length of the decoded audio in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / TARGET_SAMPLE_RATE as f64
    }
}

/// Decode an audio file on disk into 16 kHz mono PCM.
///
/// The file extension is passed to the format reader as a hint only; the container is
/// always identified from its content.
pub fn decode_file(path: &Path) -> Result<DecodedAudio, DecodeError> {
    if is_ogg_opus(path)? {
        return decode_ogg_opus(path);
    }

    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let detected = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::Container(e.to_string()))?;
    let mut format = detected.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoTrack)?;
    let track_id = track.id;
    let source_rate = track.codec_params.sample_rate.ok_or(DecodeError::UnknownSampleRate)?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Codec(e.to_string()))?;

    let mut mono: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(DecodeError::Packet(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!(error = %e, "Skipping corrupt audio frame");
                continue;
            }
            Err(e) => return Err(DecodeError::Packet(e.to_string())),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            continue;
        }

        let mut buffer = SampleBuffer::<f32>::new(frames as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        downmix_into(buffer.samples(), spec.channels.count(), &mut mono);
    }

    finish(mono, source_rate)
}

/// Resample decoded mono PCM to the target rate.
fn finish(mono: Vec<f32>, source_rate: u32) -> Result<DecodedAudio, DecodeError> {
    let samples = if source_rate != TARGET_SAMPLE_RATE && !mono.is_empty() {
        resample(&mono, source_rate, TARGET_SAMPLE_RATE)?
    } else {
        mono
    };

    debug!(
        source_rate,
        samples = samples.len(),
        duration_secs = samples.len() as f64 / TARGET_SAMPLE_RATE as f64,
        "Audio decoded to 16kHz mono PCM"
    );

    Ok(DecodedAudio { samples, source_sample_rate: source_rate })
}

/// The fields of an Ogg Opus identification header this decoder needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpusHead {
    channels: usize,
    /// Decoder priming samples at 48 kHz to discard from the start
    pre_skip: usize,
}

impl OpusHead {
    fn parse(packet: &[u8]) -> Result<Self, DecodeError> {
        if packet.len() < 19 || !packet.starts_with(b"OpusHead") {
            return Err(DecodeError::Container("malformed OpusHead packet".to_string()));
        }
        let channels = packet[9] as usize;
        let mapping_family = packet[18];
        if channels == 0 || channels > 2 || mapping_family != 0 {
            return Err(DecodeError::Codec(format!(
                "Opus with {} channels (mapping family {}) is not supported",
                channels, mapping_family
            )));
        }
        Ok(Self {
            channels,
            pre_skip: u16::from_le_bytes([packet[10], packet[11]]) as usize,
        })
    }
}

/// Whether the file's first Ogg page carries an Opus identification header.
fn is_ogg_opus(path: &Path) -> Result<bool, DecodeError> {
    let mut first_page = Vec::with_capacity(64);
    File::open(path)?.take(64).read_to_end(&mut first_page)?;

    if first_page.len() < 27 || !first_page.starts_with(b"OggS") {
        return Ok(false);
    }
    // Page header is 27 bytes plus one lacing value per segment
    let body = 27 + first_page[26] as usize;
    Ok(first_page.get(body..).is_some_and(|rest| rest.starts_with(b"OpusHead")))
}

fn decode_ogg_opus(path: &Path) -> Result<DecodedAudio, DecodeError> {
    let mut reader = PacketReader::new(BufReader::new(File::open(path)?));
    let mut next_packet = move || reader.read_packet().map_err(|e| DecodeError::Packet(e.to_string()));

    let head_packet = next_packet()?.ok_or(DecodeError::NoTrack)?;
    let head = OpusHead::parse(&head_packet.data)?;
    let serial = head_packet.stream_serial();

    let layout = if head.channels == 2 { Channels::Stereo } else { Channels::Mono };
    let mut decoder =
        opus::Decoder::new(OPUS_SAMPLE_RATE, layout).map_err(|e| DecodeError::Codec(e.to_string()))?;

    let mut mono: Vec<f32> = Vec::new();
    let mut frame = vec![0.0f32; OPUS_MAX_FRAME * head.channels];
    let mut end_granule = 0u64;
    let mut seen_tags = false;

    while let Some(packet) = next_packet()? {
        if packet.stream_serial() != serial {
            continue;
        }
        // OpusTags is the second packet of the stream
        if !seen_tags {
            seen_tags = true;
            continue;
        }

        match decoder.decode_float(&packet.data, &mut frame, false) {
            Ok(per_channel) => downmix_into(&frame[..per_channel * head.channels], head.channels, &mut mono),
            Err(e) => {
                warn!(error = %e, "Skipping corrupt Opus packet");
                continue;
            }
        }
        end_granule = packet.absgp_page();
    }

    mono.drain(..head.pre_skip.min(mono.len()));
    // The final granule position marks where the real audio ends within the last frame
    let declared = (end_granule as usize).saturating_sub(head.pre_skip);
    if declared > 0 && declared < mono.len() {
        mono.truncate(declared);
    }

    finish(mono, OPUS_SAMPLE_RATE)
}

/// Average interleaved frames into a single channel.
fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

/// Sinc resampling of a mono signal, compensating for the filter delay.
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, DecodeError> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| DecodeError::Resample(e.to_string()))?;

    let delay = resampler.output_delay();
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    // Trailing zero blocks flush the filter so the tail of the signal comes out.
    let mut position = 0;
    while output.len() < expected + delay {
        let mut block = vec![0.0f32; RESAMPLE_CHUNK];
        if position < samples.len() {
            let end = (position + RESAMPLE_CHUNK).min(samples.len());
            block[..end - position].copy_from_slice(&samples[position..end]);
        }
        position += RESAMPLE_CHUNK;

        let processed = resampler
            .process(&[block], None)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
        if let Some(channel) = processed.first() {
            output.extend_from_slice(channel);
        }
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}
