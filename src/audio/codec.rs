//! Codec adapter for voice payloads
//!
//! Both wire formats carry Opus frames; they differ in framing, sample rate
//! and whether lost frames are concealed. Each speaker gets its own decoder
//! because Opus carries inter-frame state.

use audiopus::coder::Decoder;
use audiopus::packet::Packet;
use audiopus::{Channels, MutSignals, SampleRate};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Opus error: {0}")]
    Opus(#[from] audiopus::Error),
    #[error("Empty frame")]
    EmptyFrame,
}

/// Voice framing used by a recording.
///
/// The recording parser reports the tag per voice message; in practice one
/// recording uses a single tag for every speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Length/sequence framed records, 24 kHz, with loss concealment.
    #[serde(alias = "steam", alias = "VOICEDATA_FORMAT_STEAM")]
    Chunked,
    /// One bare Opus packet per chunk, 48 kHz.
    #[serde(alias = "opus", alias = "VOICEDATA_FORMAT_OPUS")]
    Unchunked,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Chunked => "chunked",
            WireFormat::Unchunked => "unchunked",
        }
    }

    pub fn sample_rate(&self) -> u32 {
        match self {
            WireFormat::Chunked => 24_000,
            WireFormat::Unchunked => 48_000,
        }
    }

    /// Samples synthesised per concealed frame (20 ms).
    pub fn frame_size(&self) -> usize {
        self.sample_rate() as usize / 50
    }

    /// Largest frame a legal Opus packet can decode to (120 ms).
    pub fn max_frame_size(&self) -> usize {
        self.sample_rate() as usize * 120 / 1000
    }

    fn opus_rate(&self) -> SampleRate {
        match self {
            WireFormat::Chunked => SampleRate::Hz24000,
            WireFormat::Unchunked => SampleRate::Hz48000,
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode primitive used by the frame protocol and the extraction workers.
///
/// Both operations append 32-bit PCM to `out` and return the number of
/// samples appended.
pub trait VoiceCodec: Send {
    /// Decode one compressed frame.
    fn decode_frame(&mut self, frame: &[u8], out: &mut Vec<i32>) -> Result<usize, CodecError>;

    /// Synthesise one frame standing in for a frame that never arrived.
    fn conceal_frame(&mut self, out: &mut Vec<i32>) -> Result<usize, CodecError>;
}

/// Creates a private codec instance per speaker job.
pub trait CodecFactory: Send + Sync {
    fn create(&self, format: WireFormat) -> Result<Box<dyn VoiceCodec>, CodecError>;
}

/// Opus decoder bound to one wire format's sample rate, mono.
pub struct OpusCodec {
    decoder: Decoder,
    format: WireFormat,
    scratch: Vec<f32>,
}

impl OpusCodec {
    pub fn new(format: WireFormat) -> Result<Self, CodecError> {
        let decoder = Decoder::new(format.opus_rate(), Channels::Mono)?;
        Ok(Self {
            decoder,
            format,
            scratch: vec![0.0; format.max_frame_size()],
        })
    }
}

impl VoiceCodec for OpusCodec {
    fn decode_frame(&mut self, frame: &[u8], out: &mut Vec<i32>) -> Result<usize, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        let packet = Packet::try_from(frame)?;
        let signals = MutSignals::try_from(&mut self.scratch[..])?;
        let n = self.decoder.decode_float(Some(packet), signals, false)?;
        append_samples(out, &self.scratch[..n]);
        Ok(n)
    }

    fn conceal_frame(&mut self, out: &mut Vec<i32>) -> Result<usize, CodecError> {
        let len = self.format.frame_size();
        let signals = MutSignals::try_from(&mut self.scratch[..len])?;
        let n = self.decoder.decode_float(None, signals, false)?;
        append_samples(out, &self.scratch[..n]);
        Ok(n)
    }
}

/// Factory handing out fresh [`OpusCodec`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpusCodecFactory;

impl CodecFactory for OpusCodecFactory {
    fn create(&self, format: WireFormat) -> Result<Box<dyn VoiceCodec>, CodecError> {
        Ok(Box::new(OpusCodec::new(format)?))
    }
}

/// Convert a float sample in [-1, 1] to full-scale signed 32-bit.
pub fn float_to_i32(sample: f32) -> i32 {
    (f64::from(sample.clamp(-1.0, 1.0)) * f64::from(i32::MAX)) as i32
}

fn append_samples(out: &mut Vec<i32>, pcm: &[f32]) {
    out.reserve(pcm.len());
    out.extend(pcm.iter().map(|&s| float_to_i32(s)));
}
