//! Event feed from the recording parser
//!
//! The demo parser itself lives outside this crate. It hands us voice
//! messages, chat lines and a final roster, either in-process through
//! [`RecordingFeed`] or as a capture file (one JSON object per line,
//! optionally zstd-compressed).

use crate::audio::codec::WireFormat;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Captures smaller than this cannot hold a recording.
pub const MIN_RECORDING_BYTES: usize = 100;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Recording too small or empty: {0} bytes")]
    TooSmall(usize),
    #[error("Failed to decompress recording: {0}")]
    Decompress(std::io::Error),
    #[error("Malformed event on line {line}: {source}")]
    Json {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Invalid voice payload on line {line}: {source}")]
    Payload {
        line: usize,
        source: base64::DecodeError,
    },
    #[error("Recording parser failed: {0}")]
    Parser(String),
}

/// Participant identifier as reported by the recording (a 64-bit account id
/// rendered as decimal in practice).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeakerId(String);

impl SpeakerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for SpeakerId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// One voice message from the recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceMessage {
    pub speaker_id: SpeakerId,
    pub format: WireFormat,
    pub data: Vec<u8>,
}

/// One in-game chat message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatLine {
    /// Game clock at the time of the message, as printed by the parser.
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub sender: Option<String>,
    pub text: String,
}

impl fmt::Display for ChatLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sender = self.sender.as_deref().unwrap_or("Console");
        write!(f, "[{}] {}: {}", self.time, sender, self.text)
    }
}

/// Identity of a participant, known once parsing has finished.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Participant {
    pub speaker_id: SpeakerId,
    #[serde(default)]
    pub name: String,
    /// In-game team number (2 and 3 are the two playing sides).
    #[serde(default)]
    pub team: u8,
}

impl Participant {
    /// Display label for the participant's side, if they played.
    pub fn team_label(&self) -> Option<&'static str> {
        match self.team {
            2 => Some("Team 1"),
            3 => Some("Team 2"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Voice(VoiceMessage),
    Chat(ChatLine),
    /// End-of-parse identity mapping.
    Roster(Vec<Participant>),
}

/// Source of feed events for one recording, consumed in a single pass.
pub trait RecordingFeed {
    /// Deliver every event in recording order.
    fn scan(&mut self, on_event: &mut dyn FnMut(FeedEvent)) -> Result<(), FeedError>;
}

/// In-memory feed, mostly for embedding a parser directly.
#[derive(Debug, Clone, Default)]
pub struct MemoryFeed {
    events: Vec<FeedEvent>,
}

impl MemoryFeed {
    pub fn new(events: Vec<FeedEvent>) -> Self {
        Self { events }
    }

    pub fn push(&mut self, event: FeedEvent) {
        self.events.push(event);
    }
}

impl RecordingFeed for MemoryFeed {
    fn scan(&mut self, on_event: &mut dyn FnMut(FeedEvent)) -> Result<(), FeedError> {
        for event in self.events.drain(..) {
            on_event(event);
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum CaptureLine {
    Voice {
        speaker_id: SpeakerId,
        format: WireFormat,
        data: String,
    },
    Chat(ChatLine),
    Roster {
        players: Vec<Participant>,
    },
}

/// Capture file written by the external parser.
pub struct CaptureFile {
    path: PathBuf,
}

impl CaptureFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn is_compressed(&self) -> bool {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("zst"))
            .unwrap_or(false)
    }

    fn load(&self) -> Result<Vec<u8>, FeedError> {
        let raw = fs::read(&self.path)?;
        if raw.len() < MIN_RECORDING_BYTES {
            return Err(FeedError::TooSmall(raw.len()));
        }
        if !self.is_compressed() {
            return Ok(raw);
        }

        let data = zstd::decode_all(raw.as_slice()).map_err(FeedError::Decompress)?;
        debug!(
            "Decompressed {:?}: {} -> {} bytes",
            self.path,
            raw.len(),
            data.len()
        );
        Ok(data)
    }
}

impl RecordingFeed for CaptureFile {
    fn scan(&mut self, on_event: &mut dyn FnMut(FeedEvent)) -> Result<(), FeedError> {
        let data = self.load()?;

        for (idx, line) in data.split(|&b| b == b'\n').enumerate() {
            let line_no = idx + 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let parsed: CaptureLine = serde_json::from_slice(line).map_err(|source| FeedError::Json {
                line: line_no,
                source,
            })?;

            let event = match parsed {
                CaptureLine::Voice {
                    speaker_id,
                    format,
                    data,
                } => {
                    let data = BASE64.decode(data.as_bytes()).map_err(|source| FeedError::Payload {
                        line: line_no,
                        source,
                    })?;
                    FeedEvent::Voice(VoiceMessage {
                        speaker_id,
                        format,
                        data,
                    })
                }
                CaptureLine::Chat(chat) => FeedEvent::Chat(chat),
                CaptureLine::Roster { players } => FeedEvent::Roster(players),
            };
            on_event(event);
        }

        Ok(())
    }
}
