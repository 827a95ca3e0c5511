//! Per-speaker voice chunk buffers
//!
//! Collects raw voice payloads from the recording scan, keyed by speaker, in
//! arrival order. Appends lock only the speaker's shard of the table.

use crate::audio::codec::WireFormat;
use crate::feed::{ChatLine, Participant, SpeakerId, VoiceMessage};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// One compressed payload as received for a speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    /// Position in the recording-wide arrival sequence.
    pub arrival: u64,
    pub format: WireFormat,
    pub data: Vec<u8>,
}

/// Append-only chunk sequence for one speaker.
#[derive(Debug, Clone)]
pub struct SpeakerBuffer {
    pub speaker_id: SpeakerId,
    /// Format of the first chunk; every later chunk must match.
    pub format: WireFormat,
    chunks: Vec<RawChunk>,
}

impl SpeakerBuffer {
    pub fn new(speaker_id: SpeakerId, format: WireFormat) -> Self {
        Self {
            speaker_id,
            format,
            chunks: Vec::with_capacity(256),
        }
    }

    fn push(&mut self, chunk: RawChunk) {
        self.chunks.push(chunk);
    }

    pub fn chunks(&self) -> &[RawChunk] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

/// Everything captured from one recording, frozen after the scan.
#[derive(Debug, Default)]
pub struct CapturedVoice {
    pub buffers: Vec<SpeakerBuffer>,
    pub chat: Vec<ChatLine>,
    pub roster: Vec<Participant>,
    pub packets: u64,
}

impl CapturedVoice {
    /// Team label per speaker, from the end-of-parse roster.
    pub fn teams(&self) -> HashMap<SpeakerId, String> {
        self.roster
            .iter()
            .filter_map(|p| p.team_label().map(|t| (p.speaker_id.clone(), t.to_string())))
            .collect()
    }
}

/// Voice recorder fed by the single-pass recording scan
pub struct VoiceRecorder {
    buffers: DashMap<SpeakerId, SpeakerBuffer>,
    arrival: AtomicU64,
    chat: Mutex<Vec<ChatLine>>,
    roster: Mutex<Vec<Participant>>,
}

impl VoiceRecorder {
    pub fn new() -> Self {
        Self {
            buffers: DashMap::with_capacity(10),
            arrival: AtomicU64::new(0),
            chat: Mutex::new(Vec::new()),
            roster: Mutex::new(Vec::new()),
        }
    }

    /// Add a voice message for its speaker
    ///
    /// Empty payloads are dropped. A payload whose format differs from the
    /// speaker's first chunk is dropped with a warning, since one decoder
    /// cannot serve both.
    pub fn add_voice(&self, message: VoiceMessage) {
        if message.data.is_empty() {
            return;
        }

        let mut entry = self
            .buffers
            .entry(message.speaker_id.clone())
            .or_insert_with(|| SpeakerBuffer::new(message.speaker_id.clone(), message.format));

        if entry.format != message.format {
            warn!(
                "Dropping {} chunk for speaker {} (stream is {})",
                message.format, message.speaker_id, entry.format
            );
            return;
        }

        // Taken under the speaker's shard lock.
        let arrival = self.arrival.fetch_add(1, Ordering::Relaxed);
        entry.push(RawChunk {
            arrival,
            format: message.format,
            data: message.data,
        });
    }

    pub fn add_chat(&self, line: ChatLine) {
        self.chat.lock().push(line);
    }

    pub fn set_roster(&self, players: Vec<Participant>) {
        *self.roster.lock() = players;
    }

    /// Freeze the buffers once the scan is complete
    pub fn finish(self) -> CapturedVoice {
        let packets = self.arrival.load(Ordering::Relaxed);
        let mut buffers: Vec<SpeakerBuffer> =
            self.buffers.into_iter().map(|(_, buffer)| buffer).collect();
        buffers.sort_by(|a, b| a.speaker_id.cmp(&b.speaker_id));

        debug!(
            "Captured {} voice packets from {} speakers",
            packets,
            buffers.len()
        );

        CapturedVoice {
            buffers,
            chat: self.chat.into_inner(),
            roster: self.roster.into_inner(),
            packets,
        }
    }
}

impl Default for VoiceRecorder {
    fn default() -> Self {
        Self::new()
    }
}
