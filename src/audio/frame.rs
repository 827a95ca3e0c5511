//! Frame protocol decoder for chunked voice streams
//!
//! A chunk holds one or more records: `length: i16 LE`, then (unless the
//! length is -1) `frame_index: u16 LE` and `length` bytes of Opus. Gaps in
//! the frame index are filled with concealment frames.

use crate::audio::codec::{CodecError, VoiceCodec};
use std::cmp::Ordering;
use thiserror::Error;

/// Record length that marks the end of a logical stream.
pub const END_OF_STREAM: i16 = -1;

/// Upper bound on concealment frames synthesised for a single gap.
pub const MAX_CONCEALED_FRAMES: u16 = 10;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Truncated record header at offset {offset}")]
    TruncatedHeader { offset: usize },
    #[error("Invalid record length {length} at offset {offset}")]
    InvalidLength { offset: usize, length: i16 },
    #[error("Record at offset {offset} declares {declared} bytes but only {remaining} remain")]
    LengthOverrun {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// What happens to the expected index after a gap has been concealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GapPolicy {
    /// The expected index stays put and the record that exposed the gap is
    /// dropped. Later records keep reporting a gap until an exact match or an
    /// end-of-stream marker arrives.
    #[default]
    Hold,
    /// The record that exposed the gap is decoded after concealment and the
    /// expected index moves past it.
    Resync,
}

impl GapPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hold" => Some(GapPolicy::Hold),
            "resync" => Some(GapPolicy::Resync),
            _ => None,
        }
    }
}

/// Per-speaker decode counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub decoded: usize,
    pub concealed: usize,
    pub discarded: usize,
    pub resets: usize,
}

/// Sequence state for one speaker's chunked stream.
///
/// Owned by exactly one extraction job; never shared between speakers.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    expected_frame: u16,
    policy: GapPolicy,
    stats: FrameStats,
}

impl FrameDecoder {
    pub fn new(policy: GapPolicy) -> Self {
        Self {
            expected_frame: 0,
            policy,
            stats: FrameStats::default(),
        }
    }

    pub fn expected_frame(&self) -> u16 {
        self.expected_frame
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Decode every record in `chunk`, appending PCM to `out`.
    ///
    /// Stops at an end-of-stream marker; bytes after it are ignored. A
    /// malformed record aborts with an error, leaving whatever was appended
    /// before it in `out`.
    pub fn decode_chunk(
        &mut self,
        chunk: &[u8],
        codec: &mut dyn VoiceCodec,
        out: &mut Vec<i32>,
    ) -> Result<(), FrameError> {
        let mut offset = 0;

        while offset < chunk.len() {
            let record_start = offset;
            let length = read_i16(chunk, offset)
                .ok_or(FrameError::TruncatedHeader { offset: record_start })?;
            offset += 2;

            if length == END_OF_STREAM {
                self.expected_frame = 0;
                self.stats.resets += 1;
                break;
            }
            if length < 0 {
                return Err(FrameError::InvalidLength {
                    offset: record_start,
                    length,
                });
            }

            let frame_index = read_u16(chunk, offset)
                .ok_or(FrameError::TruncatedHeader { offset: record_start })?;
            offset += 2;

            let declared = length as usize;
            let remaining = chunk.len() - offset;
            if declared > remaining {
                return Err(FrameError::LengthOverrun {
                    offset: record_start,
                    declared,
                    remaining,
                });
            }
            let payload = &chunk[offset..offset + declared];
            offset += declared;

            self.apply_record(frame_index, payload, codec, out)?;
        }

        Ok(())
    }

    fn apply_record(
        &mut self,
        frame_index: u16,
        payload: &[u8],
        codec: &mut dyn VoiceCodec,
        out: &mut Vec<i32>,
    ) -> Result<(), FrameError> {
        match frame_index.cmp(&self.expected_frame) {
            Ordering::Equal => {
                codec.decode_frame(payload, out)?;
                self.stats.decoded += 1;
                self.expected_frame = self.expected_frame.wrapping_add(1);
            }
            Ordering::Greater => {
                let gap = frame_index - self.expected_frame;
                for _ in 0..gap.min(MAX_CONCEALED_FRAMES) {
                    codec.conceal_frame(out)?;
                    self.stats.concealed += 1;
                }
                if self.policy == GapPolicy::Resync {
                    codec.decode_frame(payload, out)?;
                    self.stats.decoded += 1;
                    self.expected_frame = frame_index.wrapping_add(1);
                }
            }
            Ordering::Less => {
                self.stats.discarded += 1;
            }
        }
        Ok(())
    }
}

fn read_i16(buf: &[u8], offset: usize) -> Option<i16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(i16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Encode one record the way the chunked format frames it.
pub fn encode_record(frame_index: u16, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(payload.len() + 4);
    record.extend_from_slice(&(payload.len() as i16).to_le_bytes());
    record.extend_from_slice(&frame_index.to_le_bytes());
    record.extend_from_slice(payload);
    record
}

/// Encode an end-of-stream marker.
pub fn encode_end_of_stream() -> Vec<u8> {
    END_OF_STREAM.to_le_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::testing::{MockCodec, BLOCK, DECODED};

    fn run(chunks: &[Vec<u8>], policy: GapPolicy) -> (FrameDecoder, MockCodec, Vec<i32>) {
        let mut decoder = FrameDecoder::new(policy);
        let mut codec = MockCodec::default();
        let mut out = Vec::new();
        for chunk in chunks {
            decoder.decode_chunk(chunk, &mut codec, &mut out).unwrap();
        }
        (decoder, codec, out)
    }

    fn frames(indices: impl IntoIterator<Item = u16>) -> Vec<Vec<u8>> {
        indices.into_iter().map(|i| encode_record(i, &[0xAB, i as u8])).collect()
    }

    #[test]
    fn test_sequential_frames_have_no_concealment() {
        let (decoder, codec, out) = run(&frames(0..25), GapPolicy::Hold);
        assert_eq!(codec.decoded, 25);
        assert_eq!(codec.concealed, 0);
        assert_eq!(out.len(), 25 * BLOCK);
        assert_eq!(decoder.expected_frame(), 25);
    }

    #[test]
    fn test_gap_conceals_exactly_gap_frames_between_real_frames() {
        for gap in 1..=10u16 {
            let chunks = frames([0, 1, 2, 3 + gap]);
            let (_, codec, out) = run(&chunks, GapPolicy::Resync);
            assert_eq!(codec.concealed, gap as usize, "gap {}", gap);
            assert_eq!(codec.decoded, 4);

            // Real frames 0..=2, then `gap` silent blocks, then the late frame.
            let concealed_region = &out[3 * BLOCK..(3 + gap as usize) * BLOCK];
            assert!(concealed_region.iter().all(|&s| s == 0));
            assert!(out[(3 + gap as usize) * BLOCK..].iter().all(|&s| s == DECODED));
        }
    }

    #[test]
    fn test_large_gap_is_capped() {
        let (_, codec, _) = run(&frames([0, 50]), GapPolicy::Resync);
        assert_eq!(codec.concealed, MAX_CONCEALED_FRAMES as usize);

        let (_, codec, _) = run(&frames([0, 50]), GapPolicy::Hold);
        assert_eq!(codec.concealed, MAX_CONCEALED_FRAMES as usize);
    }

    #[test]
    fn test_hold_keeps_expected_index_after_gap() {
        // 0 decodes; 3 exposes a gap of 2 and is dropped; 4 re-reports a gap
        // of 3; 1 is an exact match again.
        let (decoder, codec, _) = run(&frames([0, 3, 4, 1]), GapPolicy::Hold);
        assert_eq!(codec.decoded, 2);
        assert_eq!(codec.concealed, 2 + 3);
        assert_eq!(decoder.expected_frame(), 2);
    }

    #[test]
    fn test_resync_advances_past_gap() {
        let (decoder, codec, _) = run(&frames([0, 3, 4, 5]), GapPolicy::Resync);
        assert_eq!(codec.decoded, 4);
        assert_eq!(codec.concealed, 2);
        assert_eq!(decoder.expected_frame(), 6);
    }

    #[test]
    fn test_end_of_stream_resets_sequence() {
        let mut chunks = frames(0..5);
        chunks.push(encode_end_of_stream());
        chunks.extend(frames(0..3));
        let (decoder, codec, _) = run(&chunks, GapPolicy::Hold);
        assert_eq!(codec.decoded, 8);
        assert_eq!(codec.concealed, 0);
        assert_eq!(decoder.stats().resets, 1);
        assert_eq!(decoder.expected_frame(), 3);
    }

    #[test]
    fn test_bytes_after_end_of_stream_are_ignored() {
        let mut chunk = encode_record(0, &[1, 2, 3]);
        chunk.extend(encode_end_of_stream());
        chunk.extend(encode_record(0, &[4, 5, 6]));
        // Garbage that would be a length overrun if it were parsed.
        chunk.extend([0x10, 0x27, 0x00]);
        let (decoder, codec, _) = run(&[chunk], GapPolicy::Hold);
        assert_eq!(codec.decoded, 1);
        assert_eq!(decoder.expected_frame(), 0);
    }

    #[test]
    fn test_stale_records_produce_nothing() {
        let (decoder, codec, out) = run(&frames([0, 1, 2, 1, 0, 2]), GapPolicy::Hold);
        assert_eq!(codec.decoded, 3);
        assert_eq!(out.len(), 3 * BLOCK);
        assert_eq!(decoder.stats().discarded, 3);
    }

    #[test]
    fn test_multiple_records_in_one_chunk() {
        let chunk: Vec<u8> = (0..4u16).flat_map(|i| encode_record(i, &[7; 12])).collect();
        let (_, codec, out) = run(&[chunk], GapPolicy::Hold);
        assert_eq!(codec.decoded, 4);
        assert_eq!(out.len(), 4 * BLOCK);
    }

    #[test]
    fn test_length_overrun_is_an_error() {
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&9000i16.to_le_bytes());
        chunk.extend_from_slice(&0u16.to_le_bytes());
        chunk.resize(50, 0);

        let mut decoder = FrameDecoder::new(GapPolicy::Hold);
        let mut codec = MockCodec::default();
        let mut out = Vec::new();
        let err = decoder.decode_chunk(&chunk, &mut codec, &mut out).unwrap_err();
        match err {
            FrameError::LengthOverrun {
                declared,
                remaining,
                ..
            } => {
                assert_eq!(declared, 9000);
                assert_eq!(remaining, 46);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(codec.decoded, 0);
    }

    #[test]
    fn test_truncated_header_is_an_error() {
        let mut decoder = FrameDecoder::new(GapPolicy::Hold);
        let mut codec = MockCodec::default();
        let mut out = Vec::new();
        let err = decoder
            .decode_chunk(&[0x05, 0x00, 0x01], &mut codec, &mut out)
            .unwrap_err();
        assert!(matches!(err, FrameError::TruncatedHeader { offset: 0 }));
    }

    #[test]
    fn test_negative_length_other_than_marker_is_an_error() {
        let mut decoder = FrameDecoder::new(GapPolicy::Hold);
        let mut codec = MockCodec::default();
        let mut out = Vec::new();
        let chunk = (-2i16).to_le_bytes();
        let err = decoder.decode_chunk(&chunk, &mut codec, &mut out).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength { length: -2, .. }));
    }

    #[test]
    fn test_codec_rejection_propagates() {
        let mut decoder = FrameDecoder::new(GapPolicy::Hold);
        let mut codec = MockCodec::default();
        let mut out = Vec::new();
        let err = decoder
            .decode_chunk(&encode_record(0, &[]), &mut codec, &mut out)
            .unwrap_err();
        assert!(matches!(err, FrameError::Codec(CodecError::EmptyFrame)));
    }

    #[test]
    fn test_gap_policy_names() {
        assert_eq!(GapPolicy::from_str("HOLD"), Some(GapPolicy::Hold));
        assert_eq!(GapPolicy::from_str("resync"), Some(GapPolicy::Resync));
        assert_eq!(GapPolicy::from_str("skip"), None);
        assert_eq!(GapPolicy::default(), GapPolicy::Hold);
    }
}
