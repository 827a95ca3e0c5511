//! Audio module for voice decoding and output
//!
//! Handles per-speaker chunk capture, frame decoding and WAV output

pub mod codec;
pub mod frame;
pub mod processor;
pub mod recorder;

pub use codec::{CodecFactory, OpusCodecFactory, VoiceCodec, WireFormat};
pub use frame::{FrameDecoder, GapPolicy};
pub use processor::AudioProcessor;
pub use recorder::VoiceRecorder;
