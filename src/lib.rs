//! demovox
//!
//! Extracts each player's voice from a recorded match into its own WAV file.
//! Recordings arrive as an event feed from an external demo parser; voice
//! chunks are buffered per speaker, decoded in parallel, and the resulting
//! files are kept for a limited time before being evicted.

pub mod audio;
pub mod config;
pub mod enrich;
pub mod extract;
pub mod feed;
pub mod lifecycle;
pub mod metadata;
pub mod service;
pub mod session;

pub use config::Config;
pub use lifecycle::{Lifecycle, Registration};
pub use session::Session;
