//! Audio output helpers
//!
//! WAV container writing, duration bookkeeping, file cleanup, and the pool of
//! reusable PCM scratch buffers the extraction workers assemble audio in.

use parking_lot::Mutex;
use std::fs;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Output bit depth (samples are full-scale signed 32-bit).
pub const BITS_PER_SAMPLE: u16 = 32;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("File not found: {0}")]
    NotFound(PathBuf),
}

/// Length of a written audio file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioInfo {
    pub samples: usize,
    pub sample_rate: u32,
}

impl AudioInfo {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples as f64 / f64::from(self.sample_rate)
    }
}

/// Result of a best-effort batch delete.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub missing: usize,
    pub failed: usize,
}

/// Audio processor for output files
pub struct AudioProcessor;

impl AudioProcessor {
    /// Write mono 32-bit PCM to a WAV file in one pass
    pub fn write_wav(path: &Path, sample_rate: u32, samples: &[i32]) -> Result<AudioInfo, ProcessorError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: BITS_PER_SAMPLE,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;

        debug!("Wrote {} samples @ {} Hz to {:?}", samples.len(), sample_rate, path);
        Ok(AudioInfo {
            samples: samples.len(),
            sample_rate,
        })
    }

    /// Read the length of a WAV file from its header
    pub fn wav_info(path: &Path) -> Result<AudioInfo, ProcessorError> {
        if !path.exists() {
            return Err(ProcessorError::NotFound(path.to_path_buf()));
        }
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        Ok(AudioInfo {
            samples: reader.duration() as usize,
            sample_rate: spec.sample_rate,
        })
    }

    /// Format a duration as "1m 23s" or "45s"
    pub fn format_duration(secs: f64) -> String {
        let total = secs.max(0.0) as u64;
        let minutes = total / 60;
        let seconds = total % 60;
        if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Delete files, logging failures instead of returning them
    ///
    /// A file that is already gone counts as missing, not failed.
    pub fn cleanup_files(paths: &[PathBuf]) -> CleanupReport {
        let mut report = CleanupReport::default();
        for path in paths {
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!("Removed file: {:?}", path);
                    report.removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    report.missing += 1;
                }
                Err(e) => {
                    warn!("Failed to remove {:?}: {}", path, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Remove every regular file directly inside `dir`
    pub fn clear_dir(dir: &Path) -> Result<CleanupReport, ProcessorError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(Self::cleanup_files(&files))
    }
}

/// Pool of reusable sample buffers
///
/// Buffers larger than `max_capacity` are dropped instead of returned so one
/// long speaker does not pin memory for the life of the process.
pub struct SamplePool {
    idle: Mutex<Vec<Vec<i32>>>,
    max_idle: usize,
    max_capacity: usize,
}

impl SamplePool {
    pub fn new(max_idle: usize, max_capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            max_capacity,
        }
    }

    /// Take an empty buffer out of the pool.
    pub fn acquire(&self) -> PooledSamples<'_> {
        let buffer = self.idle.lock().pop().unwrap_or_default();
        PooledSamples {
            buffer: Some(buffer),
            pool: self,
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut buffer: Vec<i32>) {
        if buffer.capacity() > self.max_capacity {
            return;
        }
        buffer.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buffer);
        }
    }
}

impl Default for SamplePool {
    fn default() -> Self {
        // 16 idle buffers, each up to ~5 minutes of 48 kHz audio.
        Self::new(16, 48_000 * 300)
    }
}

/// Buffer on loan from a [`SamplePool`]; returned, emptied, on drop.
pub struct PooledSamples<'a> {
    buffer: Option<Vec<i32>>,
    pool: &'a SamplePool,
}

impl Deref for PooledSamples<'_> {
    type Target = Vec<i32>;

    fn deref(&self) -> &Vec<i32> {
        self.buffer.as_ref().unwrap_or_else(|| unreachable!("buffer taken before drop"))
    }
}

impl DerefMut for PooledSamples<'_> {
    fn deref_mut(&mut self) -> &mut Vec<i32> {
        self.buffer.as_mut().unwrap_or_else(|| unreachable!("buffer taken before drop"))
    }
}

impl Drop for PooledSamples<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}
