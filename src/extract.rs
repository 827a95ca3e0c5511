//! Extraction pipeline
//!
//! Turns the frozen per-speaker chunk buffers of one run into one WAV file per
//! speaker. Speakers are decoded in parallel on a bounded pool of scoped
//! threads pulling from a crossbeam queue; a failing speaker is reported and
//! never takes its siblings down with it.

use crate::audio::codec::{CodecError, CodecFactory, WireFormat};
use crate::audio::frame::{FrameDecoder, FrameError, FrameStats, GapPolicy};
use crate::audio::processor::{AudioProcessor, ProcessorError, SamplePool};
use crate::audio::recorder::SpeakerBuffer;
use crate::feed::SpeakerId;
use crossbeam_channel::bounded;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Frame error in chunk {chunk}: {source}")]
    Frame { chunk: usize, source: FrameError },
    #[error("Storage error: {0}")]
    Storage(#[from] ProcessorError),
    #[error("Decode job panicked: {0}")]
    Panicked(String),
}

/// One decoded speaker written to disk.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub speaker_id: SpeakerId,
    pub path: PathBuf,
    pub file_name: String,
    pub samples: usize,
    pub sample_rate: u32,
    pub stats: FrameStats,
}

impl Artifact {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples as f64 / f64::from(self.sample_rate)
    }
}

/// A speaker whose job was aborted.
#[derive(Debug)]
pub struct SpeakerFailure {
    pub speaker_id: SpeakerId,
    pub error: ExtractError,
}

/// Outcome of one pipeline invocation.
#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub artifacts: Vec<Artifact>,
    pub failures: Vec<SpeakerFailure>,
    /// Speakers with no usable chunk.
    pub skipped: usize,
    pub workers: usize,
    pub chunks: usize,
    pub elapsed: Duration,
}

impl ExtractionReport {
    pub fn artifact_for(&self, speaker: &SpeakerId) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| &a.speaker_id == speaker)
    }
}

/// Number of workers for `speakers` jobs on a machine with `available` units.
///
/// Never more workers than jobs, never zero.
pub fn worker_count(available: usize, speakers: usize) -> usize {
    if speakers > 0 && speakers < available {
        speakers
    } else {
        available.max(1)
    }
}

/// File name of a speaker's artifact within a run.
pub fn artifact_file_name(speaker: &SpeakerId, run_id: &str) -> String {
    format!("{}_{}.wav", speaker, run_id)
}

/// Parallel per-speaker decoder
pub struct Extractor {
    codecs: Arc<dyn CodecFactory>,
    pool: SamplePool,
    max_workers: usize,
    gap_policy: GapPolicy,
}

impl Extractor {
    pub fn new(codecs: Arc<dyn CodecFactory>, max_workers: usize, gap_policy: GapPolicy) -> Self {
        Self {
            codecs,
            pool: SamplePool::default(),
            max_workers: max_workers.max(1),
            gap_policy,
        }
    }

    /// Decode every speaker with data and write its artifact into `output_dir`.
    ///
    /// Blocks until all jobs are done. Per-speaker errors land in
    /// [`ExtractionReport::failures`].
    pub fn extract(&self, run_id: &str, buffers: &[SpeakerBuffer], output_dir: &Path) -> ExtractionReport {
        let started = Instant::now();
        let jobs: Vec<&SpeakerBuffer> = buffers
            .iter()
            .filter(|b| b.chunks().iter().any(|c| !c.data.is_empty()))
            .collect();

        let mut report = ExtractionReport {
            skipped: buffers.len() - jobs.len(),
            chunks: jobs.iter().map(|b| b.len()).sum(),
            ..Default::default()
        };

        if jobs.is_empty() {
            info!("[{}] No voice data to extract", run_id);
            report.elapsed = started.elapsed();
            return report;
        }

        let workers = worker_count(self.max_workers, jobs.len());
        report.workers = workers;
        info!(
            "[{}] Processing {} speakers ({} chunks) with {} workers",
            run_id,
            jobs.len(),
            report.chunks,
            workers
        );

        let (job_tx, job_rx) = bounded::<&SpeakerBuffer>(jobs.len());
        let (result_tx, result_rx) = bounded(jobs.len());

        thread::scope(|scope| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for buffer in job_rx.iter() {
                        debug!("[{}] Worker {} picked speaker {}", run_id, worker, buffer.speaker_id);
                        let outcome = self.run_isolated(run_id, buffer, output_dir);
                        if result_tx.send((buffer.speaker_id.clone(), outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for job in jobs {
                // Capacity equals the job count, so this never blocks.
                if job_tx.send(job).is_err() {
                    break;
                }
            }
            drop(job_tx);
        });

        for (speaker_id, outcome) in result_rx.iter() {
            match outcome {
                Ok(artifact) => report.artifacts.push(artifact),
                Err(error) => {
                    warn!("[{}] Speaker {} failed: {}", run_id, speaker_id, error);
                    report.failures.push(SpeakerFailure { speaker_id, error });
                }
            }
        }
        report.artifacts.sort_by(|a, b| a.speaker_id.cmp(&b.speaker_id));
        report.elapsed = started.elapsed();

        info!(
            "[{}] Extracted {} artifacts ({} failed) in {:.2?}",
            run_id,
            report.artifacts.len(),
            report.failures.len(),
            report.elapsed
        );
        report
    }

    fn run_isolated(&self, run_id: &str, buffer: &SpeakerBuffer, output_dir: &Path) -> Result<Artifact, ExtractError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.run_job(run_id, buffer, output_dir))).unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            error!("[{}] Decode job for {} panicked: {}", run_id, buffer.speaker_id, message);
            Err(ExtractError::Panicked(message))
        })
    }

    fn run_job(&self, run_id: &str, buffer: &SpeakerBuffer, output_dir: &Path) -> Result<Artifact, ExtractError> {
        let mut pcm = self.pool.acquire();
        let stats = self.decode_speaker(buffer, &mut pcm)?;

        let file_name = artifact_file_name(&buffer.speaker_id, run_id);
        let path = output_dir.join(&file_name);
        let info = AudioProcessor::write_wav(&path, buffer.format.sample_rate(), &pcm)?;

        debug!(
            "[{}] Speaker {}: {} decoded, {} concealed, {} stale, {}",
            run_id,
            buffer.speaker_id,
            stats.decoded,
            stats.concealed,
            stats.discarded,
            AudioProcessor::format_duration(info.duration_secs())
        );

        Ok(Artifact {
            speaker_id: buffer.speaker_id.clone(),
            path,
            file_name,
            samples: info.samples,
            sample_rate: info.sample_rate,
            stats,
        })
    }

    /// Decode one speaker's chunks, in arrival order, into `out`.
    pub fn decode_speaker(&self, buffer: &SpeakerBuffer, out: &mut Vec<i32>) -> Result<FrameStats, ExtractError> {
        let mut codec = self.codecs.create(buffer.format)?;

        match buffer.format {
            WireFormat::Chunked => {
                let mut decoder = FrameDecoder::new(self.gap_policy);
                for (idx, chunk) in buffer.chunks().iter().enumerate() {
                    decoder
                        .decode_chunk(&chunk.data, codec.as_mut(), out)
                        .map_err(|source| ExtractError::Frame { chunk: idx, source })?;
                }
                Ok(decoder.stats())
            }
            WireFormat::Unchunked => {
                let mut stats = FrameStats::default();
                for chunk in buffer.chunks() {
                    if chunk.data.is_empty() {
                        continue;
                    }
                    codec.decode_frame(&chunk.data, out)?;
                    stats.decoded += 1;
                }
                Ok(stats)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
