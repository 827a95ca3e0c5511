//! Run metadata persistence
//!
//! One JSON record per run (`<run_id>.json`) next to the run's artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Empty run ID")]
    EmptyRunId,
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Processing)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One speaker's artifact within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub speaker_id: String,
    pub audio_file: String,
    /// Human-readable length, e.g. "1m 23s".
    pub audio_length: String,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elo: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
}

/// Persisted state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub filename: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the run finished and its artifacts were registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub players: Vec<PlayerRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_log: Option<String>,
    #[serde(default)]
    pub failed_speakers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(run_id: String, filename: String, match_id: Option<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            filename,
            status: RunStatus::Processing,
            match_id,
            created_at,
            completed_at: None,
            players: Vec::new(),
            chat_log: None,
            failed_speakers: 0,
            error: None,
        }
    }

    /// Artifact file names owned by this run, chat log included.
    pub fn files(&self) -> Vec<String> {
        self.players
            .iter()
            .map(|p| p.audio_file.clone())
            .chain(self.chat_log.clone())
            .collect()
    }

    pub fn player(&self, speaker_id: &str) -> Option<&PlayerRecord> {
        self.players.iter().find(|p| p.speaker_id == speaker_id)
    }

    pub fn player_mut(&mut self, speaker_id: &str) -> Option<&mut PlayerRecord> {
        self.players.iter_mut().find(|p| p.speaker_id == speaker_id)
    }
}

/// Directory of run records
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    /// Write (or overwrite) a run record
    pub fn save(&self, record: &RunRecord) -> Result<(), MetadataError> {
        if record.run_id.is_empty() {
            return Err(MetadataError::EmptyRunId);
        }
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(self.path_for(&record.run_id), bytes)?;
        debug!("Saved metadata for {} ({})", record.run_id, record.status);
        Ok(())
    }

    /// Load a run record
    pub fn load(&self, run_id: &str) -> Result<RunRecord, MetadataError> {
        if run_id.is_empty() {
            return Err(MetadataError::EmptyRunId);
        }
        let bytes = fs::read(self.path_for(run_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Delete a run record; returns false if it was already gone
    pub fn delete(&self, run_id: &str) -> Result<bool, MetadataError> {
        match fs::remove_file(self.path_for(run_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable run record in the directory, oldest first
    ///
    /// Unparsable JSON files are skipped.
    pub fn list(&self) -> Result<Vec<RunRecord>, MetadataError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(run_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(run_id) {
                Ok(record) => records.push(record),
                Err(e) => debug!("Skipping unreadable metadata {:?}: {}", path, e),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

const RECORDING_SUFFIXES: [&str; 5] = [".dem.zst", ".jsonl.zst", ".dem", ".jsonl", ".zst"];

/// Derive the match identifier from a recording's file name.
///
/// Match ids look like `1-51dcaf59-f8aa-4df1-b20e-168f4b590c52`: a prefix and
/// a UUID, six dash-separated parts. Anything after the sixth part (round or
/// part suffixes) is ignored. Names with fewer parts have no match id.
pub fn extract_match_id(filename: &str) -> Option<String> {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(filename);
    let stem = RECORDING_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .unwrap_or(name);

    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() >= 6 && parts[..6].iter().all(|p| !p.is_empty()) {
        Some(parts[..6].join("-"))
    } else {
        None
    }
}
