//! Run registry with deduplication and TTL eviction
//!
//! Every accepted recording gets a run record before decoding starts. Runs
//! for the same match registered within the TTL resolve to one run. Finished
//! runs stop being visible once the TTL has elapsed since they finished, and a
//! periodic sweep deletes their files and metadata.
//!
//! All registry reads and writes go through one mutex. Decoding never holds
//! it, and neither does the file deletion half of a sweep.

use crate::audio::processor::AudioProcessor;
use crate::metadata::{extract_match_id, MetadataError, MetadataStore, PlayerRecord, RunRecord, RunStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("Unknown run: {0}")]
    UnknownRun(String),
    #[error("Run {run_id} is already {status}")]
    AlreadyFinished { run_id: String, status: RunStatus },
}

/// Outcome of registering a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// A new run was created and must be processed by the caller.
    Created(String),
    /// A live run for the same match already exists.
    Existing(String),
}

impl Registration {
    pub fn run_id(&self) -> &str {
        match self {
            Registration::Created(id) | Registration::Existing(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

/// Totals from one eviction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub runs: usize,
    pub files_removed: usize,
    pub files_failed: usize,
    pub metadata_removed: usize,
}

#[derive(Default)]
struct Registry {
    runs: HashMap<String, RunRecord>,
    /// Match id to the most recent run registered for it.
    by_match: HashMap<String, String>,
}

/// Owner of all run records
pub struct Lifecycle {
    registry: Mutex<Registry>,
    store: MetadataStore,
    ttl: Duration,
}

impl Lifecycle {
    pub fn new(store: MetadataStore, ttl: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            store,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    fn older_than_ttl(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - since)
            .to_std()
            .map(|age| age > self.ttl)
            .unwrap_or(false)
    }

    /// Whether `record`'s artifacts are past their TTL at `now`
    ///
    /// Age counts from when the run finished. Runs still processing never
    /// expire.
    fn is_expired(&self, record: &RunRecord, now: DateTime<Utc>) -> bool {
        if record.status == RunStatus::Processing {
            return false;
        }
        self.older_than_ttl(record.completed_at.unwrap_or(record.created_at), now)
    }

    /// Whether `record` still answers for its match at `now`
    ///
    /// Age counts from registration, whatever the status. Failed runs never do.
    fn covers_match(&self, record: &RunRecord, now: DateTime<Utc>) -> bool {
        record.status != RunStatus::Failed && !self.older_than_ttl(record.created_at, now)
    }

    /// Register a recording, or find the live run already covering its match
    pub fn register(&self, filename: &str) -> Result<Registration, LifecycleError> {
        self.register_at(filename, Utc::now())
    }

    pub fn register_at(&self, filename: &str, now: DateTime<Utc>) -> Result<Registration, LifecycleError> {
        let match_id = extract_match_id(filename);
        let mut registry = self.registry.lock();

        if let Some(match_id) = &match_id {
            let existing = registry
                .by_match
                .get(match_id)
                .and_then(|run_id| registry.runs.get(run_id))
                .filter(|r| self.covers_match(r, now));
            if let Some(record) = existing {
                info!(
                    "Match {} already handled by {} ({}), skipping {}",
                    match_id, record.run_id, record.status, filename
                );
                return Ok(Registration::Existing(record.run_id.clone()));
            }
        }

        let run_id = new_run_id();
        let record = RunRecord::new(run_id.clone(), filename.to_string(), match_id.clone(), now);
        self.store.save(&record)?;

        if let Some(match_id) = match_id {
            registry.by_match.insert(match_id, run_id.clone());
        }
        registry.runs.insert(run_id.clone(), record);

        info!("Registered run {} for {}", run_id, filename);
        Ok(Registration::Created(run_id))
    }

    /// Mark a run completed with its artifacts
    pub fn complete(
        &self,
        run_id: &str,
        players: Vec<PlayerRecord>,
        chat_log: Option<String>,
        failed_speakers: usize,
    ) -> Result<RunRecord, LifecycleError> {
        self.complete_at(run_id, players, chat_log, failed_speakers, Utc::now())
    }

    pub fn complete_at(
        &self,
        run_id: &str,
        players: Vec<PlayerRecord>,
        chat_log: Option<String>,
        failed_speakers: usize,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, LifecycleError> {
        self.finish(run_id, now, |record| {
            record.status = RunStatus::Completed;
            record.players = players;
            record.chat_log = chat_log;
            record.failed_speakers = failed_speakers;
        })
    }

    /// Mark a run failed
    pub fn fail(&self, run_id: &str, error: impl Into<String>) -> Result<RunRecord, LifecycleError> {
        self.fail_at(run_id, error, Utc::now())
    }

    pub fn fail_at(
        &self,
        run_id: &str,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, LifecycleError> {
        let error = error.into();
        self.finish(run_id, now, |record| {
            record.status = RunStatus::Failed;
            record.error = Some(error);
        })
    }

    fn finish(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut RunRecord),
    ) -> Result<RunRecord, LifecycleError> {
        let mut registry = self.registry.lock();
        let record = registry
            .runs
            .get_mut(run_id)
            .ok_or_else(|| LifecycleError::UnknownRun(run_id.to_string()))?;

        if record.status.is_terminal() {
            return Err(LifecycleError::AlreadyFinished {
                run_id: run_id.to_string(),
                status: record.status,
            });
        }

        apply(record);
        record.completed_at = Some(now);
        info!("Run {} is now {}", run_id, record.status);
        self.store.save(record)?;
        Ok(record.clone())
    }

    /// Edit a run's annotations (names, teams) without touching its status
    pub fn annotate(&self, run_id: &str, apply: impl FnOnce(&mut RunRecord)) -> Result<RunRecord, LifecycleError> {
        let mut registry = self.registry.lock();
        let record = registry
            .runs
            .get_mut(run_id)
            .ok_or_else(|| LifecycleError::UnknownRun(run_id.to_string()))?;

        let (status, created_at, completed_at) = (record.status, record.created_at, record.completed_at);
        apply(record);
        record.status = status;
        record.created_at = created_at;
        record.completed_at = completed_at;
        self.store.save(record)?;
        Ok(record.clone())
    }

    /// Current state of a run, unless it has expired
    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.get_at(run_id, Utc::now())
    }

    pub fn get_at(&self, run_id: &str, now: DateTime<Utc>) -> Option<RunRecord> {
        let registry = self.registry.lock();
        registry
            .runs
            .get(run_id)
            .filter(|r| !self.is_expired(r, now))
            .cloned()
    }

    /// Path of a file belonging to a visible run
    ///
    /// The file itself may already be gone; callers must handle that.
    pub fn artifact_path(&self, run_id: &str, file_name: &str) -> Option<PathBuf> {
        let record = self.get(run_id)?;
        record
            .files()
            .iter()
            .any(|f| f == file_name)
            .then(|| self.store.dir().join(file_name))
    }

    /// Visible runs, oldest first
    pub fn runs(&self) -> Vec<RunRecord> {
        let now = Utc::now();
        let registry = self.registry.lock();
        let mut runs: Vec<RunRecord> = registry
            .runs
            .values()
            .filter(|r| !self.is_expired(r, now))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    pub fn len(&self) -> usize {
        self.registry.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adopt run records left in the store by a previous process
    ///
    /// Runs that were still processing can never finish now, so they are
    /// marked failed.
    pub fn restore(&self) -> Result<usize, LifecycleError> {
        let now = Utc::now();
        let records = self.store.list()?;
        let mut registry = self.registry.lock();
        let mut restored = 0;

        for mut record in records {
            if registry.runs.contains_key(&record.run_id) {
                continue;
            }
            if record.status == RunStatus::Processing {
                record.status = RunStatus::Failed;
                record.error = Some("interrupted by restart".to_string());
                record.completed_at = Some(now);
                self.store.save(&record)?;
            }
            if let Some(match_id) = &record.match_id {
                registry.by_match.insert(match_id.clone(), record.run_id.clone());
            }
            registry.runs.insert(record.run_id.clone(), record);
            restored += 1;
        }

        if restored > 0 {
            info!("Restored {} runs from {:?}", restored, self.store.dir());
        }
        Ok(restored)
    }

    /// Evict every expired run
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut files = Vec::new();

        {
            let mut registry = self.registry.lock();
            let expired: Vec<String> = registry
                .runs
                .values()
                .filter(|r| self.is_expired(r, now))
                .map(|r| r.run_id.clone())
                .collect();

            for run_id in expired {
                let Some(record) = registry.runs.remove(&run_id) else {
                    continue;
                };
                if let Some(match_id) = &record.match_id {
                    if registry.by_match.get(match_id) == Some(&run_id) {
                        registry.by_match.remove(match_id);
                    }
                }

                match self.store.delete(&run_id) {
                    Ok(true) => report.metadata_removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to delete metadata for {}: {}", run_id, e),
                }

                files.extend(record.files().into_iter().map(|f| self.store.dir().join(f)));
                debug!(
                    "Evicting run {} (created {}, finished {:?})",
                    run_id, record.created_at, record.completed_at
                );
                report.runs += 1;
            }
        }

        if report.runs == 0 {
            return report;
        }

        let cleanup = AudioProcessor::cleanup_files(&files);
        report.files_removed = cleanup.removed;
        report.files_failed = cleanup.failed;

        info!(
            "Evicted {} runs ({} files removed, {} failed)",
            report.runs, report.files_removed, report.files_failed
        );
        report
    }

    /// Run [`Lifecycle::sweep`] every `interval` until the task is aborted
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let lifecycle = self.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || lifecycle.sweep()).await {
                    warn!("Sweep task failed: {}", e);
                }
            }
        })
    }
}

fn new_run_id() -> String {
    format!("run_{}", Uuid::new_v4().simple())
}
