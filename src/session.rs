//! Run orchestration
//!
//! Drives one recording through the pipeline: register, scan the feed into
//! per-speaker buffers, extract, record the outcome, then enrich.

use crate::audio::recorder::{CapturedVoice, VoiceRecorder};
use crate::audio::AudioProcessor;
use crate::extract::{ExtractionReport, Extractor};
use crate::enrich::MatchEnricher;
use crate::feed::{CaptureFile, FeedEvent, RecordingFeed};
use crate::lifecycle::{Lifecycle, LifecycleError, Registration};
use crate::metadata::{PlayerRecord, RunRecord, RunStatus};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid recording path: {0}")]
    InvalidPath(PathBuf),
    #[error("Processing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// File name of a run's chat log.
pub fn chat_log_name(run_id: &str) -> String {
    format!("{}_chat.txt", run_id)
}

/// Coordinator shared by every run
pub struct Session {
    lifecycle: Arc<Lifecycle>,
    extractor: Arc<Extractor>,
    enricher: Option<Arc<dyn MatchEnricher>>,
    output_dir: PathBuf,
}

impl Session {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        extractor: Arc<Extractor>,
        enricher: Option<Arc<dyn MatchEnricher>>,
    ) -> Self {
        let output_dir = lifecycle.store().dir().to_path_buf();
        Self {
            lifecycle,
            extractor,
            enricher,
            output_dir,
        }
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Register a recording by file name
    pub fn accept(&self, filename: &str) -> Result<Registration, SessionError> {
        Ok(self.lifecycle.register(filename)?)
    }

    /// Scan, extract and finish a registered run
    ///
    /// A feed that cannot be read marks the run failed; the failed record is
    /// returned rather than an error.
    pub fn process(&self, run_id: &str, feed: &mut dyn RecordingFeed) -> Result<RunRecord, SessionError> {
        let started = Instant::now();

        let recorder = VoiceRecorder::new();
        let scanned = feed.scan(&mut |event| match event {
            FeedEvent::Voice(message) => recorder.add_voice(message),
            FeedEvent::Chat(line) => recorder.add_chat(line),
            FeedEvent::Roster(players) => recorder.set_roster(players),
        });

        if let Err(e) = scanned {
            error!("[{}] Could not read recording: {}", run_id, e);
            return Ok(self.lifecycle.fail(run_id, e.to_string())?);
        }

        let captured = recorder.finish();
        info!(
            "[{}] Scanned {} voice packets from {} speakers, {} chat lines",
            run_id,
            captured.packets,
            captured.buffers.len(),
            captured.chat.len()
        );

        let chat_log = self.write_chat_log(run_id, &captured);
        let report = self.extractor.extract(run_id, &captured.buffers, &self.output_dir);
        let players = player_records(&report, &captured);

        let record = self
            .lifecycle
            .complete(run_id, players, chat_log, report.failures.len())?;

        info!(
            "[{}] Finished in {:.2?}: {} artifacts, {} failed speakers",
            run_id,
            started.elapsed(),
            record.players.len(),
            record.failed_speakers
        );
        Ok(record)
    }

    fn write_chat_log(&self, run_id: &str, captured: &CapturedVoice) -> Option<String> {
        if captured.chat.is_empty() {
            return None;
        }

        let name = chat_log_name(run_id);
        let mut body = String::new();
        for line in &captured.chat {
            body.push_str(&line.to_string());
            body.push('\n');
        }

        match fs::write(self.output_dir.join(&name), body) {
            Ok(()) => {
                debug!("[{}] Wrote {} chat lines", run_id, captured.chat.len());
                Some(name)
            }
            Err(e) => {
                warn!("[{}] Failed to write chat log: {}", run_id, e);
                None
            }
        }
    }

    /// Register and fully process a capture file
    ///
    /// Decoding runs on the blocking pool. Returns the registration so the
    /// caller can tell a fresh run from a duplicate.
    pub async fn ingest(self: Arc<Self>, path: PathBuf) -> Result<Registration, SessionError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| SessionError::InvalidPath(path.clone()))?;

        let registration = self.accept(&filename)?;
        let run_id = match &registration {
            Registration::Existing(id) => {
                info!("{} is a duplicate of run {}", filename, id);
                return Ok(registration);
            }
            Registration::Created(id) => id.clone(),
        };

        let session = self.clone();
        let blocking_id = run_id.clone();
        tokio::task::spawn_blocking(move || session.process(&blocking_id, &mut CaptureFile::new(path)))
            .await??;

        self.enrich(&run_id).await;
        Ok(registration)
    }

    /// Add player names and ratings from the enrichment service
    ///
    /// Returns the updated record, or `None` when nothing was changed.
    pub async fn enrich(&self, run_id: &str) -> Option<RunRecord> {
        let enricher = self.enricher.as_ref()?;
        let record = self.lifecycle.get(run_id)?;
        if record.status != RunStatus::Completed || record.players.is_empty() {
            return None;
        }
        let match_id = record.match_id.as_deref()?;

        let roster = match enricher.roster(match_id).await {
            Ok(roster) => roster,
            Err(e) => {
                warn!("[{}] Enrichment for match {} failed: {}", run_id, match_id, e);
                return None;
            }
        };

        let result = self.lifecycle.annotate(run_id, |record| {
            for entry in &roster {
                if let Some(player) = record.player_mut(&entry.speaker_id) {
                    player.nickname = Some(entry.nickname.clone());
                    player.elo = entry.elo;
                    player.level = entry.level;
                    player.team = Some(entry.team.clone());
                }
            }
        });

        match result {
            Ok(updated) => {
                info!("[{}] Enriched {} players from match {}", run_id, roster.len(), match_id);
                Some(updated)
            }
            Err(e) => {
                warn!("[{}] Could not store enrichment: {}", run_id, e);
                None
            }
        }
    }
}

fn player_records(report: &ExtractionReport, captured: &CapturedVoice) -> Vec<PlayerRecord> {
    let teams = captured.teams();
    let names: HashMap<&str, &str> = captured
        .roster
        .iter()
        .filter(|p| !p.name.is_empty())
        .map(|p| (p.speaker_id.as_str(), p.name.as_str()))
        .collect();

    report
        .artifacts
        .iter()
        .map(|artifact| {
            let duration = artifact.duration_secs();
            PlayerRecord {
                speaker_id: artifact.speaker_id.to_string(),
                audio_file: artifact.file_name.clone(),
                audio_length: AudioProcessor::format_duration(duration),
                duration_secs: duration,
                team: teams.get(&artifact.speaker_id).cloned(),
                nickname: names.get(artifact.speaker_id.as_str()).map(|n| n.to_string()),
                elo: None,
                level: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::testing::{MockCodecFactory, BLOCK};
    use crate::audio::codec::WireFormat;
    use crate::audio::frame::{encode_record, GapPolicy};
    use crate::enrich::{EnrichError, RosterEntry};
    use crate::feed::{ChatLine, MemoryFeed, Participant, SpeakerId, VoiceMessage};
    use crate::metadata::MetadataStore;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const MATCH_FILE: &str = "1-51dcaf59-f8aa-4df1-b20e-168f4b590c52-1-1.dem";

    fn session_with(policy: GapPolicy, enricher: Option<Arc<dyn MatchEnricher>>) -> (TempDir, Arc<Session>) {
        let temp = tempdir().unwrap();
        let lifecycle = Arc::new(Lifecycle::new(
            MetadataStore::new(temp.path()),
            Duration::from_secs(300),
        ));
        let extractor = Arc::new(Extractor::new(Arc::new(MockCodecFactory::default()), 4, policy));
        (temp, Arc::new(Session::new(lifecycle, extractor, enricher)))
    }

    fn voice(speaker: u64, data: Vec<u8>) -> FeedEvent {
        FeedEvent::Voice(VoiceMessage {
            speaker_id: SpeakerId::from(speaker),
            format: WireFormat::Chunked,
            data,
        })
    }

    fn frames(speaker: u64, indices: impl IntoIterator<Item = u16>) -> Vec<FeedEvent> {
        indices
            .into_iter()
            .map(|i| voice(speaker, encode_record(i, &[0x11, 0x22])))
            .collect()
    }

    fn roster(ids: &[(u64, u8)]) -> FeedEvent {
        FeedEvent::Roster(
            ids.iter()
                .map(|&(id, team)| Participant {
                    speaker_id: SpeakerId::from(id),
                    name: format!("p{}", id),
                    team,
                })
                .collect(),
        )
    }

    #[test]
    fn test_three_speaker_scenario() {
        let (_temp, session) = session_with(GapPolicy::Resync, None);
        let run_id = session.accept(MATCH_FILE).unwrap().run_id().to_string();

        // A: 100 sequential frames. B: 50 frames with frames 20..23 lost.
        // C: only an empty payload, which never becomes a chunk.
        let mut events = frames(1, 0..100);
        events.extend(frames(2, (0..20).chain(23..53)));
        events.push(voice(3, Vec::new()));
        events.push(roster(&[(1, 2), (2, 3), (3, 2)]));

        let record = session.process(&run_id, &mut MemoryFeed::new(events)).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.players.len(), 2);
        assert_eq!(record.failed_speakers, 0);

        let a = record.player("1").unwrap();
        assert!((a.duration_secs - (100 * BLOCK) as f64 / 24_000.0).abs() < 1e-9);
        assert_eq!(a.team.as_deref(), Some("Team 1"));
        assert_eq!(a.nickname.as_deref(), Some("p1"));

        let b = record.player("2").unwrap();
        assert!((b.duration_secs - (53 * BLOCK) as f64 / 24_000.0).abs() < 1e-9);
        assert_eq!(b.team.as_deref(), Some("Team 2"));
        assert!(record.player("3").is_none());

        let b_path = session.lifecycle().artifact_path(&run_id, &b.audio_file).unwrap();
        assert_eq!(AudioProcessor::wav_info(&b_path).unwrap().samples, 53 * BLOCK);
    }

    #[test]
    fn test_malformed_speaker_still_completes() {
        let (temp, session) = session_with(GapPolicy::Hold, None);
        let run_id = session.accept("scrim.dem").unwrap().run_id().to_string();

        let mut bad = Vec::new();
        bad.extend_from_slice(&9000i16.to_le_bytes());
        bad.extend_from_slice(&0u16.to_le_bytes());
        bad.resize(50, 0);

        let mut events = Vec::new();
        for speaker in 1..=5u64 {
            if speaker == 4 {
                events.push(voice(speaker, bad.clone()));
            } else {
                events.extend(frames(speaker, 0..10));
            }
        }

        let record = session.process(&run_id, &mut MemoryFeed::new(events)).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.players.len(), 4);
        assert_eq!(record.failed_speakers, 1);
        assert!(record.player("4").is_none());
        assert!(!temp.path().join(format!("4_{}.wav", run_id)).exists());
    }

    #[test]
    fn test_unreadable_recording_fails_run() {
        let (temp, session) = session_with(GapPolicy::Hold, None);
        let run_id = session.accept("broken.dem").unwrap().run_id().to_string();
        let path = temp.path().join("broken.jsonl");
        fs::write(&path, b"tiny").unwrap();

        let record = session.process(&run_id, &mut CaptureFile::new(&path)).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error.unwrap().contains("too small"));
        assert!(record.players.is_empty());
        assert_eq!(session.lifecycle().store().load(&run_id).unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn test_duplicate_accept_returns_existing_run() {
        let (_temp, session) = session_with(GapPolicy::Hold, None);
        let first = session.accept(MATCH_FILE).unwrap();
        let second = session.accept("1-51dcaf59-f8aa-4df1-b20e-168f4b590c52.dem.zst").unwrap();
        assert!(first.is_new());
        assert_eq!(second, Registration::Existing(first.run_id().to_string()));
    }

    #[test]
    fn test_chat_log_is_written_and_recorded() {
        let (temp, session) = session_with(GapPolicy::Hold, None);
        let run_id = session.accept("chat.dem").unwrap().run_id().to_string();
        let mut events = frames(1, 0..3);
        events.push(FeedEvent::Chat(ChatLine {
            time: "0m12s".to_string(),
            sender: Some("alice".to_string()),
            text: "rush b".to_string(),
        }));
        events.push(FeedEvent::Chat(ChatLine {
            time: "0m13s".to_string(),
            sender: None,
            text: "Round restarting".to_string(),
        }));

        let record = session.process(&run_id, &mut MemoryFeed::new(events)).unwrap();
        let chat = record.chat_log.clone().unwrap();
        assert_eq!(chat, chat_log_name(&run_id));
        let body = fs::read_to_string(temp.path().join(&chat)).unwrap();
        assert_eq!(body, "[0m12s] alice: rush b\n[0m13s] Console: Round restarting\n");
    }

    struct FixedEnricher {
        result: Result<Vec<RosterEntry>, ()>,
    }

    #[async_trait]
    impl MatchEnricher for FixedEnricher {
        async fn roster(&self, _match_id: &str) -> Result<Vec<RosterEntry>, EnrichError> {
            self.result
                .clone()
                .map_err(|_| EnrichError::Api("unavailable".to_string()))
        }
    }

    fn write_capture(dir: &Path, name: &str) -> PathBuf {
        let mut lines = Vec::new();
        for i in 0..20u16 {
            lines.push(format!(
                r#"{{"type":"voice","speaker_id":"76561198000000001","format":"chunked","data":"{}"}}"#,
                BASE64.encode(encode_record(i, &[1, 2, 3]))
            ));
        }
        let path = dir.join(name);
        fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    #[tokio::test]
    async fn test_ingest_processes_and_enriches() {
        let enricher = FixedEnricher {
            result: Ok(vec![RosterEntry {
                speaker_id: "76561198000000001".to_string(),
                nickname: "alice".to_string(),
                elo: Some(2100),
                level: Some(10),
                team: "Team 1".to_string(),
            }]),
        };
        let (temp, session) = session_with(GapPolicy::Hold, Some(Arc::new(enricher)));
        let inbox = tempdir().unwrap();
        let path = write_capture(inbox.path(), "1-51dcaf59-f8aa-4df1-b20e-168f4b590c52.jsonl");

        let registration = session.clone().ingest(path.clone()).await.unwrap();
        assert!(registration.is_new());

        let record = session.lifecycle().get(registration.run_id()).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        let player = record.player("76561198000000001").unwrap();
        assert_eq!(player.nickname.as_deref(), Some("alice"));
        assert_eq!(player.elo, Some(2100));
        assert!(temp.path().join(&player.audio_file).exists());

        let again = session.clone().ingest(path).await.unwrap();
        assert_eq!(again, Registration::Existing(registration.run_id().to_string()));
    }

    #[tokio::test]
    async fn test_enrichment_failure_keeps_status() {
        let enricher = FixedEnricher { result: Err(()) };
        let (_temp, session) = session_with(GapPolicy::Hold, Some(Arc::new(enricher)));
        let inbox = tempdir().unwrap();
        let path = write_capture(inbox.path(), "1-51dcaf59-f8aa-4df1-b20e-168f4b590c52.jsonl");

        let registration = session.clone().ingest(path).await.unwrap();
        let record = session.lifecycle().get(registration.run_id()).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.players[0].nickname.is_none());
        assert!(session.enrich(registration.run_id()).await.is_none());
    }
}
