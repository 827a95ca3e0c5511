//! Long-running extraction service
//!
//! Watches the inbox directory for recordings, runs each through a
//! [`Session`], and keeps the eviction sweep going until Ctrl-C.

use crate::audio::{AudioProcessor, OpusCodecFactory};
use crate::config::Config;
use crate::enrich::{FaceitClient, MatchEnricher};
use crate::extract::Extractor;
use crate::lifecycle::Lifecycle;
use crate::metadata::MetadataStore;
use crate::session::Session;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Build the shared session from configuration
pub fn build_session(config: &Config) -> Result<Arc<Session>, Box<dyn std::error::Error + Send + Sync>> {
    let lifecycle = Arc::new(Lifecycle::new(MetadataStore::new(&config.output_dir), config.ttl));
    let extractor = Arc::new(Extractor::new(
        Arc::new(OpusCodecFactory),
        config.max_workers,
        config.gap_policy,
    ));

    let enricher: Option<Arc<dyn MatchEnricher>> = if config.enrich {
        Some(Arc::new(FaceitClient::new(config.faceit_api_key.clone())?))
    } else {
        None
    };

    Ok(Arc::new(Session::new(lifecycle, extractor, enricher)))
}

/// Prepare directories and the run registry
pub fn prepare(config: &Config, session: &Session) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    fs::create_dir_all(&config.inbox_dir)?;
    fs::create_dir_all(&config.output_dir)?;

    if config.clean_on_start {
        let report = AudioProcessor::clear_dir(&config.output_dir)?;
        if report.removed > 0 {
            info!("Cleaned up {} existing files from {:?}", report.removed, config.output_dir);
        }
    } else {
        session.lifecycle().restore()?;
    }
    Ok(())
}

/// Recordings in `dir` that have not been picked up yet, oldest name first
fn pending_recordings(dir: &Path, seen: &HashSet<PathBuf>) -> std::io::Result<Vec<PathBuf>> {
    let mut pending = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        if !hidden && !seen.contains(&path) {
            pending.push(path);
        }
    }
    pending.sort();
    Ok(pending)
}

/// Process one inbox pass; returns the number of recordings handled
pub async fn poll_inbox(session: &Arc<Session>, inbox: &Path, seen: &mut HashSet<PathBuf>) -> usize {
    let pending = match pending_recordings(inbox, seen) {
        Ok(p) => p,
        Err(e) => {
            warn!("Could not read inbox {:?}: {}", inbox, e);
            return 0;
        }
    };

    for path in &pending {
        seen.insert(path.clone());
        debug!("Picked up {:?}", path);

        match session.clone().ingest(path.clone()).await {
            Ok(registration) => info!("{:?} -> {}", path, registration.run_id()),
            Err(e) => error!("Failed to process {:?}: {}", path, e),
        }

        // Recordings never outlive their run.
        match fs::remove_file(path) {
            Ok(()) => {
                seen.remove(path);
            }
            Err(e) => warn!("Failed to remove consumed recording {:?}: {}", path, e),
        }
    }
    pending.len()
}

/// Run the service until Ctrl-C
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let session = build_session(&config)?;
    prepare(&config, &session)?;

    let sweeper = session.lifecycle().clone().spawn_sweeper(config.sweep_interval);

    let inbox = config.inbox_dir.clone();
    let poll_interval = config.poll_interval;
    let poller_session = session.clone();
    let poller = tokio::spawn(async move {
        let mut seen = HashSet::new();
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            poll_inbox(&poller_session, &inbox, &mut seen).await;
        }
    });

    info!(
        "Watching {:?} (output {:?}, TTL {:?}, {} workers, {:?} gap policy)",
        config.inbox_dir, config.output_dir, config.ttl, config.max_workers, config.gap_policy
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    poller.abort();
    sweeper.abort();

    Ok(())
}
