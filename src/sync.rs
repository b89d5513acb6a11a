//! Sync orchestrator (C6): the nine-phase pipeline that detects installed
//! tools, discovers their conversation stores, extracts and normalizes
//! records, writes them to the store, rebuilds the FTS index, and kicks off
//! the embedding worker and (optionally) the enrichment driver (§4.4).
//!
//! # Architecture overview
//!
//! One sync run owns the process-wide advisory lock (`store::acquire_sync_lock`)
//! for its whole lifetime, so two `dex sync` invocations never interleave
//! writes. Detection and discovery fan out across all three adapters
//! concurrently; extraction runs each location's blocking vendor-format
//! parser on a `spawn_blocking` thread with bounded concurrency, keeping
//! blocking file-system work off the async runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::adapters::{self, NormalizedConversation, SourceAdapter, SourceLocation};
use crate::config::Config;
use crate::embed::EmbeddingClient;
use crate::enrich;
use crate::error::{DexError, Result};
use crate::model::{Source, SyncState};
use crate::repo;
use crate::store::{self, Store};

const EXTRACTION_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Re-extract and re-insert every conversation regardless of mtime
    /// (§4.4 Phase 3 "Incremental vs. force").
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Detecting,
    Discovering,
    Extracting,
    Indexing,
    Enriching,
    Done,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct SyncProgress {
    pub phase: Option<Phase>,
    pub projects_found: usize,
    pub projects_processed: usize,
    pub conversations_found: usize,
    pub conversations_indexed: usize,
    pub messages_indexed: usize,
    pub extraction_completed: usize,
    pub extraction_total: usize,
    pub current_source: Option<Source>,
    pub error: Option<String>,
}

impl SyncProgress {
    fn with_phase(phase: Phase) -> Self {
        Self { phase: Some(phase), ..Default::default() }
    }
}

pub type SyncProgressCb<'a> = Box<dyn FnMut(&SyncProgress) + Send + 'a>;

/// Runs one full sync pass. Returns the final progress snapshot (phase
/// `Done` on success); the lock is released on every exit path, including
/// early returns on error.
pub async fn sync(
    store: &Store,
    data_dir: &Path,
    config: &Config,
    options: SyncOptions,
    mut progress_cb: SyncProgressCb<'_>,
) -> Result<SyncProgress> {
    let lock_path = data_dir.join("sync.lock");
    let Some(lock_file) = store::acquire_sync_lock(&lock_path)? else {
        return Err(DexError::StoreBusy);
    };

    let result = run_phases(store, data_dir, config, options, &mut progress_cb).await;

    store::release_sync_lock(lock_file);

    match result {
        Ok(progress) => Ok(progress),
        Err(e) => {
            let mut progress = SyncProgress::with_phase(Phase::Error);
            progress.error = Some(e.to_string());
            progress_cb(&progress);
            Err(e)
        }
    }
}

async fn run_phases(
    store: &Store,
    data_dir: &Path,
    config: &Config,
    options: SyncOptions,
    progress_cb: &mut SyncProgressCb<'_>,
) -> Result<SyncProgress> {
    let mut progress = SyncProgress::with_phase(Phase::Detecting);
    progress_cb(&progress);

    let adapters: Vec<Arc<dyn SourceAdapter>> = adapters::all_adapters().into_iter().map(Arc::from).collect();
    let detected: Vec<Arc<dyn SourceAdapter>> = adapters.into_iter().filter(|a| a.detect()).collect();

    progress.phase = Some(Phase::Discovering);
    progress_cb(&progress);

    let mut locations: Vec<(Arc<dyn SourceAdapter>, SourceLocation)> = Vec::new();
    for adapter in &detected {
        for location in adapter.discover() {
            locations.push((Arc::clone(adapter), location));
        }
    }
    progress.projects_found = locations.len();
    progress_cb(&progress);

    // Drop locations that haven't changed since the last sync, unless
    // `--force` was requested (§4.4 Phase 3).
    let mut work: Vec<(Arc<dyn SourceAdapter>, SourceLocation)> = Vec::new();
    for (adapter, location) in locations {
        if options.force {
            work.push((adapter, location));
            continue;
        }
        let prior = repo::find_sync_state(
            store.connection(),
            location.source,
            &location.vendor_db_path.to_string_lossy(),
        )?;
        match prior {
            Some(state) if state.last_mtime >= location.mtime => {}
            _ => work.push((adapter, location)),
        }
    }

    progress.phase = Some(Phase::Extracting);
    progress.extraction_total = work.len();
    progress_cb(&progress);

    let projects_processed = work.len();
    let normalized: Vec<NormalizedConversation> = extract_all(work.clone(), progress, progress_cb).await?;

    progress = SyncProgress::with_phase(Phase::Indexing);
    progress.projects_processed = projects_processed;
    progress.conversations_found = normalized.len();
    progress_cb(&progress);

    // A conversation with zero messages never reaches the store (§4.1).
    let normalized: Vec<NormalizedConversation> =
        normalized.into_iter().filter(|nc| !nc.messages.is_empty()).collect();

    let incoming_ids: Vec<String> = normalized.iter().map(|nc| nc.conversation.id.clone()).collect();
    let existing_ids = repo::get_existing_conversation_ids(store.connection(), &incoming_ids)?;

    let to_replace: Vec<String> = if options.force {
        incoming_ids.iter().filter(|id| existing_ids.contains(*id)).cloned().collect()
    } else {
        Vec::new()
    };

    if !to_replace.is_empty() {
        kill_running_worker(data_dir);
        repo::delete_conversations(store.connection(), &to_replace)?;
    }

    let mut messages_indexed = 0usize;
    for nc in &normalized {
        if !options.force && existing_ids.contains(&nc.conversation.id) {
            continue;
        }
        messages_indexed += nc.messages.len();
        repo::insert_normalized_conversation(store.connection(), nc)?;
    }

    for (_, location) in &work {
        let state = SyncState {
            source: location.source,
            vendor_db_path: location.vendor_db_path.to_string_lossy().to_string(),
            workspace_path: location.workspace_path.clone(),
            last_synced_at: chrono::Utc::now(),
            last_mtime: location.mtime,
        };
        repo::upsert_sync_state(store.connection(), &state)?;
    }

    if messages_indexed > 0 {
        store.rebuild_fts()?;
    }

    progress.conversations_indexed = normalized.len();
    progress.messages_indexed = messages_indexed;
    progress_cb(&progress);

    let pending = store.pending_embedding_ids()?;
    if !pending.is_empty() {
        spawn_embed_worker(data_dir, config);
    }

    if config.enrichment.enabled {
        progress.phase = Some(Phase::Enriching);
        progress_cb(&progress);

        let providers = enrich::providers_from_priority(&config.enrichment.provider_priority);
        let _ = enrich::run(store, &config.enrichment, &providers, Box::new(|_| {})).await?;
    }

    progress.phase = Some(Phase::Done);
    progress_cb(&progress);
    Ok(progress)
}

/// Runs every location's `extract` on a blocking thread, `EXTRACTION_CONCURRENCY`
/// at a time, then normalizes each raw record on the calling task (pure, so no
/// need for a second thread hop). Per-location extraction failures are logged
/// and skipped rather than aborting the whole sync (§4.4 Phase 3, §7).
async fn extract_all(
    work: Vec<(Arc<dyn SourceAdapter>, SourceLocation)>,
    mut progress: SyncProgress,
    progress_cb: &mut SyncProgressCb<'_>,
) -> Result<Vec<NormalizedConversation>> {
    let mut stream = stream::iter(work.into_iter().map(|(adapter, location)| {
        tokio::task::spawn_blocking(move || {
            let source = location.source;
            let result = adapter.extract(&location, Box::new(|_, _| {}));
            (adapter, location, source, result)
        })
    }))
    .buffer_unordered(EXTRACTION_CONCURRENCY);

    let mut normalized = Vec::new();
    while let Some(joined) = stream.next().await {
        let (adapter, location, source, result) = match joined {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("extraction task panicked: {e}");
                continue;
            }
        };

        progress.extraction_completed += 1;
        progress.current_source = Some(source);
        progress_cb(&progress);

        let raw_conversations = match result {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("extraction failed for {}: {e}", location.vendor_db_path.display());
                continue;
            }
        };

        for raw in &raw_conversations {
            if let Some(nc) = adapter.normalize(raw) {
                normalized.push(nc);
            }
        }
    }

    Ok(normalized)
}

/// Reads the worker's PID file and sends it `SIGTERM`, then removes the
/// file. Best-effort: an absent or stale PID file is not an error, since the
/// worker may simply not be running (§4.4 Phase 4 "kill any running
/// embedding worker").
fn kill_running_worker(data_dir: &Path) {
    let pid_path = worker_pid_path(data_dir);
    let Ok(contents) = std::fs::read_to_string(&pid_path) else { return };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        let _ = std::fs::remove_file(&pid_path);
        return;
    };

    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill").args(["-TERM", &pid.to_string()]).status();
    }
    let _ = std::fs::remove_file(&pid_path);
}

/// Spawns `dex-embed-worker` as a detached, low-priority background
/// process. At most one worker is spawned per sync; the worker itself
/// decides whether there is anything left to do (§4.4 Phase 7, §5).
fn spawn_embed_worker(data_dir: &Path, config: &Config) {
    let Some(endpoint) = &config.embedding.endpoint_url else { return };
    let exe = match std::env::current_exe() {
        Ok(path) => path.with_file_name("dex-embed-worker"),
        Err(_) => PathBuf::from("dex-embed-worker"),
    };

    let mut command = std::process::Command::new(&exe);
    command.env("DEX_DATA_DIR", data_dir).env("DEX_EMBEDDING_ENDPOINT", endpoint);

    #[cfg(unix)]
    {
        let mut wrapped = std::process::Command::new("nice");
        wrapped.args(["-n", "19"]).arg(&exe).env("DEX_DATA_DIR", data_dir).env("DEX_EMBEDDING_ENDPOINT", endpoint);
        let _ = wrapped.spawn();
        return;
    }

    #[cfg(not(unix))]
    {
        let _ = command.spawn();
    }
}

fn worker_pid_path(data_dir: &Path) -> PathBuf {
    data_dir.join("worker.pid")
}

/// Builds an `EmbeddingClient` from config, or `None` when no endpoint is
/// configured — query-time embedding then silently falls back to FTS-only
/// (§4.7, §4.8).
pub fn embedding_client_from_config(config: &Config) -> Option<EmbeddingClient> {
    let endpoint = config.embedding.endpoint_url.clone()?;
    let model = config.embedding.model.clone().unwrap_or_else(|| "text-embedding-3-small".to_string());
    Some(EmbeddingClient::new(endpoint, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn sync_is_a_noop_with_no_detected_adapters_present_in_test_env() {
        // In the test sandbox none of Cursor/Codex/Claude Code are
        // installed, so `detect()` returns false for all adapters and the
        // run completes at `Done` with nothing indexed.
        let store = Store::open_in_memory().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let progress = sync(&store, data_dir.path(), &config, SyncOptions::default(), Box::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(progress.phase, Some(Phase::Done));
        assert_eq!(progress.conversations_indexed, 0);
    }

    #[tokio::test]
    async fn sync_returns_store_busy_when_lock_already_held() {
        let store = Store::open_in_memory().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let lock_path = data_dir.path().join("sync.lock");
        let held = store::acquire_sync_lock(&lock_path).unwrap().unwrap();

        let result = sync(&store, data_dir.path(), &config, SyncOptions::default(), Box::new(|_| {})).await;
        assert!(matches!(result, Err(DexError::StoreBusy)));

        store::release_sync_lock(held);
    }

    #[test]
    fn embedding_client_from_config_is_none_without_endpoint() {
        let config = Config::default();
        assert!(embedding_client_from_config(&config).is_none());
    }
}
