//! Standalone embedding worker binary (C7), spawned by the sync
//! orchestrator after a sync leaves pending (zero-vector) message rows
//! (§4.4 Phase 7, §4.5).
//!
//! Writes its own PID to `worker.pid` on start so the orchestrator can
//! `SIGTERM` it before a bulk delete, and removes that file on every exit
//! path, clean or cancelled.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dex::config::Config;
use dex::embed::{self, EmbeddingClient};
use dex::error::DexError;
use dex::store::Store;

fn data_dir() -> PathBuf {
    std::env::var("DEX_DATA_DIR")
        .map(PathBuf::from)
        .ok()
        .or_else(dex::paths::data_dir)
        .expect("could not determine data directory")
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("worker failed: {e}");
            std::process::ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), DexError> {
    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let config = Config::load();
    let endpoint_url = std::env::var("DEX_EMBEDDING_ENDPOINT")
        .ok()
        .or_else(|| config.embedding.endpoint_url.clone())
        .ok_or_else(|| DexError::EmbeddingUnavailable("no embedding endpoint configured".to_string()))?;
    let model = config.embedding.model.clone().unwrap_or_else(|| "text-embedding-3-small".to_string());

    let pid_path = data_dir.join("worker.pid");
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let cancel = Arc::new(AtomicBool::new(false));
    let sigterm_cancel = Arc::clone(&cancel);
    tokio::spawn(async move {
        if let Ok(mut signal) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            signal.recv().await;
            sigterm_cancel.store(true, Ordering::Relaxed);
        }
    });

    let store = Store::open(&data_dir.join("dex.db"))?;
    let client = EmbeddingClient::new(endpoint_url, model);
    let progress_path = data_dir.join("worker-progress.json");

    let result = embed::run_worker(
        &store,
        &client,
        config.embedding.batch_size as usize,
        config.embedding.concurrency as usize,
        &progress_path,
        cancel,
    )
    .await;

    let _ = std::fs::remove_file(&pid_path);
    result
}
