//! Embedding worker (C7): shared batching/HTTP logic used by both the
//! standalone `dex-embed-worker` binary and query-time embedding (§4.5,
//! §4.7).
//!
//! # Architecture overview
//!
//! `EmbeddingClient` wraps a single `reqwest::Client` pointed at an
//! OpenAI-compatible `/v1/embeddings` endpoint. `run_worker` drives the
//! batch loop: select pending (zero-vector) rows, dispatch batches with
//! bounded concurrency, write each completed batch's vectors back
//! sequentially to avoid write contention, and periodically flush the
//! progress sentinel read by `dex status` and the orchestrator.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{DexError, Result};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Downloading,
    Embedding,
    Done,
    Error,
}

/// Persisted worker progress sentinel (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProgress {
    pub status: WorkerStatus,
    pub total: usize,
    pub completed: usize,
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerProgress {
    pub fn idle() -> Self {
        Self { status: WorkerStatus::Idle, total: 0, completed: 0, started_at: None, completed_at: None, error: None }
    }
}

pub fn write_progress(path: &Path, progress: &WorkerProgress) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(progress)?;
    std::fs::write(path, json)?;
    Ok(())
}

pub fn read_progress(path: &Path) -> Option<WorkerProgress> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

/// Thin client over the embedding endpoint (§6: `POST /v1/embeddings`).
#[derive(Clone)]
pub struct EmbeddingClient {
    http: reqwest::Client,
    endpoint_url: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(endpoint_url: String, model: String) -> Self {
        Self { http: reqwest::Client::new(), endpoint_url, model }
    }

    /// Single HTTP round-trip, no retry. `run_worker` wraps this with
    /// `embed_batch_with_retry` for the worker's failure model.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "input": texts, "model": self.model });
        let resp = self
            .http
            .post(&self.endpoint_url)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| DexError::EmbeddingUnavailable(e.to_string()))?;
        let resp = resp.error_for_status().map_err(|e| DexError::EmbeddingUnavailable(e.to_string()))?;
        let parsed: EmbeddingResponse =
            resp.json().await.map_err(|e| DexError::EmbeddingUnavailable(e.to_string()))?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Retries with exponential backoff up to 3 attempts (§5 "Cancellation
    /// & timeouts").
    pub async fn embed_batch_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0u32;
        loop {
            match self.embed_batch(texts).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < 2 => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `embedQuery` (§4.7): queries are never stored, only the resulting
    /// vector is returned.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.into_iter().next().ok_or_else(|| DexError::EmbeddingUnavailable("empty response".into()))
    }
}

/// Drives one full worker pass: scan pending rows, batch, embed with
/// bounded concurrency, write vectors back sequentially, flush progress
/// after each batch (§4.5).
///
/// `cancel` is polled after each batch completes; set from the binary's
/// SIGTERM handler so a terminated worker leaves a clean `idle` sentinel
/// and the remaining zero-vector rows for the next run to pick up.
pub async fn run_worker(
    store: &Store,
    client: &EmbeddingClient,
    batch_size: usize,
    concurrency: usize,
    progress_path: &Path,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let pending = store.pending_embedding_ids()?;
    let total = pending.len();

    let mut progress = WorkerProgress {
        status: WorkerStatus::Embedding,
        total,
        completed: 0,
        started_at: Some(Utc::now()),
        completed_at: None,
        error: None,
    };
    write_progress(progress_path, &progress)?;

    if total == 0 {
        progress.status = WorkerStatus::Done;
        progress.completed_at = Some(Utc::now());
        write_progress(progress_path, &progress)?;
        return Ok(());
    }

    let batches: Vec<Vec<(String, String)>> =
        pending.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect();

    let mut stream = stream::iter(batches.into_iter().map(|batch| {
        let client = client.clone();
        async move {
            let texts: Vec<String> = batch.iter().map(|(_, content)| content.clone()).collect();
            let result = client.embed_batch_with_retry(&texts).await;
            (batch, result)
        }
    }))
    .buffer_unordered(concurrency.max(1));

    let mut completed = 0usize;
    while let Some((batch, result)) = stream.next().await {
        match result {
            Ok(vectors) => {
                for ((id, _), vector) in batch.iter().zip(vectors.iter()) {
                    store.update_message_vector(id, vector)?;
                }
                completed += batch.len();
            }
            Err(e) => {
                tracing::warn!("batch embedding failed after retries: {e}");
            }
        }
        progress.completed = completed;
        write_progress(progress_path, &progress)?;

        if cancel.load(Ordering::Relaxed) {
            progress.status = WorkerStatus::Idle;
            write_progress(progress_path, &progress)?;
            return Ok(());
        }
    }

    progress.status = WorkerStatus::Done;
    progress.completed_at = Some(Utc::now());
    write_progress(progress_path, &progress)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_progress_round_trips_through_json() {
        let progress = WorkerProgress {
            status: WorkerStatus::Embedding,
            total: 10,
            completed: 3,
            started_at: Some(Utc::now()),
            completed_at: None,
            error: None,
        };
        let json = serde_json::to_string(&progress).unwrap();
        let parsed: WorkerProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.total, 10);
        assert_eq!(parsed.completed, 3);
        assert_eq!(parsed.status, WorkerStatus::Embedding);
    }

    #[test]
    fn write_and_read_progress_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker-progress.json");
        let progress = WorkerProgress::idle();
        write_progress(&path, &progress).unwrap();
        let read_back = read_progress(&path).unwrap();
        assert_eq!(read_back.status, WorkerStatus::Idle);
    }

    #[test]
    fn read_progress_returns_none_for_missing_file() {
        assert!(read_progress(Path::new("/nonexistent/worker-progress.json")).is_none());
    }

    #[tokio::test]
    async fn run_worker_marks_done_when_nothing_pending() {
        let store = Store::open_in_memory().unwrap();
        let client = EmbeddingClient::new("http://localhost:0".into(), "test-model".into());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        run_worker(&store, &client, 64, 4, &path, Arc::new(AtomicBool::new(false))).await.unwrap();
        let progress = read_progress(&path).unwrap();
        assert_eq!(progress.status, WorkerStatus::Done);
        assert_eq!(progress.total, 0);
    }
}
