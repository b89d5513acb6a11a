use std::path::PathBuf;

/// Errors surfaced across dex's pipeline. Each variant carries the minimum
/// context needed to render a one-line, user-facing message (§7).
#[derive(Debug, thiserror::Error)]
pub enum DexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Bad date, unknown source name, malformed query — rejected at the boundary.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A vendor store is not present on this machine; not fatal, sync continues.
    #[error("source unavailable: {0}")]
    MissingSource(String),

    /// Unparseable bubble/line/record; skipped and counted, never fatal.
    #[error("corrupt record in {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    /// The process-wide sync lock could not be acquired.
    #[error("another sync is already running")]
    StoreBusy,

    /// Commit/FTS-rebuild/nearest-neighbor failure; sync transitions to `error`.
    #[error("store I/O error: {0}")]
    StoreIoError(String),

    /// The embedding endpoint is unreachable; search degrades to FTS-only,
    /// the worker exits non-zero.
    #[error("embedding endpoint unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Title-generation failure for one conversation; logged and counted,
    /// never aborts a sync.
    #[error("enrichment failed for {conversation_id}: {reason}")]
    EnrichmentFailure {
        conversation_id: String,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, DexError>;
