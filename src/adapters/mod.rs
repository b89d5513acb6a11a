//! Source adapters (C2): discover and parse each vendor's on-disk format
//! into the normalized model (`crate::model`).
//!
//! # Architecture overview
//!
//! Every adapter implements the same four-capability contract so the sync
//! orchestrator (C6) never needs to know which vendor it is talking to:
//!
//! ```text
//! detect() -> bool            is this tool installed on this machine?
//! discover() -> [SourceLocation]   where are its conversation stores?
//! extract(location) -> [RawConversation]   read the raw vendor records
//! normalize(raw, location) -> NormalizedConversation   canonicalize
//! ```
//!
//! `extract` and `normalize` are kept separate (rather than one
//! `extract_and_normalize`) so that partial, per-record failures in
//! `extract` (malformed JSON, a single bad row) stay isolated from the
//! deterministic, pure transformation in `normalize`: file I/O and parsing
//! lives in `extract`, and the pure, side-effect-free shaping of already-
//! parsed records lives in `normalize`.
//!
//! # TRADE-OFFS
//!
//! `RawConversation` carries a `serde_json::Value` per vendor record rather
//! than a typed enum, because the three vendors' schemas are unrelated
//! enough that a shared typed representation would just be `Value` with
//! extra steps. `normalize` is where the knowledge of each vendor's shape
//! lives; see Design Note "Dynamic any-JSON vendor payloads".

pub mod claude_code;
pub mod codex;
pub mod cursor;

use std::path::PathBuf;

use crate::error::Result;
use crate::model::{
    Conversation, ConversationFile, FileEdit, Message, MessageFile, Source, ToolCall,
};

/// Where a vendor keeps one conversation store: a single KV-store file, or
/// the root of a directory tree of session logs.
#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub source: Source,
    pub workspace_path: String,
    pub vendor_db_path: PathBuf,
    pub mtime: f64,
}

/// One vendor record, not yet normalized. `raw_id` is the vendor's own
/// session/composer identifier, used to derive the deterministic
/// conversation id.
#[derive(Debug, Clone)]
pub struct RawConversation {
    pub raw_id: String,
    pub location: SourceLocation,
    pub payload: serde_json::Value,
}

/// A fully normalized conversation and all of its child rows, ready for
/// bulk insert.
#[derive(Debug, Clone)]
pub struct NormalizedConversation {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCall>,
    pub files: Vec<ConversationFile>,
    pub message_files: Vec<MessageFile>,
    pub file_edits: Vec<FileEdit>,
}

/// Progress callback invoked by `extract` as it works through one
/// location's records. Must capture the location's `source` by value —
/// see §4.4 Phase 3: a shared "current source" variable would race across
/// parallel extractions.
pub type ProgressCb<'a> = Box<dyn FnMut(usize, usize) + Send + 'a>;

/// Capability set implemented by each tool-specific adapter.
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Is this tool's storage present on this machine?
    fn detect(&self) -> bool;

    /// Enumerate every conversation store this adapter can find.
    fn discover(&self) -> Vec<SourceLocation>;

    /// Read every raw record at `location`. Per-record corruption is
    /// absorbed (`DexError::CorruptRecord`, logged and skipped); only
    /// whole-location I/O failures propagate.
    fn extract(&self, location: &SourceLocation, progress: ProgressCb<'_>) -> Result<Vec<RawConversation>>;

    /// Pure transformation from one raw vendor record to the normalized
    /// shape. Never fails outright for recoverable input — conversations
    /// with zero messages are returned as-is; the orchestrator drops them
    /// (§4.1 "A conversation with zero messages is dropped by the
    /// orchestrator, not the adapter").
    fn normalize(&self, raw: &RawConversation) -> Option<NormalizedConversation>;
}

/// Construct the three registered adapters (§2 C2).
pub fn all_adapters() -> Vec<Box<dyn SourceAdapter>> {
    vec![
        Box::new(cursor::CursorAdapter),
        Box::new(codex::CodexAdapter),
        Box::new(claude_code::ClaudeCodeAdapter),
    ]
}
