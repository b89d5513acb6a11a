//! Normalized data model shared by every source adapter (C3).
//!
//! # Architecture overview
//!
//! Each vendor store has a wildly different on-disk shape — a SQLite KV blob
//! store, or an event-sourced JSONL log. Adapters normalize everything down
//! to the entities in this module before anything is written to the store.
//! Search, retrieval, and the tool interface only ever see this shape.
//!
//! # TRADE-OFFS
//!
//! - Back-references (`Message.conversation_id`, `ToolCall.message_id`) are
//!   plain `String` ids rather than pointers, so the AST stays free of
//!   lifetimes and can be serialized wholesale into the store. See Design
//!   Note "Back-references".
//! - `Message.vector` is `Vec<f32>` of a fixed build-time length
//!   (`VECTOR_DIM`). The zero vector is the placeholder written at insert
//!   time and is what C7 scans for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Build-time embedding dimension. Must match the inference endpoint's
/// model (§9 Open Question — left implementation-dependent, fixed here).
pub const VECTOR_DIM: usize = 1536;

/// Which vendor produced a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Cursor,
    ClaudeCode,
    Codex,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Cursor => write!(f, "cursor"),
            Source::ClaudeCode => write!(f, "claude-code"),
            Source::Codex => write!(f, "codex"),
        }
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cursor" => Ok(Source::Cursor),
            "claude-code" | "claude_code" | "claude" => Ok(Source::ClaudeCode),
            "codex" => Ok(Source::Codex),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

/// Conversation mode, as tracked by the originating tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Chat,
    Edit,
    Agent,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Chat => write!(f, "chat"),
            Mode::Edit => write!(f, "edit"),
            Mode::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Mode::Chat),
            "edit" => Ok(Mode::Edit),
            "agent" => Ok(Mode::Agent),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// Speaker role for a `Message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Role a file plays with respect to a conversation or message.
///
/// WHY: Vendor semantics differ on what "this file matters" means — Cursor
/// tracks per-message context, Codex aggregates per session. Carrying the
/// role lets the file-path search service (§4.3) score differently per role
/// without adapters needing to know about scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    Context,
    Edited,
    Mentioned,
}

impl FileRole {
    /// Score weight used by the file-path search service (§4.3).
    pub fn score(&self) -> f64 {
        match self {
            FileRole::Edited => 1.0,
            FileRole::Context => 0.5,
            FileRole::Mentioned => 0.3,
        }
    }
}

impl std::fmt::Display for FileRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileRole::Context => write!(f, "context"),
            FileRole::Edited => write!(f, "edited"),
            FileRole::Mentioned => write!(f, "mentioned"),
        }
    }
}

impl std::str::FromStr for FileRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context" => Ok(FileRole::Context),
            "edited" => Ok(FileRole::Edited),
            "mentioned" => Ok(FileRole::Mentioned),
            other => Err(format!("unknown file role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditType {
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for EditType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EditType::Create => write!(f, "create"),
            EditType::Modify => write!(f, "modify"),
            EditType::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for EditType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(EditType::Create),
            "modify" => Ok(EditType::Modify),
            "delete" => Ok(EditType::Delete),
            other => Err(format!("unknown edit type: {other}")),
        }
    }
}

/// Back-pointer to the vendor-side location a conversation came from.
///
/// WHY: Embedded directly in `Conversation` rather than a separate table —
/// it is never shared across conversations, so there is no join to save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub source: Source,
    pub workspace_path: String,
    pub original_id: String,
    pub vendor_db_path: String,
}

/// Aggregate token/line counters carried by both `Conversation` and
/// `Message`. Per §3, conversation-level counters equal sums over messages
/// when per-message data is available, else fall back to session-level
/// counters reported by the source.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Counters {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
}

impl Counters {
    pub fn add(&mut self, other: &Counters) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.lines_added += other.lines_added;
        self.lines_removed += other.lines_removed;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub source: Source,
    pub title: String,
    pub subtitle: Option<String>,
    pub workspace_path: String,
    pub project_name: String,
    pub model: String,
    pub mode: Mode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: u32,
    pub source_ref: SourceRef,
    pub counters: Counters,
}

/// A single conversation turn.
///
/// `content` may embed markdown fenced tool-output blocks matching the
/// regex in §6 — see `retrieval::strip_tool_blocks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub message_index: u32,
    pub counters: Counters,
    /// Fixed-dimension dense vector. All-zero iff not yet embedded (C7).
    pub vector: Vec<f32>,
}

impl Message {
    pub fn id_for(conversation_id: &str, message_index: u32) -> String {
        format!("{conversation_id}:{message_index}")
    }

    pub fn is_embedded(&self) -> bool {
        self.vector.iter().any(|x| *x != 0.0)
    }

    pub fn placeholder_vector() -> Vec<f32> {
        vec![0.0; VECTOR_DIM]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub tool_type: String,
    pub input: String,
    pub output: Option<String>,
    pub file_path: Option<String>,
}

impl ToolCall {
    pub fn id_for(message_id: &str, vendor_tool_id: &str) -> String {
        format!("{message_id}:tool:{vendor_tool_id}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationFile {
    pub id: String,
    pub conversation_id: String,
    pub file_path: String,
    pub role: FileRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFile {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub file_path: String,
    pub role: FileRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEdit {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub file_path: String,
    pub edit_type: EditType,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
}

impl FileEdit {
    /// Deterministic id: SHA-256 over `{message_id}:edit:{ordinal}:{file_path}`.
    pub fn id_for(message_id: &str, ordinal: u32, file_path: &str) -> String {
        let input = format!("{message_id}:edit:{ordinal}:{file_path}");
        hex_sha256(&input)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub source: Source,
    pub vendor_db_path: String,
    pub workspace_path: String,
    pub last_synced_at: DateTime<Utc>,
    pub last_mtime: f64,
}

/// Deterministic conversation id: 32-hex prefix of SHA-256 over
/// `"{source}:{original_id}"` (§3, tested by property 2 in §8).
pub fn conversation_id(source: Source, original_id: &str) -> String {
    let input = format!("{source}:{original_id}");
    let full = hex_sha256(&input);
    full[..32].to_string()
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_is_deterministic() {
        let a = conversation_id(Source::Cursor, "abc-123");
        let b = conversation_id(Source::Cursor, "abc-123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn conversation_id_differs_by_source() {
        let a = conversation_id(Source::Cursor, "abc-123");
        let b = conversation_id(Source::Codex, "abc-123");
        assert_ne!(a, b);
    }

    #[test]
    fn message_id_format() {
        assert_eq!(Message::id_for("conv1", 3), "conv1:3");
    }

    #[test]
    fn placeholder_vector_is_zero() {
        let v = Message::placeholder_vector();
        assert_eq!(v.len(), VECTOR_DIM);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn is_embedded_detects_any_nonzero_component() {
        let mut m = Message {
            id: "c:0".into(),
            conversation_id: "c".into(),
            role: Role::User,
            content: "hi".into(),
            timestamp: None,
            message_index: 0,
            counters: Counters::default(),
            vector: Message::placeholder_vector(),
        };
        assert!(!m.is_embedded());
        m.vector[5] = 0.001;
        assert!(m.is_embedded());
    }

    #[test]
    fn file_edit_id_is_stable() {
        let a = FileEdit::id_for("m1", 0, "src/lib.rs");
        let b = FileEdit::id_for("m1", 0, "src/lib.rs");
        assert_eq!(a, b);
        let c = FileEdit::id_for("m1", 1, "src/lib.rs");
        assert_ne!(a, c);
    }

    #[test]
    fn source_round_trips_through_display_and_parse() {
        for s in [Source::Cursor, Source::ClaudeCode, Source::Codex] {
            let parsed: Source = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }
}
