//! Columnar store (C4): schema, FTS5 index, vector scan, process-wide lock.
//!
//! # Architecture overview
//!
//! One SQLite file under the data directory. Tables use `TEXT` primary keys
//! (the deterministic ids from `model`) rather than `INTEGER ROWID` —
//! dex's ids are content-addressed and computed before insert, so there is
//! nothing a rowid would buy.
//!
//! `messages_fts` is a free-standing FTS5 table (not `content=`-linked to
//! `messages`) that carries its own copy of `content` plus an unindexed
//! `message_id` column, rebuilt wholesale after bulk insert.
//!
//! Vector search has no native index: `messages.vector` is a `BLOB` of
//! little-endian `f32`s, and nearest-neighbor is a brute-force in-process
//! cosine scan over non-zero vectors (a local-first store with a few
//! thousand messages does not need an ANN index to stay responsive).
//!
//! # TRADE-OFFS
//!
//! The process-wide sync lock (`acquire_sync_lock`/`release_sync_lock`) is
//! implemented with `fs4`'s OS-level advisory file lock — there is exactly
//! one writer process allowed at a time, and this is the simplest correct
//! way to enforce that across processes; noted in DESIGN.md.

use std::fs::{File, OpenOptions};
use std::path::Path;

use rusqlite::Connection;

use crate::error::{DexError, Result};
use crate::model::VECTOR_DIM;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = OFF;

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    subtitle TEXT,
    workspace_path TEXT NOT NULL DEFAULT '',
    project_name TEXT NOT NULL DEFAULT '',
    model TEXT NOT NULL DEFAULT '',
    mode TEXT NOT NULL DEFAULT 'chat',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    source_original_id TEXT NOT NULL DEFAULT '',
    source_vendor_db_path TEXT NOT NULL DEFAULT '',
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens INTEGER NOT NULL DEFAULT 0,
    lines_added INTEGER NOT NULL DEFAULT 0,
    lines_removed INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_conversations_source ON conversations(source);
CREATE INDEX IF NOT EXISTS idx_conversations_project ON conversations(project_name);
CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT,
    message_index INTEGER NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens INTEGER NOT NULL DEFAULT 0,
    lines_added INTEGER NOT NULL DEFAULT 0,
    lines_removed INTEGER NOT NULL DEFAULT 0,
    vector BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, message_index);

CREATE TABLE IF NOT EXISTS tool_calls (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    tool_type TEXT NOT NULL,
    input TEXT NOT NULL,
    output TEXT,
    file_path TEXT
);

CREATE INDEX IF NOT EXISTS idx_tool_calls_conversation ON tool_calls(conversation_id);

CREATE TABLE IF NOT EXISTS conversation_files (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    role TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversation_files_conversation ON conversation_files(conversation_id);
CREATE INDEX IF NOT EXISTS idx_conversation_files_path ON conversation_files(file_path);

CREATE TABLE IF NOT EXISTS message_files (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    role TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_message_files_conversation ON message_files(conversation_id);
CREATE INDEX IF NOT EXISTS idx_message_files_path ON message_files(file_path);

CREATE TABLE IF NOT EXISTS file_edits (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    edit_type TEXT NOT NULL,
    lines_added INTEGER NOT NULL DEFAULT 0,
    lines_removed INTEGER NOT NULL DEFAULT 0,
    start_line INTEGER,
    end_line INTEGER
);

CREATE INDEX IF NOT EXISTS idx_file_edits_conversation ON file_edits(conversation_id);
CREATE INDEX IF NOT EXISTS idx_file_edits_path ON file_edits(file_path);

CREATE TABLE IF NOT EXISTS sync_state (
    source TEXT NOT NULL,
    vendor_db_path TEXT NOT NULL,
    workspace_path TEXT NOT NULL DEFAULT '',
    last_synced_at TEXT NOT NULL,
    last_mtime REAL NOT NULL,
    PRIMARY KEY (source, vendor_db_path)
);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content,
    message_id UNINDEXED,
    conversation_id UNINDEXED,
    tokenize = 'porter'
);
"#;

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Drops and repopulates `messages_fts` from `messages`. Cheap enough
    /// at local-first scale to run wholesale after every bulk insert
    /// rather than maintain per-row FTS triggers (§4.4 Phase 7).
    pub fn rebuild_fts(&self) -> Result<()> {
        self.conn.execute("DELETE FROM messages_fts", [])?;
        self.conn.execute_batch(
            "INSERT INTO messages_fts(content, message_id, conversation_id)
             SELECT content, id, conversation_id FROM messages WHERE trim(content) != '';",
        )?;
        Ok(())
    }

    /// Top `limit` message ids by FTS5 `bm25` relevance. Score is negated
    /// (`bm25` returns more-negative-is-better) so callers can treat higher
    /// as better uniformly with vector cosine scores.
    pub fn fts_search(&self, query: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        let escaped = escape_fts_query(query);
        if escaped.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT message_id, bm25(messages_fts) FROM messages_fts
             WHERE messages_fts MATCH ?1 ORDER BY bm25(messages_fts) LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![escaped, limit as i64], |row| {
            let id: String = row.get(0)?;
            let raw_score: f64 = row.get(1)?;
            Ok((id, -raw_score))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Brute-force cosine-nearest scan over non-zero vectors (§4.8 step 2).
    pub fn vector_search(&self, query: &[f32], limit: usize) -> Result<Vec<(String, f64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, vector FROM messages WHERE vector != ?1")?;
        let zero = encode_vector(&vec![0.0f32; VECTOR_DIM]);
        let rows = stmt.query_map(rusqlite::params![zero], |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, blob))
        })?;

        let mut scored: Vec<(String, f64)> = Vec::new();
        for r in rows {
            let (id, blob) = r?;
            let vector = decode_vector(&blob);
            if vector.len() != query.len() {
                continue;
            }
            scored.push((id, cosine_similarity(query, &vector)));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    pub fn update_message_vector(&self, message_id: &str, vector: &[f32]) -> Result<()> {
        let encoded = encode_vector(vector);
        self.conn.execute(
            "UPDATE messages SET vector = ?1 WHERE id = ?2",
            rusqlite::params![encoded, message_id],
        )?;
        Ok(())
    }

    /// Every message row whose vector is still the all-zero placeholder
    /// (§4.5 step 2). Survives worker restarts: the placeholder is
    /// deterministic, so a re-scan always finds exactly the unembedded set.
    pub fn pending_embedding_ids(&self) -> Result<Vec<(String, String)>> {
        let zero = encode_vector(&vec![0.0f32; VECTOR_DIM]);
        let mut stmt = self
            .conn
            .prepare("SELECT id, content FROM messages WHERE vector = ?1")?;
        let rows = stmt.query_map(rusqlite::params![zero], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// FTS5 treats `:`, `-`, `"` etc. as query syntax; a free-text search
/// query is never meant to be one, so every token is quoted individually.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|tok| format!("\"{}\"", tok.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Acquires the process-wide sync lock: an OS advisory exclusive lock on
/// `<data_dir>/sync.lock`, created if absent. Returns `None` if another
/// dex process already holds it (§4.2, §4.4 "Locking").
pub fn acquire_sync_lock(lock_path: &Path) -> Result<Option<File>> {
    use fs4::FileExt;

    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).write(true).open(lock_path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(DexError::Io(e)),
    }
}

/// Releases a lock acquired by `acquire_sync_lock`. Dropping the `File`
/// also releases it (OS advisory locks are tied to the fd), but an
/// explicit release keeps the call site symmetric with §4.2's contract.
pub fn release_sync_lock(file: File) {
    use fs4::FileExt;
    let _ = file.unlock();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_encode_decode_round_trips() {
        let v = vec![0.1f32, -2.5, 3.333, 0.0];
        let encoded = encode_vector(&v);
        let decoded = decode_vector(&encoded);
        assert_eq!(v, decoded);
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_zero_vector_is_zero() {
        let a = vec![0.0f32, 0.0];
        let b = vec![1.0f32, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn schema_creates_all_tables() {
        let store = Store::open_in_memory().unwrap();
        let mut stmt = store
            .connection()
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        for expected in ["conversations", "messages", "tool_calls", "sync_state", "file_edits"] {
            assert!(names.contains(&expected.to_string()), "missing table {expected}");
        }
    }

    #[test]
    fn fts_search_finds_inserted_content() {
        let store = Store::open_in_memory().unwrap();
        store
            .connection()
            .execute(
                "INSERT INTO messages (id, conversation_id, role, content, message_index, vector)
                 VALUES ('c:0', 'c', 'user', 'the quick brown fox', 0, ?1)",
                rusqlite::params![encode_vector(&vec![0.0; VECTOR_DIM])],
            )
            .unwrap();
        store.rebuild_fts().unwrap();
        let results = store.fts_search("fox", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "c:0");
    }

    #[test]
    fn pending_embedding_ids_finds_only_zero_vectors() {
        let store = Store::open_in_memory().unwrap();
        let zero = encode_vector(&vec![0.0; VECTOR_DIM]);
        let mut nonzero = vec![0.0f32; VECTOR_DIM];
        nonzero[0] = 1.0;
        let nonzero = encode_vector(&nonzero);
        store
            .connection()
            .execute(
                "INSERT INTO messages (id, conversation_id, role, content, message_index, vector) VALUES ('c:0','c','user','a',0,?1)",
                rusqlite::params![zero],
            )
            .unwrap();
        store
            .connection()
            .execute(
                "INSERT INTO messages (id, conversation_id, role, content, message_index, vector) VALUES ('c:1','c','user','b',1,?1)",
                rusqlite::params![nonzero],
            )
            .unwrap();
        let pending = store.pending_embedding_ids().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, "c:0");
    }
}
