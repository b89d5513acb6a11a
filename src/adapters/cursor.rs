//! Adapter A: Cursor's SQLite KV store (§4.1, §9 "Heterogeneous
//! conversation reassembly").
//!
//! Cursor keeps chat data in `state.vscdb` SQLite files: a global one under
//! `globalStorage/`, and one per workspace under `workspaceStorage/<id>/`.
//! Conversations live in two shapes that must both be read:
//!
//! - flat: `conversation: [Bubble...]`.
//! - header-index: `fullConversationHeadersOnly: [{bubbleId}]` plus
//!   `conversationMap: {id: Bubble}`, reassembled by looking up each
//!   header's `bubbleId` in the map, in header order. A header whose id
//!   is missing from the map is skipped rather than failing the whole
//!   conversation.
//!
//! Bubble shape: `{type: int, text: string, tokenCount?: {inputTokens?,
//! outputTokens?}, ...}`, `type=1` user, `type=2` assistant, anything else
//! system. Both `cursorDiskKV` rows keyed `composerData:<uuid>` and the
//! older `ItemTable` rows (`%aichat%chatdata%`/`%composer%`) can carry
//! either shape.
//!
//! Grounded directly on the `other_examples` Cursor connector: the same
//! two-table query, the same bubble field fallbacks (`text`/`content`/
//! `message`, `type`/`role`), restructured to emit `model::Message` rows
//! plus per-message file context (`MessageFile`) instead of a single
//! connector-local `NormalizedMessage`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;
use walkdir::WalkDir;

use crate::adapters::{
    NormalizedConversation, ProgressCb, RawConversation, SourceAdapter, SourceLocation,
};
use crate::error::Result;
use crate::model::{
    Conversation, Counters, FileRole, Message, MessageFile, Mode, Role, Source, SourceRef,
    conversation_id,
};
use crate::paths;

pub struct CursorAdapter;

impl SourceAdapter for CursorAdapter {
    fn source(&self) -> Source {
        Source::Cursor
    }

    fn detect(&self) -> bool {
        paths::default_source_root(Source::Cursor)
            .map(|base| !find_db_files(&base).is_empty())
            .unwrap_or(false)
    }

    fn discover(&self) -> Vec<SourceLocation> {
        let Some(base) = paths::default_source_root(Source::Cursor) else {
            return Vec::new();
        };
        find_db_files(&base)
            .into_iter()
            .map(|db_path| {
                let mtime = mtime_of(&db_path).unwrap_or(0.0);
                let workspace_path = workspace_folder_for(&db_path).unwrap_or_default();
                SourceLocation {
                    source: Source::Cursor,
                    workspace_path,
                    vendor_db_path: db_path,
                    mtime,
                }
            })
            .collect()
    }

    fn extract(&self, location: &SourceLocation, mut progress: ProgressCb<'_>) -> Result<Vec<RawConversation>> {
        let conn = Connection::open_with_flags(
            &location.vendor_db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let mut rows: Vec<(String, String, &'static str)> = Vec::new();

        if let Ok(mut stmt) = conn.prepare("SELECT key, value FROM cursorDiskKV WHERE key LIKE 'composerData:%'") {
            if let Ok(found) = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))) {
                for r in found.flatten() {
                    rows.push((r.0, r.1, "composer"));
                }
            }
        }

        if let Ok(mut stmt) = conn.prepare(
            "SELECT key, value FROM ItemTable WHERE key LIKE '%aichat%chatdata%' OR key LIKE '%composer%'",
        ) {
            if let Ok(found) = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))) {
                for r in found.flatten() {
                    rows.push((r.0, r.1, "legacy"));
                }
            }
        }

        let total = rows.len();
        let mut out = Vec::new();
        for (i, (key, value, kind)) in rows.into_iter().enumerate() {
            progress(i + 1, total);
            let Ok(val) = serde_json::from_str::<Value>(&value) else {
                continue; // CorruptRecord, isolated (§7)
            };
            let raw_id = match kind {
                "composer" => key.strip_prefix("composerData:").unwrap_or(&key).to_string(),
                _ => format!("aichat-{key}"),
            };
            out.push(RawConversation {
                raw_id,
                location: location.clone(),
                payload: serde_json::json!({ "kind": kind, "value": val }),
            });
        }
        Ok(out)
    }

    fn normalize(&self, raw: &RawConversation) -> Option<NormalizedConversation> {
        let val = raw.payload.get("value")?;
        let conv_id = conversation_id(Source::Cursor, &raw.raw_id);

        let mut bubbles: Vec<&Value> = Vec::new();

        // Flat shape: conversation: [bubble...]
        if let Some(arr) = val.get("conversation").and_then(|v| v.as_array()) {
            bubbles.extend(arr.iter());
        }

        // Header-index shape: fullConversationHeadersOnly: [{bubbleId}],
        // conversationMap: {id: bubble} — reassembled by looking up each
        // header's bubbleId in the map, preserving header order. A header
        // whose bubbleId is missing from the map is skipped (§8 S2).
        if let Some(headers) = val.get("fullConversationHeadersOnly").and_then(|v| v.as_array()) {
            if let Some(conv_map) = val.get("conversationMap").and_then(|v| v.as_object()) {
                for header in headers {
                    let Some(bubble_id) = header.get("bubbleId").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    if let Some(bubble) = conv_map.get(bubble_id) {
                        bubbles.push(bubble);
                    }
                }
            }
        }

        let mut messages = Vec::new();
        let mut message_files = Vec::new();
        let mut message_index: u32 = 0;
        let mut started_at: Option<DateTime<Utc>> = None;
        let mut updated_at: Option<DateTime<Utc>> = None;

        for bubble in &bubbles {
            let Some(m) = parse_bubble(bubble, &conv_id, message_index) else {
                continue;
            };
            if started_at.is_none() {
                started_at = m.timestamp;
            }
            updated_at = m.timestamp.or(updated_at);
            for f in bubble_file_refs(bubble, &conv_id, &m.id) {
                message_files.push(f);
            }
            messages.push(m);
            message_index += 1;
        }

        // Simple single-turn composer session: no bubbles, just a `text` field.
        if messages.is_empty() {
            let user_text = val
                .get("text")
                .and_then(|v| v.as_str())
                .or_else(|| val.get("richText").and_then(|v| v.as_str()))
                .unwrap_or("");
            if !user_text.trim().is_empty() {
                messages.push(Message {
                    id: Message::id_for(&conv_id, 0),
                    conversation_id: conv_id.clone(),
                    role: Role::User,
                    content: user_text.trim().to_string(),
                    timestamp: None,
                    message_index: 0,
                    counters: Counters::default(),
                    vector: Message::placeholder_vector(),
                });
            }
        }

        if messages.is_empty() {
            return None;
        }

        let created_at_epoch = val.get("createdAt").and_then(|v| v.as_i64());
        if let Some(ms) = created_at_epoch {
            started_at = started_at.or_else(|| DateTime::from_timestamp_millis(ms));
        }

        let model_name = val
            .get("modelConfig")
            .and_then(|m| m.get("modelName"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mode = match val.get("forceMode").and_then(|v| v.as_str()) {
            Some("edit") => Mode::Edit,
            Some("agent") => Mode::Agent,
            _ => Mode::Chat,
        };

        let now = Utc::now();
        let workspace_path = raw.location.workspace_path.clone();

        let mut counters = Counters::default();
        for m in &messages {
            counters.add(&m.counters);
        }

        let conversation = Conversation {
            id: conv_id.clone(),
            source: Source::Cursor,
            title: String::new(),
            subtitle: None,
            workspace_path: workspace_path.clone(),
            project_name: paths::project_name(&workspace_path),
            model: model_name,
            mode,
            created_at: started_at.unwrap_or(now),
            updated_at: updated_at.unwrap_or(now),
            message_count: messages.len() as u32,
            source_ref: SourceRef {
                source: Source::Cursor,
                workspace_path,
                original_id: raw.raw_id.clone(),
                vendor_db_path: raw.location.vendor_db_path.to_string_lossy().to_string(),
            },
            counters,
        };

        Some(NormalizedConversation {
            conversation,
            messages,
            tool_calls: Vec::new(),
            files: Vec::new(),
            message_files,
            file_edits: Vec::new(),
        })
    }
}

fn find_db_files(base: &Path) -> Vec<PathBuf> {
    let mut dbs = Vec::new();

    let global_db = base.join("globalStorage/state.vscdb");
    if global_db.exists() {
        dbs.push(global_db);
    }

    let workspace_storage = base.join("workspaceStorage");
    if workspace_storage.exists() {
        for entry in WalkDir::new(&workspace_storage).max_depth(2).into_iter().flatten() {
            if entry.file_type().is_file() && entry.file_name().to_str() == Some("state.vscdb") {
                dbs.push(entry.path().to_path_buf());
            }
        }
    }

    dbs
}

fn mtime_of(path: &Path) -> Option<f64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let dur = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(dur.as_secs_f64())
}

/// Each `workspaceStorage/<id>/` directory carries a `workspace.json` with
/// the original folder URI. Falls back to the hashed directory id when
/// absent (global storage DBs have no workspace).
fn workspace_folder_for(db_path: &Path) -> Option<String> {
    let dir = db_path.parent()?;
    let workspace_json = dir.join("workspace.json");
    if let Ok(text) = std::fs::read_to_string(&workspace_json) {
        if let Ok(v) = serde_json::from_str::<Value>(&text) {
            if let Some(folder) = v.get("folder").and_then(|f| f.as_str()) {
                return Some(folder.trim_start_matches("file://").to_string());
            }
        }
    }
    None
}

fn parse_bubble(bubble: &Value, conv_id: &str, message_index: u32) -> Option<Message> {
    let content = bubble
        .get("text")
        .and_then(|v| v.as_str())
        .or_else(|| bubble.get("content").and_then(|v| v.as_str()))
        .or_else(|| bubble.get("message").and_then(|v| v.as_str()))?;

    if content.trim().is_empty() {
        return None;
    }

    let role = match bubble.get("type").and_then(|v| v.as_i64()) {
        Some(1) => Role::User,
        Some(2) => Role::Assistant,
        _ => Role::System,
    };

    let timestamp = bubble
        .get("timestamp")
        .or_else(|| bubble.get("createdAt"))
        .and_then(|v| v.as_i64())
        .and_then(DateTime::from_timestamp_millis);

    let counters = bubble
        .get("tokenCount")
        .map(|tc| Counters {
            input_tokens: tc.get("inputTokens").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: tc.get("outputTokens").and_then(|v| v.as_u64()).unwrap_or(0),
            ..Counters::default()
        })
        .unwrap_or_default();

    Some(Message {
        id: Message::id_for(conv_id, message_index),
        conversation_id: conv_id.to_string(),
        role,
        content: content.trim().to_string(),
        timestamp,
        message_index,
        counters,
        vector: Message::placeholder_vector(),
    })
}

/// Cursor carries per-message file context (`relevantFiles`/`context`
/// arrays) rather than Codex's per-session aggregation (§9 design note on
/// `FileRole`). Anything named there is a mentioned/context reference, not
/// necessarily edited — edits only come from accepted diff blocks, which
/// Cursor's local store does not expose in a structured way, so this
/// adapter never emits `FileEdit` rows.
fn bubble_file_refs(bubble: &Value, conv_id: &str, message_id: &str) -> Vec<MessageFile> {
    let mut paths: HashSet<String> = HashSet::new();

    if let Some(files) = bubble.get("relevantFiles").and_then(|v| v.as_array()) {
        for f in files {
            if let Some(p) = f.as_str() {
                paths.insert(p.to_string());
            }
        }
    }
    if let Some(context) = bubble.get("context").and_then(|v| v.as_object()) {
        if let Some(selections) = context.get("fileSelections").and_then(|v| v.as_array()) {
            for sel in selections {
                if let Some(p) = sel.get("uri").and_then(|u| u.get("path")).and_then(|p| p.as_str()) {
                    paths.insert(p.to_string());
                }
            }
        }
    }

    paths
        .into_iter()
        .map(|p| MessageFile {
            id: format!("{message_id}:file:{p}"),
            message_id: message_id.to_string(),
            conversation_id: conv_id.to_string(),
            file_path: p,
            role: FileRole::Mentioned,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(value: Value) -> RawConversation {
        RawConversation {
            raw_id: "composer-1".into(),
            location: SourceLocation {
                source: Source::Cursor,
                workspace_path: "/proj".into(),
                vendor_db_path: PathBuf::from("/tmp/state.vscdb"),
                mtime: 0.0,
            },
            payload: serde_json::json!({ "kind": "composer", "value": value }),
        }
    }

    #[test]
    fn normalizes_flat_conversation_shape() {
        let value = serde_json::json!({
            "conversation": [
                {"type": 1, "text": "hello"},
                {"type": 2, "text": "hi there", "timestamp": 1_700_000_000_000i64}
            ]
        });
        let adapter = CursorAdapter;
        let norm = adapter.normalize(&raw(value)).unwrap();
        assert_eq!(norm.messages.len(), 2);
        assert_eq!(norm.messages[0].role, Role::User);
        assert_eq!(norm.messages[1].role, Role::Assistant);
    }

    #[test]
    fn normalizes_header_index_conversation_map_shape() {
        let value = serde_json::json!({
            "fullConversationHeadersOnly": [{"bubbleId": "h1"}],
            "conversationMap": {
                "h1": {"type": 1, "text": "indexed hello"}
            }
        });
        let adapter = CursorAdapter;
        let norm = adapter.normalize(&raw(value)).unwrap();
        assert_eq!(norm.messages.len(), 1);
    }

    #[test]
    fn header_index_shape_skips_headers_missing_from_map() {
        let value = serde_json::json!({
            "fullConversationHeadersOnly": [
                {"bubbleId": "h1"}, {"bubbleId": "h2"}, {"bubbleId": "h3"}
            ],
            "conversationMap": {
                "h1": {"type": 1, "text": "first"},
                "h3": {"type": 2, "text": "third"}
            }
        });
        let adapter = CursorAdapter;
        let norm = adapter.normalize(&raw(value)).unwrap();
        assert_eq!(norm.messages.len(), 2);
        assert!(norm.messages.iter().all(|m| matches!(m.message_index, 0 | 1)));
        assert_eq!(norm.messages[0].content, "first");
        assert_eq!(norm.messages[1].content, "third");
    }

    #[test]
    fn bubble_type_other_than_one_or_two_is_system() {
        let value = serde_json::json!({
            "conversation": [{"type": 3, "text": "tool note"}]
        });
        let adapter = CursorAdapter;
        let norm = adapter.normalize(&raw(value)).unwrap();
        assert_eq!(norm.messages[0].role, Role::System);
    }

    #[test]
    fn bubble_token_count_populates_message_counters() {
        let value = serde_json::json!({
            "conversation": [
                {"type": 2, "text": "hi there", "tokenCount": {"inputTokens": 12, "outputTokens": 34}}
            ]
        });
        let adapter = CursorAdapter;
        let norm = adapter.normalize(&raw(value)).unwrap();
        assert_eq!(norm.messages[0].counters.input_tokens, 12);
        assert_eq!(norm.messages[0].counters.output_tokens, 34);
        assert_eq!(norm.conversation.counters.input_tokens, 12);
        assert_eq!(norm.conversation.counters.output_tokens, 34);
    }

    #[test]
    fn force_mode_agent_is_read_as_mode() {
        let value = serde_json::json!({
            "conversation": [{"type": 1, "text": "go"}],
            "forceMode": "agent"
        });
        let adapter = CursorAdapter;
        let norm = adapter.normalize(&raw(value)).unwrap();
        assert_eq!(norm.conversation.mode, Mode::Agent);
    }

    #[test]
    fn falls_back_to_flat_text_field_when_no_bubbles() {
        let value = serde_json::json!({ "text": "single turn question" });
        let adapter = CursorAdapter;
        let norm = adapter.normalize(&raw(value)).unwrap();
        assert_eq!(norm.messages.len(), 1);
        assert_eq!(norm.messages[0].content, "single turn question");
    }

    #[test]
    fn empty_bubbles_and_empty_text_normalizes_to_none() {
        let value = serde_json::json!({ "conversation": [] });
        let adapter = CursorAdapter;
        assert!(adapter.normalize(&raw(value)).is_none());
    }

    #[test]
    fn bubble_context_file_selections_become_mentioned_message_files() {
        let value = serde_json::json!({
            "conversation": [
                {"type": 1, "text": "look at this", "context": {"fileSelections": [{"uri": {"path": "/proj/src/main.rs"}}]}}
            ]
        });
        let adapter = CursorAdapter;
        let norm = adapter.normalize(&raw(value)).unwrap();
        assert_eq!(norm.message_files.len(), 1);
        assert_eq!(norm.message_files[0].role, FileRole::Mentioned);
    }
}
