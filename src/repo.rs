//! Typed repositories over the store (C5): bulk operations, the uniform
//! per-table operation set, and the file-path search sub-service (§4.3).
//!
//! Grounded on the `other_examples` SQLite storage file's
//! `insert_conversation`/`insert_message`/`list_conversations` pattern —
//! one function per table, `rusqlite::params!` bound positionally,
//! `query_map` collected into owned `Vec`s.

use std::collections::HashSet;

use rusqlite::{Connection, OptionalExtension, params};

use crate::adapters::NormalizedConversation;
use crate::error::Result;
use crate::model::{
    Conversation, ConversationFile, Counters, FileEdit, FileRole, Message, MessageFile, Mode,
    Role, Source, SourceRef, SyncState, ToolCall,
};
use crate::store::{Store, decode_vector, encode_vector};

/// `conversationRepo.getExistingIds`: a single projection over a batch of
/// candidate ids (§4.3).
pub fn get_existing_conversation_ids(conn: &Connection, candidates: &[String]) -> Result<HashSet<String>> {
    let mut existing = HashSet::new();
    for chunk in candidates.chunks(100) {
        let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT id FROM conversations WHERE id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = chunk.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), |row| row.get::<_, String>(0))?;
        for r in rows {
            existing.insert(r?);
        }
    }
    Ok(existing)
}

/// Deletes a conversation and every child row (cascading delete semantics,
/// §3 "Ownership/lifecycle"), batched 10 ids at a time across tables
/// (§4.4 Phase 4).
pub fn delete_conversations(conn: &Connection, ids: &[String]) -> Result<()> {
    for chunk in ids.chunks(10) {
        let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let params: Vec<&dyn rusqlite::ToSql> = chunk.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        for table in [
            "messages",
            "tool_calls",
            "conversation_files",
            "message_files",
            "file_edits",
            "conversations",
        ] {
            let sql = format!("DELETE FROM {table} WHERE conversation_id IN ({placeholders})");
            let sql = if table == "conversations" {
                format!("DELETE FROM conversations WHERE id IN ({placeholders})")
            } else {
                sql
            };
            conn.execute(&sql, params.as_slice())?;
        }
    }
    Ok(())
}

pub fn insert_conversation(conn: &Connection, c: &Conversation) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (
            id, source, title, subtitle, workspace_path, project_name, model, mode,
            created_at, updated_at, message_count, source_original_id, source_vendor_db_path,
            input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
            lines_added, lines_removed
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
        params![
            c.id,
            c.source.to_string(),
            c.title,
            c.subtitle,
            c.workspace_path,
            c.project_name,
            c.model,
            c.mode.to_string(),
            c.created_at.to_rfc3339(),
            c.updated_at.to_rfc3339(),
            c.message_count,
            c.source_ref.original_id,
            c.source_ref.vendor_db_path,
            c.counters.input_tokens,
            c.counters.output_tokens,
            c.counters.cache_creation_tokens,
            c.counters.cache_read_tokens,
            c.counters.lines_added,
            c.counters.lines_removed,
        ],
    )?;
    Ok(())
}

pub fn insert_messages(conn: &Connection, messages: &[Message]) -> Result<()> {
    for m in messages {
        conn.execute(
            "INSERT INTO messages (
                id, conversation_id, role, content, timestamp, message_index,
                input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                lines_added, lines_removed, vector
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                m.id,
                m.conversation_id,
                m.role.to_string(),
                m.content,
                m.timestamp.map(|t| t.to_rfc3339()),
                m.message_index,
                m.counters.input_tokens,
                m.counters.output_tokens,
                m.counters.cache_creation_tokens,
                m.counters.cache_read_tokens,
                m.counters.lines_added,
                m.counters.lines_removed,
                encode_vector(&m.vector),
            ],
        )?;
    }
    Ok(())
}

pub fn insert_tool_calls(conn: &Connection, tool_calls: &[ToolCall]) -> Result<()> {
    for t in tool_calls {
        conn.execute(
            "INSERT INTO tool_calls (id, message_id, conversation_id, tool_type, input, output, file_path)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![t.id, t.message_id, t.conversation_id, t.tool_type, t.input, t.output, t.file_path],
        )?;
    }
    Ok(())
}

pub fn insert_conversation_files(conn: &Connection, files: &[ConversationFile]) -> Result<()> {
    for f in files {
        conn.execute(
            "INSERT INTO conversation_files (id, conversation_id, file_path, role) VALUES (?1,?2,?3,?4)",
            params![f.id, f.conversation_id, f.file_path, f.role.to_string()],
        )?;
    }
    Ok(())
}

pub fn insert_message_files(conn: &Connection, files: &[MessageFile]) -> Result<()> {
    for f in files {
        conn.execute(
            "INSERT INTO message_files (id, message_id, conversation_id, file_path, role) VALUES (?1,?2,?3,?4,?5)",
            params![f.id, f.message_id, f.conversation_id, f.file_path, f.role.to_string()],
        )?;
    }
    Ok(())
}

pub fn insert_file_edits(conn: &Connection, edits: &[FileEdit]) -> Result<()> {
    for e in edits {
        conn.execute(
            "INSERT INTO file_edits (
                id, message_id, conversation_id, file_path, edit_type,
                lines_added, lines_removed, start_line, end_line
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                e.id,
                e.message_id,
                e.conversation_id,
                e.file_path,
                e.edit_type.to_string(),
                e.lines_added,
                e.lines_removed,
                e.start_line,
                e.end_line,
            ],
        )?;
    }
    Ok(())
}

/// Inserts a fully normalized conversation tree in the order Phase 5
/// requires: parent row first, then children in parallel-safe order
/// (sequential here — the orchestrator is what parallelizes across
/// conversations, not within one).
pub fn insert_normalized_conversation(conn: &Connection, nc: &NormalizedConversation) -> Result<()> {
    insert_conversation(conn, &nc.conversation)?;
    insert_messages(conn, &nc.messages)?;
    insert_tool_calls(conn, &nc.tool_calls)?;
    insert_conversation_files(conn, &nc.files)?;
    insert_message_files(conn, &nc.message_files)?;
    insert_file_edits(conn, &nc.file_edits)?;
    Ok(())
}

pub fn upsert_sync_state(conn: &Connection, state: &SyncState) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_state (source, vendor_db_path, workspace_path, last_synced_at, last_mtime)
         VALUES (?1,?2,?3,?4,?5)
         ON CONFLICT(source, vendor_db_path) DO UPDATE SET
            workspace_path = excluded.workspace_path,
            last_synced_at = excluded.last_synced_at,
            last_mtime = excluded.last_mtime",
        params![
            state.source.to_string(),
            state.vendor_db_path,
            state.workspace_path,
            state.last_synced_at.to_rfc3339(),
            state.last_mtime,
        ],
    )?;
    Ok(())
}

pub fn find_sync_state(conn: &Connection, source: Source, vendor_db_path: &str) -> Result<Option<SyncState>> {
    let row = conn
        .query_row(
            "SELECT source, vendor_db_path, workspace_path, last_synced_at, last_mtime
             FROM sync_state WHERE source = ?1 AND vendor_db_path = ?2",
            params![source.to_string(), vendor_db_path],
            |row| {
                let last_synced_at: String = row.get(3)?;
                Ok(SyncState {
                    source,
                    vendor_db_path: row.get(1)?,
                    workspace_path: row.get(2)?,
                    last_synced_at: last_synced_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
                    last_mtime: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn conversation_by_id(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            "SELECT id, source, title, subtitle, workspace_path, project_name, model, mode,
                    created_at, updated_at, message_count, source_original_id, source_vendor_db_path,
                    input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                    lines_added, lines_removed
             FROM conversations WHERE id = ?1",
            params![id],
            row_to_conversation,
        )
        .optional()?;
    Ok(row)
}

/// Conversations whose title is still empty, oldest first, for the
/// enrichment driver to pick up.
pub fn untitled_conversations(conn: &Connection, limit: usize) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT id, source, title, subtitle, workspace_path, project_name, model, mode,
                created_at, updated_at, message_count, source_original_id, source_vendor_db_path,
                input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                lines_added, lines_removed
         FROM conversations WHERE title IS NULL OR title = ''
         ORDER BY created_at ASC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], row_to_conversation)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn set_conversation_title(conn: &Connection, conversation_id: &str, title: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET title = ?1 WHERE id = ?2",
        params![title, conversation_id],
    )?;
    Ok(())
}

pub fn messages_by_conversation(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, role, content, timestamp, message_index,
                input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                lines_added, lines_removed, vector
         FROM messages WHERE conversation_id = ?1 ORDER BY message_index ASC",
    )?;
    let rows = stmt.query_map(params![conversation_id], row_to_message)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn messages_by_ids(conn: &Connection, ids: &[String]) -> Result<Vec<Message>> {
    let mut out = Vec::new();
    for chunk in ids.chunks(100) {
        let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, conversation_id, role, content, timestamp, message_index,
                    input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                    lines_added, lines_removed, vector
             FROM messages WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let bind: Vec<&dyn rusqlite::ToSql> = chunk.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(bind.as_slice(), row_to_message)?;
        for r in rows {
            out.push(r?);
        }
    }
    Ok(out)
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    let source_str: String = row.get(1)?;
    let mode_str: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let source: Source = source_str.parse().unwrap_or(Source::Cursor);
    Ok(Conversation {
        id: row.get(0)?,
        source,
        title: row.get(2)?,
        subtitle: row.get(3)?,
        workspace_path: row.get(4)?,
        project_name: row.get(5)?,
        model: row.get(6)?,
        mode: mode_str.parse().unwrap_or(Mode::Chat),
        created_at: created_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
        updated_at: updated_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
        message_count: row.get(10)?,
        source_ref: SourceRef {
            source,
            workspace_path: row.get(4)?,
            original_id: row.get(11)?,
            vendor_db_path: row.get(12)?,
        },
        counters: Counters {
            input_tokens: row.get(13)?,
            output_tokens: row.get(14)?,
            cache_creation_tokens: row.get(15)?,
            cache_read_tokens: row.get(16)?,
            lines_added: row.get(17)?,
            lines_removed: row.get(18)?,
        },
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let role_str: String = row.get(2)?;
    let ts: Option<String> = row.get(4)?;
    let vector_bytes: Vec<u8> = row.get(12)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: role_str.parse().unwrap_or(Role::User),
        content: row.get(3)?,
        timestamp: ts.and_then(|s| s.parse().ok()),
        message_index: row.get(5)?,
        counters: Counters {
            input_tokens: row.get(6)?,
            output_tokens: row.get(7)?,
            cache_creation_tokens: row.get(8)?,
            cache_read_tokens: row.get(9)?,
            lines_added: row.get(10)?,
            lines_removed: row.get(11)?,
        },
        vector: decode_vector(&vector_bytes),
    })
}

/// `stats`/`list` helper: every conversation, most-recently-updated first,
/// with optional source/project/date filters (§4.10 `list`).
#[derive(Default, Clone)]
pub struct ListFilter {
    pub source: Option<Source>,
    pub project: Option<String>,
    pub from: Option<chrono::DateTime<chrono::Utc>>,
    pub to: Option<chrono::DateTime<chrono::Utc>>,
}

pub fn list_conversations(conn: &Connection, filter: &ListFilter, limit: usize, offset: usize) -> Result<(Vec<Conversation>, usize)> {
    let mut clauses = Vec::new();
    let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(source) = filter.source {
        clauses.push("source = ?".to_string());
        bind.push(Box::new(source.to_string()));
    }
    if let Some(project) = &filter.project {
        clauses.push("project_name = ?".to_string());
        bind.push(Box::new(project.clone()));
    }
    if let Some(from) = filter.from {
        clauses.push("updated_at >= ?".to_string());
        bind.push(Box::new(from.to_rfc3339()));
    }
    if let Some(to) = filter.to {
        clauses.push("updated_at <= ?".to_string());
        bind.push(Box::new(to.to_rfc3339()));
    }

    let where_clause = if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };

    let count_sql = format!("SELECT COUNT(*) FROM conversations {where_clause}");
    let params_ref: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let total: usize = conn.query_row(&count_sql, params_ref.as_slice(), |row| row.get::<_, i64>(0))? as usize;

    let sql = format!(
        "SELECT id, source, title, subtitle, workspace_path, project_name, model, mode,
                created_at, updated_at, message_count, source_original_id, source_vendor_db_path,
                input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                lines_added, lines_removed
         FROM conversations {where_clause} ORDER BY updated_at DESC LIMIT ? OFFSET ?"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut full_params = params_ref.clone();
    let limit_i = limit as i64;
    let offset_i = offset as i64;
    full_params.push(&limit_i);
    full_params.push(&offset_i);
    let rows = stmt.query_map(full_params.as_slice(), row_to_conversation)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok((out, total))
}

/// File-path search sub-service (§4.3): case-insensitive substring match
/// across the three file tables, scored by role, deduplicated to the max
/// score per `(conversation_id, file_path)`.
pub fn search_by_file_path(conn: &Connection, pattern: &str, limit: usize) -> Result<Vec<(String, f64)>> {
    let like = format!("%{}%", pattern.to_lowercase());
    let mut scores: std::collections::HashMap<(String, String), f64> = std::collections::HashMap::new();

    for (table, has_message) in [("file_edits", true), ("conversation_files", false), ("message_files", true)] {
        let _ = has_message;
        let sql = format!("SELECT conversation_id, file_path, role FROM {table} WHERE LOWER(file_path) LIKE ?1");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![like], |row| {
            let conv_id: String = row.get(0)?;
            let path: String = row.get(1)?;
            let role_str: String = row.get(2)?;
            Ok((conv_id, path, role_str))
        })?;
        for r in rows {
            let (conv_id, path, role_str) = r?;
            let role: FileRole = role_str.parse().unwrap_or(FileRole::Mentioned);
            let score = role.score();
            let key = (conv_id, path);
            let entry = scores.entry(key).or_insert(0.0);
            if score > *entry {
                *entry = score;
            }
        }
    }

    let mut out: Vec<((String, String), f64)> = scores.into_iter().collect();
    out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    out.truncate(limit);
    Ok(out.into_iter().map(|((conv_id, _path), score)| (conv_id, score)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mode, Role, Source};

    fn sample_conversation(id: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            source: Source::Codex,
            title: String::new(),
            subtitle: None,
            workspace_path: "/proj".into(),
            project_name: "proj".into(),
            model: "gpt-5".into(),
            mode: Mode::Agent,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            message_count: 1,
            source_ref: SourceRef {
                source: Source::Codex,
                workspace_path: "/proj".into(),
                original_id: "orig-1".into(),
                vendor_db_path: "/tmp/rollout.jsonl".into(),
            },
            counters: Counters::default(),
        }
    }

    fn sample_message(conv_id: &str, idx: u32) -> Message {
        Message {
            id: Message::id_for(conv_id, idx),
            conversation_id: conv_id.to_string(),
            role: Role::User,
            content: format!("message {idx}"),
            timestamp: Some(chrono::Utc::now()),
            message_index: idx,
            counters: Counters::default(),
            vector: Message::placeholder_vector(),
        }
    }

    #[test]
    fn insert_and_fetch_conversation_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let conv = sample_conversation("c1");
        insert_conversation(store.connection(), &conv).unwrap();
        let fetched = conversation_by_id(store.connection(), "c1").unwrap().unwrap();
        assert_eq!(fetched.id, "c1");
        assert_eq!(fetched.model, "gpt-5");
    }

    #[test]
    fn messages_by_conversation_orders_by_index() {
        let store = Store::open_in_memory().unwrap();
        let conv = sample_conversation("c1");
        insert_conversation(store.connection(), &conv).unwrap();
        let messages = vec![sample_message("c1", 1), sample_message("c1", 0)];
        insert_messages(store.connection(), &messages).unwrap();
        let fetched = messages_by_conversation(store.connection(), "c1").unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].message_index, 0);
        assert_eq!(fetched[1].message_index, 1);
    }

    #[test]
    fn get_existing_conversation_ids_only_returns_present_rows() {
        let store = Store::open_in_memory().unwrap();
        insert_conversation(store.connection(), &sample_conversation("c1")).unwrap();
        let existing = get_existing_conversation_ids(
            store.connection(),
            &["c1".to_string(), "missing".to_string()],
        )
        .unwrap();
        assert!(existing.contains("c1"));
        assert!(!existing.contains("missing"));
    }

    #[test]
    fn delete_conversations_removes_conversation_and_messages() {
        let store = Store::open_in_memory().unwrap();
        insert_conversation(store.connection(), &sample_conversation("c1")).unwrap();
        insert_messages(store.connection(), &[sample_message("c1", 0)]).unwrap();
        delete_conversations(store.connection(), &["c1".to_string()]).unwrap();
        assert!(conversation_by_id(store.connection(), "c1").unwrap().is_none());
        assert!(messages_by_conversation(store.connection(), "c1").unwrap().is_empty());
    }

    #[test]
    fn file_path_search_dedupes_by_max_role_score() {
        let store = Store::open_in_memory().unwrap();
        insert_conversation(store.connection(), &sample_conversation("c1")).unwrap();
        insert_conversation_files(
            store.connection(),
            &[ConversationFile {
                id: "f1".into(),
                conversation_id: "c1".into(),
                file_path: "src/auth.ts".into(),
                role: FileRole::Context,
            }],
        )
        .unwrap();
        insert_file_edits(
            store.connection(),
            &[FileEdit {
                id: "e1".into(),
                message_id: "c1:0".into(),
                conversation_id: "c1".into(),
                file_path: "src/auth.ts".into(),
                edit_type: crate::model::EditType::Modify,
                lines_added: 1,
                lines_removed: 0,
                start_line: None,
                end_line: None,
            }],
        )
        .unwrap();
        let results = search_by_file_path(store.connection(), "auth", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, FileRole::Edited.score());
    }

    #[test]
    fn list_conversations_filters_by_source() {
        let store = Store::open_in_memory().unwrap();
        insert_conversation(store.connection(), &sample_conversation("c1")).unwrap();
        let mut other = sample_conversation("c2");
        other.source = Source::Cursor;
        insert_conversation(store.connection(), &other).unwrap();

        let filter = ListFilter { source: Some(Source::Cursor), ..Default::default() };
        let (results, total) = list_conversations(store.connection(), &filter, 10, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(results[0].id, "c2");
    }
}
