//! Adapter B: event-sourced `rollout-*.jsonl` session logs (§4.1, §6).
//!
//! Each session is one JSONL file under `~/.codex/sessions/**`, filename
//! `rollout-<ISO8601>-<UUIDv4>.jsonl`. Records share a three-field envelope
//! `{timestamp, type, payload}`; `type` selects the payload shape:
//! `session_meta`, `event_msg` (user turns), `response_item` (assistant
//! turns, function calls/outputs), `turn_context` (model changes).
//!
//! The event dispatch below is a state machine over `type`, emitting
//! `model::Message`/`model::ToolCall`/`model::ConversationFile` rows as it
//! walks each record.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use walkdir::WalkDir;

use crate::adapters::{
    NormalizedConversation, ProgressCb, RawConversation, SourceAdapter, SourceLocation,
};
use crate::error::{DexError, Result};
use crate::model::{
    Conversation, ConversationFile, Counters, FileEdit, FileRole, Message, Mode, Role, Source,
    SourceRef, ToolCall, conversation_id,
};
use crate::paths;

pub struct CodexAdapter;

impl SourceAdapter for CodexAdapter {
    fn source(&self) -> Source {
        Source::Codex
    }

    fn detect(&self) -> bool {
        paths::default_source_root(Source::Codex).is_some()
    }

    fn discover(&self) -> Vec<SourceLocation> {
        let Some(root) = paths::default_source_root(Source::Codex) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_rollout = path.extension().is_some_and(|e| e == "jsonl")
                && path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("rollout-"));
            if !is_rollout {
                continue;
            }
            let mtime = mtime_of(path).unwrap_or(0.0);
            let workspace_path = peek_cwd(path).unwrap_or_default();
            out.push(SourceLocation {
                source: Source::Codex,
                workspace_path,
                vendor_db_path: path.to_path_buf(),
                mtime,
            });
        }
        out
    }

    fn extract(&self, location: &SourceLocation, mut progress: ProgressCb<'_>) -> Result<Vec<RawConversation>> {
        let file = std::fs::File::open(&location.vendor_db_path)?;
        let reader = std::io::BufReader::new(file);
        let mut records = Vec::new();
        let lines: Vec<String> = reader.lines().map(|l| l.unwrap_or_default()).collect();
        let total = lines.len();
        for (i, line) in lines.into_iter().enumerate() {
            progress(i + 1, total);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(v) => records.push(v),
                Err(_) => continue, // CorruptRecord: isolated, not fatal (§7)
            }
        }

        let session_id = records
            .iter()
            .find(|r| r.get("type").and_then(|t| t.as_str()) == Some("session_meta"))
            .and_then(|r| r.get("payload"))
            .and_then(|p| p.get("id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                location
                    .vendor_db_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default()
            });

        if records.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![RawConversation {
            raw_id: session_id,
            location: location.clone(),
            payload: Value::Array(records),
        }])
    }

    fn normalize(&self, raw: &RawConversation) -> Option<NormalizedConversation> {
        let records = raw.payload.as_array()?;

        let mut workspace_path = raw.location.workspace_path.clone();
        let mut started_at: Option<DateTime<Utc>> = None;
        let mut current_model: Option<String> = None;
        let mut pending: HashMap<String, (String, String)> = HashMap::new();
        let mut messages: Vec<Message> = Vec::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut file_edits: Vec<FileEdit> = Vec::new();
        let mut files_read: Vec<String> = Vec::new();
        let mut files_written: Vec<String> = Vec::new();
        let mut counters = Counters::default();
        let mut message_index: u32 = 0;
        let mut edit_ordinal: u32 = 0;

        let conv_id = conversation_id(Source::Codex, &raw.raw_id);

        for record in records {
            let record_type = record.get("type").and_then(|t| t.as_str()).unwrap_or("");
            let ts = record
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(|s| s.parse::<DateTime<Utc>>().ok());
            let payload = record.get("payload").cloned().unwrap_or(Value::Null);

            match record_type {
                "session_meta" => {
                    if let Some(cwd) = payload.get("cwd").and_then(|v| v.as_str()) {
                        workspace_path = cwd.to_string();
                    }
                    started_at = payload
                        .get("timestamp")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                        .or(ts)
                        .or(started_at);
                }
                "turn_context" => {
                    if let Some(m) = payload.get("model").and_then(|v| v.as_str()) {
                        if current_model.as_deref() != Some(m) {
                            current_model = Some(m.to_string());
                        }
                    }
                }
                "event_msg" => {
                    if payload.get("type").and_then(|v| v.as_str()) == Some("user_message") {
                        if let Some(raw_text) = payload.get("message").and_then(|v| v.as_str()) {
                            let text = clean_user_message(raw_text);
                            if !text.is_empty() {
                                messages.push(Message {
                                    id: Message::id_for(&conv_id, message_index),
                                    conversation_id: conv_id.clone(),
                                    role: Role::User,
                                    content: text,
                                    timestamp: ts,
                                    message_index,
                                    counters: Counters::default(),
                                    vector: Message::placeholder_vector(),
                                });
                                message_index += 1;
                            }
                        }
                    }
                }
                "response_item" => {
                    let payload_type = payload.get("type").and_then(|v| v.as_str()).unwrap_or("");
                    match payload_type {
                        "message" => {
                            if payload.get("role").and_then(|v| v.as_str()) == Some("assistant") {
                                if let Some(content) = payload.get("content").and_then(|c| c.as_array()) {
                                    let text: String = content
                                        .iter()
                                        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("output_text"))
                                        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                                        .map(|t| t.trim())
                                        .filter(|t| !t.is_empty())
                                        .collect::<Vec<_>>()
                                        .join("\n\n");
                                    if !text.is_empty() {
                                        messages.push(Message {
                                            id: Message::id_for(&conv_id, message_index),
                                            conversation_id: conv_id.clone(),
                                            role: Role::Assistant,
                                            content: text,
                                            timestamp: ts,
                                            message_index,
                                            counters: Counters::default(),
                                            vector: Message::placeholder_vector(),
                                        });
                                        message_index += 1;
                                    }
                                }
                            }
                        }
                        "function_call" => {
                            let call_id = payload.get("call_id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                            let name = payload.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                            let args = payload.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}").to_string();
                            if !call_id.is_empty() {
                                pending.insert(call_id, (name, args));
                            }
                        }
                        "function_call_output" => {
                            let call_id = payload.get("call_id").and_then(|v| v.as_str()).unwrap_or("");
                            if let Some((name, args_json)) = pending.remove(call_id) {
                                let output = payload.get("output").and_then(|v| v.as_str()).unwrap_or("").to_string();
                                let args: Value = serde_json::from_str(&args_json).unwrap_or(Value::Null);

                                let file_path = extract_shell_paths(&name, &args, &mut files_read, &mut files_written);

                                if name == "apply_patch" {
                                    if let Some((path, added, removed)) = parse_patch(&args) {
                                        let fe_id = FileEdit::id_for(
                                            &Message::id_for(&conv_id, message_index),
                                            edit_ordinal,
                                            &path,
                                        );
                                        edit_ordinal += 1;
                                        counters.lines_added += added;
                                        counters.lines_removed += removed;
                                        file_edits.push(FileEdit {
                                            id: fe_id,
                                            message_id: Message::id_for(&conv_id, message_index),
                                            conversation_id: conv_id.clone(),
                                            file_path: path.clone(),
                                            edit_type: crate::model::EditType::Modify,
                                            lines_added: added,
                                            lines_removed: removed,
                                            start_line: None,
                                            end_line: None,
                                        });
                                        files_written.push(path);
                                    }
                                }

                                let msg_id = Message::id_for(&conv_id, message_index);
                                messages.push(Message {
                                    id: msg_id.clone(),
                                    conversation_id: conv_id.clone(),
                                    role: Role::Assistant,
                                    content: render_tool_block(&name, &args_json, &output),
                                    timestamp: ts,
                                    message_index,
                                    counters: Counters::default(),
                                    vector: Message::placeholder_vector(),
                                });
                                message_index += 1;

                                tool_calls.push(ToolCall {
                                    id: ToolCall::id_for(&msg_id, call_id),
                                    message_id: msg_id,
                                    conversation_id: conv_id.clone(),
                                    tool_type: name,
                                    input: args_json,
                                    output: Some(output),
                                    file_path,
                                });
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        if messages.is_empty() {
            return None;
        }

        let mut files: Vec<ConversationFile> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for p in &files_written {
            if seen.insert((p.clone(), FileRole::Edited)) {
                files.push(ConversationFile {
                    id: format!("{conv_id}:file:edited:{p}"),
                    conversation_id: conv_id.clone(),
                    file_path: p.clone(),
                    role: FileRole::Edited,
                });
            }
        }
        for p in &files_read {
            if seen.insert((p.clone(), FileRole::Context)) {
                files.push(ConversationFile {
                    id: format!("{conv_id}:file:context:{p}"),
                    conversation_id: conv_id.clone(),
                    file_path: p.clone(),
                    role: FileRole::Context,
                });
            }
        }

        for m in &messages {
            counters.add(&m.counters);
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: conv_id.clone(),
            source: Source::Codex,
            title: String::new(),
            subtitle: None,
            workspace_path: workspace_path.clone(),
            project_name: paths::project_name(&workspace_path),
            model: current_model.unwrap_or_default(),
            mode: Mode::Agent,
            created_at: started_at.unwrap_or(now),
            updated_at: messages.last().and_then(|m| m.timestamp).unwrap_or(now),
            message_count: messages.len() as u32,
            source_ref: SourceRef {
                source: Source::Codex,
                workspace_path,
                original_id: raw.raw_id.clone(),
                vendor_db_path: raw.location.vendor_db_path.to_string_lossy().to_string(),
            },
            counters,
        };

        Some(NormalizedConversation {
            conversation,
            messages,
            tool_calls,
            files,
            message_files: Vec::new(),
            file_edits,
        })
    }
}

fn mtime_of(path: &Path) -> Option<f64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let dur = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(dur.as_secs_f64())
}

fn peek_cwd(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let reader = std::io::BufReader::new(file);
    for line in reader.lines().map_while(|l| l.ok()) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
            if v.get("type").and_then(|t| t.as_str()) == Some("session_meta") {
                return v
                    .get("payload")
                    .and_then(|p| p.get("cwd"))
                    .and_then(|c| c.as_str())
                    .map(|s| s.to_string());
            }
        }
        break;
    }
    None
}

fn clean_user_message(msg: &str) -> String {
    let mut text = msg.to_string();
    while let Some(start) = text.find("<context ref=\"") {
        if let Some(end) = text[start..].find("</context>") {
            text = format!("{}{}", &text[..start], &text[start + end + "</context>".len()..]);
        } else {
            break;
        }
    }
    while let Some(start) = text.find("[@") {
        if let Some(paren_end) = text[start..].find(')') {
            text = format!("{}{}", &text[..start], text[start + paren_end + 1..].trim_start());
        } else {
            break;
        }
    }
    text.trim().to_string()
}

fn extract_shell_paths(
    name: &str,
    args: &Value,
    files_read: &mut Vec<String>,
    files_written: &mut Vec<String>,
) -> Option<String> {
    if name != "shell" {
        if name == "read_file" {
            return args.get("path").and_then(|p| p.as_str()).map(|s| s.to_string());
        }
        if name == "write_file" {
            let path = args.get("path").and_then(|p| p.as_str()).map(|s| s.to_string());
            if let Some(p) = &path {
                files_written.push(p.clone());
            }
            return path;
        }
        return None;
    }

    let cmd = args
        .get("command")
        .map(|c| {
            if let Some(arr) = c.as_array() {
                arr.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>().join(" ")
            } else {
                c.as_str().unwrap_or("").to_string()
            }
        })
        .unwrap_or_default();

    for pat in ["cat ", "less ", "head ", "tail ", "bat "] {
        if let Some(idx) = cmd.find(pat) {
            let rest = &cmd[idx + pat.len()..];
            let path = rest.trim_start_matches(|c: char| c == '\'' || c == '"');
            let end = path
                .find(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == '|' || c == '>')
                .unwrap_or(path.len());
            if end > 0 {
                let p = path[..end].to_string();
                files_read.push(p.clone());
                return Some(p);
            }
        }
    }
    None
}

/// Very small `apply_patch`-style diff reader: counts `+`/`-` lines and
/// pulls the file path from a `*** Update File: <path>` or similar header.
/// Not a full patch parser — good enough to populate `FileEdit` counters.
fn parse_patch(args: &Value) -> Option<(String, u64, u64)> {
    let patch = args.get("patch").and_then(|p| p.as_str())?;
    let path = patch
        .lines()
        .find_map(|l| {
            l.strip_prefix("*** Update File: ")
                .or_else(|| l.strip_prefix("*** Add File: "))
        })
        .map(|s| s.trim().to_string())?;
    let mut added = 0u64;
    let mut removed = 0u64;
    for line in patch.lines() {
        if line.starts_with("+++") || line.starts_with("---") || line.starts_with("***") {
            continue;
        }
        if let Some(stripped) = line.strip_prefix('+') {
            if !stripped.is_empty() || line == "+" {
                added += 1;
            }
        } else if let Some(stripped) = line.strip_prefix('-') {
            if !stripped.is_empty() || line == "-" {
                removed += 1;
            }
        }
    }
    Some((path, added, removed))
}

fn render_tool_block(name: &str, args_json: &str, output: &str) -> String {
    let args: Value = serde_json::from_str(args_json).unwrap_or(Value::Null);
    let summary = match name {
        "shell" => args
            .get("command")
            .map(|c| {
                if let Some(arr) = c.as_array() {
                    arr.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>().join(" ")
                } else {
                    c.as_str().unwrap_or("").to_string()
                }
            })
            .unwrap_or_default(),
        _ => args_json.to_string(),
    };
    let truncated_output = if output.len() > 4000 { &output[..4000] } else { output };
    format!(
        "\n---\n**Function call: {name}** {summary}\n```\n{truncated_output}\n```\n---\n"
    )
}

#[allow(dead_code)]
fn io_err(path: &Path, reason: impl Into<String>) -> DexError {
    DexError::CorruptRecord {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(record_type: &str, ts: &str, payload: Value) -> Value {
        serde_json::json!({ "type": record_type, "timestamp": ts, "payload": payload })
    }

    fn raw(records: Vec<Value>, workspace: &str) -> RawConversation {
        RawConversation {
            raw_id: "s1".into(),
            location: SourceLocation {
                source: Source::Codex,
                workspace_path: workspace.into(),
                vendor_db_path: PathBuf::from("/tmp/rollout-x.jsonl"),
                mtime: 0.0,
            },
            payload: Value::Array(records),
        }
    }

    #[test]
    fn normalizes_user_and_assistant_turns() {
        let records = vec![
            make_record("session_meta", "2025-01-15T10:00:00Z", serde_json::json!({"id": "s1", "cwd": "/proj"})),
            make_record("event_msg", "2025-01-15T10:00:01Z", serde_json::json!({"type": "user_message", "message": "hello"})),
            make_record("response_item", "2025-01-15T10:00:02Z", serde_json::json!({
                "type": "message", "role": "assistant",
                "content": [{"type": "output_text", "text": "hi there"}]
            })),
        ];
        let adapter = CodexAdapter;
        let norm = adapter.normalize(&raw(records, "/proj")).unwrap();
        assert_eq!(norm.messages.len(), 2);
        assert_eq!(norm.conversation.source, Source::Codex);
        assert_eq!(norm.conversation.workspace_path, "/proj");
    }

    #[test]
    fn empty_session_normalizes_to_none() {
        let records = vec![make_record("session_meta", "2025-01-15T10:00:00Z", serde_json::json!({"id": "s1", "cwd": "/proj"}))];
        let adapter = CodexAdapter;
        assert!(adapter.normalize(&raw(records, "/proj")).is_none());
    }

    #[test]
    fn user_message_strips_context_blocks() {
        let cleaned = clean_user_message("do this <context ref=\"f.rs\">stuff</context> please");
        assert!(!cleaned.contains("<context"));
        assert!(cleaned.contains("do this"));
        assert!(cleaned.contains("please"));
    }

    #[test]
    fn function_call_produces_tool_call_row() {
        let records = vec![
            make_record("session_meta", "2025-01-15T10:00:00Z", serde_json::json!({"id": "s1", "cwd": "/proj"})),
            make_record("event_msg", "2025-01-15T10:00:01Z", serde_json::json!({"type": "user_message", "message": "ls files"})),
            make_record("response_item", "2025-01-15T10:00:02Z", serde_json::json!({
                "type": "function_call", "call_id": "c1", "name": "shell", "arguments": "{\"command\":\"ls\"}"
            })),
            make_record("response_item", "2025-01-15T10:00:03Z", serde_json::json!({
                "type": "function_call_output", "call_id": "c1", "output": "file1\nfile2"
            })),
        ];
        let adapter = CodexAdapter;
        let norm = adapter.normalize(&raw(records, "/proj")).unwrap();
        assert_eq!(norm.tool_calls.len(), 1);
        assert_eq!(norm.tool_calls[0].tool_type, "shell");
    }

    #[test]
    fn apply_patch_produces_file_edit() {
        let patch = "*** Begin Patch\n*** Update File: src/lib.rs\n+fn new() {}\n-fn old() {}\n*** End Patch";
        let records = vec![
            make_record("session_meta", "2025-01-15T10:00:00Z", serde_json::json!({"id": "s1", "cwd": "/proj"})),
            make_record("event_msg", "2025-01-15T10:00:01Z", serde_json::json!({"type": "user_message", "message": "edit it"})),
            make_record("response_item", "2025-01-15T10:00:02Z", serde_json::json!({
                "type": "function_call", "call_id": "c1", "name": "apply_patch",
                "arguments": serde_json::json!({"patch": patch}).to_string()
            })),
            make_record("response_item", "2025-01-15T10:00:03Z", serde_json::json!({
                "type": "function_call_output", "call_id": "c1", "output": "Done"
            })),
        ];
        let adapter = CodexAdapter;
        let norm = adapter.normalize(&raw(records, "/proj")).unwrap();
        assert_eq!(norm.file_edits.len(), 1);
        assert_eq!(norm.file_edits[0].file_path, "src/lib.rs");
        assert_eq!(norm.file_edits[0].lines_added, 1);
        assert_eq!(norm.file_edits[0].lines_removed, 1);
    }
}
