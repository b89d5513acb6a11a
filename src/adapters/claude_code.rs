//! Adapter C: Claude Code's per-session JSONL transcripts (§4.1, §6).
//!
//! Each session is one file under `~/.claude/projects/<encoded-path>/`,
//! named `<uuid>.jsonl`. Records are flat `{type, sessionId, timestamp,
//! cwd, message}` objects — `type` is `"user"` or `"assistant"`, and
//! `message` carries an Anthropic-shaped `{role, content, model, usage}`
//! body. Structurally very close to Codex's envelope but keyed by
//! `sessionId` instead of a typed `type`/`payload` split.
//!
//! Correlates `tool_use` blocks to their `tool_result` by id via a
//! `pending_tools` map, then emits `model::Message`/`model::ToolCall`/
//! `model::FileEdit` rows per turn.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::adapters::{
    NormalizedConversation, ProgressCb, RawConversation, SourceAdapter, SourceLocation,
};
use crate::error::Result;
use crate::model::{
    Conversation, ConversationFile, Counters, EditType, FileEdit, FileRole, Message, MessageFile,
    Mode, Role, Source, SourceRef, ToolCall, conversation_id,
};
use crate::paths;

pub struct ClaudeCodeAdapter;

impl SourceAdapter for ClaudeCodeAdapter {
    fn source(&self) -> Source {
        Source::ClaudeCode
    }

    fn detect(&self) -> bool {
        paths::default_source_root(Source::ClaudeCode).is_some()
    }

    fn discover(&self) -> Vec<SourceLocation> {
        let Some(root) = paths::default_source_root(Source::ClaudeCode) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "jsonl") {
                continue;
            }
            let mtime = mtime_of(path).unwrap_or(0.0);
            let workspace_path = peek_cwd(path).unwrap_or_default();
            out.push(SourceLocation {
                source: Source::ClaudeCode,
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
        let lines: Vec<String> = reader.lines().map(|l| l.unwrap_or_default()).collect();
        let total = lines.len();
        let mut records = Vec::new();
        for (i, line) in lines.into_iter().enumerate() {
            progress(i + 1, total);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(v) => records.push(v),
                Err(_) => continue,
            }
        }

        let session_id = records
            .first()
            .and_then(|r| r.get("sessionId"))
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
        let conv_id = conversation_id(Source::ClaudeCode, &raw.raw_id);

        let mut workspace_path = raw.location.workspace_path.clone();
        let mut started_at: Option<DateTime<Utc>> = None;
        let mut current_model: Option<String> = None;
        let mut pending_tools: HashMap<String, (String, Value)> = HashMap::new();
        let mut messages: Vec<Message> = Vec::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut message_files: Vec<MessageFile> = Vec::new();
        let mut file_edits: Vec<FileEdit> = Vec::new();
        let mut files_edited_session: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut counters = Counters::default();
        let mut message_index: u32 = 0;
        let mut edit_ordinal: u32 = 0;

        for raw_record in records {
            let record: SessionRecord = match serde_json::from_value(raw_record.clone()) {
                Ok(r) => r,
                Err(_) => continue,
            };

            let ts = parse_timestamp(&record.timestamp);
            if started_at.is_none() {
                started_at = ts;
                workspace_path = record.cwd.clone();
            }

            match record.record_type.as_str() {
                "user" => {
                    if record.is_meta.unwrap_or(false) {
                        continue;
                    }
                    normalize_user_record(
                        &record.message,
                        ts,
                        &conv_id,
                        &mut message_index,
                        &mut edit_ordinal,
                        &mut messages,
                        &mut tool_calls,
                        &mut message_files,
                        &mut file_edits,
                        &mut files_edited_session,
                        &mut pending_tools,
                    );
                }
                "assistant" => {
                    normalize_assistant_record(
                        &record.message,
                        ts,
                        &conv_id,
                        &mut message_index,
                        &mut messages,
                        &mut current_model,
                        &mut pending_tools,
                    );
                }
                _ => {}
            }
        }

        if messages.is_empty() {
            return None;
        }

        let files: Vec<ConversationFile> = files_edited_session
            .iter()
            .map(|p| ConversationFile {
                id: format!("{conv_id}:file:edited:{p}"),
                conversation_id: conv_id.clone(),
                file_path: p.clone(),
                role: FileRole::Edited,
            })
            .collect();

        for m in &messages {
            counters.add(&m.counters);
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: conv_id.clone(),
            source: Source::ClaudeCode,
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
                source: Source::ClaudeCode,
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
            message_files,
            file_edits,
        })
    }
}

#[derive(Deserialize)]
struct SessionRecord {
    #[serde(rename = "type")]
    record_type: String,
    timestamp: String,
    #[serde(default)]
    cwd: String,
    #[serde(rename = "isMeta")]
    is_meta: Option<bool>,
    message: Value,
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
    let first = reader.lines().map_while(|l| l.ok()).find(|l| !l.trim().is_empty())?;
    let v: Value = serde_json::from_str(first.trim()).ok()?;
    v.get("cwd").and_then(|c| c.as_str()).map(|s| s.to_string())
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>().ok()
}

#[allow(clippy::too_many_arguments)]
fn normalize_user_record(
    message: &Value,
    ts: Option<DateTime<Utc>>,
    conv_id: &str,
    message_index: &mut u32,
    edit_ordinal: &mut u32,
    messages: &mut Vec<Message>,
    tool_calls: &mut Vec<ToolCall>,
    message_files: &mut Vec<MessageFile>,
    file_edits: &mut Vec<FileEdit>,
    files_edited_session: &mut std::collections::HashSet<String>,
    pending_tools: &mut HashMap<String, (String, Value)>,
) {
    let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("");
    if role != "user" {
        return;
    }

    let content = &message["content"];
    let mut text_parts = Vec::new();

    if let Some(text) = content.as_str() {
        if !text.starts_with('<') {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                text_parts.push(trimmed.to_string());
            }
        }
    } else if let Some(arr) = content.as_array() {
        for block in arr {
            let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
            match block_type {
                "text" => {
                    let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                    if text.starts_with('<') {
                        continue;
                    }
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        text_parts.push(trimmed.to_string());
                    }
                }
                "tool_result" => {
                    let tool_use_id = block.get("tool_use_id").and_then(|t| t.as_str()).unwrap_or("").to_string();
                    let is_error = block.get("is_error").and_then(|e| e.as_bool()).unwrap_or(false);

                    if let Some((name, input)) = pending_tools.remove(&tool_use_id) {
                        let file_path = input.get("file_path").and_then(|f| f.as_str()).map(|s| s.to_string());

                        let msg_id = Message::id_for(conv_id, *message_index);

                        if let (Some(path), false) = (&file_path, is_error) {
                            let role = match name.as_str() {
                                "Read" => Some(FileRole::Context),
                                "Write" | "Edit" => Some(FileRole::Edited),
                                _ => None,
                            };
                            if let Some(role) = role {
                                message_files.push(MessageFile {
                                    id: format!("{msg_id}:file:{path}"),
                                    message_id: msg_id.clone(),
                                    conversation_id: conv_id.to_string(),
                                    file_path: path.clone(),
                                    role,
                                });
                                if matches!(role, FileRole::Edited) {
                                    files_edited_session.insert(path.clone());
                                    let output_text = block
                                        .get("content")
                                        .and_then(|c| c.as_str())
                                        .unwrap_or("");
                                    let (added, removed) = count_diff_lines(output_text);
                                    let fe_id = FileEdit::id_for(&msg_id, *edit_ordinal, path);
                                    *edit_ordinal += 1;
                                    file_edits.push(FileEdit {
                                        id: fe_id,
                                        message_id: msg_id.clone(),
                                        conversation_id: conv_id.to_string(),
                                        file_path: path.clone(),
                                        edit_type: if name == "Write" { EditType::Create } else { EditType::Modify },
                                        lines_added: added,
                                        lines_removed: removed,
                                        start_line: None,
                                        end_line: None,
                                    });
                                }
                            }
                        }

                        tool_calls.push(ToolCall {
                            id: ToolCall::id_for(&msg_id, &tool_use_id),
                            message_id: msg_id,
                            conversation_id: conv_id.to_string(),
                            tool_type: name.clone(),
                            input: serde_json::to_string(&input).unwrap_or_default(),
                            output: block.get("content").and_then(|c| c.as_str()).map(|s| s.to_string()),
                            file_path,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    if !text_parts.is_empty() {
        messages.push(Message {
            id: Message::id_for(conv_id, *message_index),
            conversation_id: conv_id.to_string(),
            role: Role::User,
            content: text_parts.join("\n\n"),
            timestamp: ts,
            message_index: *message_index,
            counters: Counters::default(),
            vector: Message::placeholder_vector(),
        });
        *message_index += 1;
    }
}

fn normalize_assistant_record(
    message: &Value,
    ts: Option<DateTime<Utc>>,
    conv_id: &str,
    message_index: &mut u32,
    messages: &mut Vec<Message>,
    current_model: &mut Option<String>,
    pending_tools: &mut HashMap<String, (String, Value)>,
) {
    let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("");
    if role != "assistant" {
        return;
    }

    if let Some(m) = message.get("model").and_then(|m| m.as_str()) {
        if m != "<synthetic>" {
            *current_model = Some(m.to_string());
        }
    }

    let msg_counters = message
        .get("usage")
        .map(|usage| Counters {
            input_tokens: usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            cache_creation_tokens: usage
                .get("cache_creation_input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            cache_read_tokens: usage
                .get("cache_read_input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            lines_added: 0,
            lines_removed: 0,
        })
        .unwrap_or_default();

    let mut text_parts = Vec::new();

    if let Some(content_arr) = message.get("content").and_then(|c| c.as_array()) {
        for block in content_arr {
            let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
            match block_type {
                "text" => {
                    let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        text_parts.push(trimmed.to_string());
                    }
                }
                "tool_use" => {
                    let id = block.get("id").and_then(|i| i.as_str()).unwrap_or("").to_string();
                    let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Object(Default::default()));
                    pending_tools.insert(id, (name.clone(), input.clone()));
                    text_parts.push(format!("**Tool call: {}** {}", name, format_tool_input(&name, &input)));
                }
                _ => {}
            }
        }
    }

    if !text_parts.is_empty() {
        messages.push(Message {
            id: Message::id_for(conv_id, *message_index),
            conversation_id: conv_id.to_string(),
            role: Role::Assistant,
            content: text_parts.join("\n\n"),
            timestamp: ts,
            message_index: *message_index,
            counters: msg_counters,
            vector: Message::placeholder_vector(),
        });
        *message_index += 1;
    }
}

/// Unified-diff-style `+`/`-` line counter, used for `tool_result` content
/// that quotes the old/new file body rather than a patch (Claude Code's
/// `Edit`/`Write` tool results do this).
fn count_diff_lines(content: &str) -> (u64, u64) {
    let mut added = 0u64;
    let mut removed = 0u64;
    for line in content.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            added += 1;
        } else if line.starts_with('-') {
            removed += 1;
        }
    }
    (added, removed)
}

/// Per-tool human-readable summaries, folded directly into message content
/// since dex stores tool calls as both a typed `ToolCall` row and inline
/// text (§6's fenced tool-output block convention).
fn format_tool_input(tool_name: &str, input: &Value) -> String {
    match tool_name {
        "Bash" => {
            let cmd = input.get("command").and_then(|c| c.as_str()).unwrap_or("");
            let truncated = if cmd.len() > 200 { format!("{}...", &cmd[..200]) } else { cmd.to_string() };
            truncated.replace('\n', " \u{21b5} ")
        }
        "Read" | "Write" | "Edit" => {
            let path = input.get("file_path").and_then(|p| p.as_str()).unwrap_or("");
            format!("file=\"{path}\"")
        }
        "Glob" | "Grep" => {
            let pattern = input.get("pattern").and_then(|p| p.as_str()).unwrap_or("");
            let path = input.get("path").and_then(|p| p.as_str());
            match path {
                Some(p) => format!("pattern=\"{pattern}\" path=\"{p}\""),
                None => format!("pattern=\"{pattern}\""),
            }
        }
        "Task" => {
            let subagent = input.get("subagent_type").and_then(|s| s.as_str()).unwrap_or("");
            let desc = input.get("description").and_then(|d| d.as_str()).unwrap_or("");
            format!("{subagent}: \"{desc}\"")
        }
        "WebFetch" => {
            let url = input.get("url").and_then(|u| u.as_str()).unwrap_or("");
            format!("url=\"{url}\"")
        }
        "WebSearch" => {
            let query = input.get("query").and_then(|q| q.as_str()).unwrap_or("");
            format!("query=\"{query}\"")
        }
        _ => {
            let s = serde_json::to_string(input).unwrap_or_default();
            if s.len() > 150 { format!("{}...", &s[..150]) } else { s }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn raw(records: Vec<Value>, workspace: &str) -> RawConversation {
        RawConversation {
            raw_id: "sess-1".into(),
            location: SourceLocation {
                source: Source::ClaudeCode,
                workspace_path: workspace.into(),
                vendor_db_path: PathBuf::from("/tmp/sess-1.jsonl"),
                mtime: 0.0,
            },
            payload: Value::Array(records),
        }
    }

    #[test]
    fn normalizes_user_and_assistant_turns() {
        let records = vec![
            serde_json::json!({"type": "user", "sessionId": "sess-1", "timestamp": "2025-01-15T10:00:00Z", "cwd": "/proj", "message": {"role": "user", "content": "hello"}}),
            serde_json::json!({"type": "assistant", "sessionId": "sess-1", "timestamp": "2025-01-15T10:00:01Z", "cwd": "/proj", "message": {"role": "assistant", "model": "claude-opus", "content": [{"type": "text", "text": "hi"}]}}),
        ];
        let adapter = ClaudeCodeAdapter;
        let norm = adapter.normalize(&raw(records, "/proj")).unwrap();
        assert_eq!(norm.messages.len(), 2);
        assert_eq!(norm.conversation.model, "claude-opus");
    }

    #[test]
    fn conversation_counters_equal_sum_over_messages_not_double() {
        let records = vec![
            serde_json::json!({"type": "user", "sessionId": "sess-1", "timestamp": "2025-01-15T10:00:00Z", "cwd": "/proj", "message": {"role": "user", "content": "hello"}}),
            serde_json::json!({"type": "assistant", "sessionId": "sess-1", "timestamp": "2025-01-15T10:00:01Z", "cwd": "/proj", "message": {
                "role": "assistant", "model": "claude-opus", "content": [{"type": "text", "text": "hi"}],
                "usage": {"input_tokens": 10, "output_tokens": 20, "cache_creation_input_tokens": 1, "cache_read_input_tokens": 2}
            }}),
        ];
        let adapter = ClaudeCodeAdapter;
        let norm = adapter.normalize(&raw(records, "/proj")).unwrap();
        assert_eq!(norm.conversation.counters.input_tokens, 10);
        assert_eq!(norm.conversation.counters.output_tokens, 20);
        assert_eq!(norm.conversation.counters.cache_creation_tokens, 1);
        assert_eq!(norm.conversation.counters.cache_read_tokens, 2);
    }

    #[test]
    fn tool_use_and_result_produce_tool_call_and_file_edit() {
        let records = vec![
            serde_json::json!({"type": "user", "sessionId": "sess-1", "timestamp": "2025-01-15T10:00:00Z", "cwd": "/proj", "message": {"role": "user", "content": "edit the file"}}),
            serde_json::json!({"type": "assistant", "sessionId": "sess-1", "timestamp": "2025-01-15T10:00:01Z", "cwd": "/proj", "message": {
                "role": "assistant", "content": [{"type": "tool_use", "id": "t1", "name": "Edit", "input": {"file_path": "src/a.rs"}}]
            }}),
            serde_json::json!({"type": "user", "sessionId": "sess-1", "timestamp": "2025-01-15T10:00:02Z", "cwd": "/proj", "message": {
                "role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "is_error": false, "content": "+new line\n-old line"}]
            }}),
        ];
        let adapter = ClaudeCodeAdapter;
        let norm = adapter.normalize(&raw(records, "/proj")).unwrap();
        assert_eq!(norm.tool_calls.len(), 1);
        assert_eq!(norm.file_edits.len(), 1);
        assert_eq!(norm.file_edits[0].lines_added, 1);
        assert_eq!(norm.file_edits[0].lines_removed, 1);
    }

    #[test]
    fn meta_records_are_skipped() {
        let records = vec![
            serde_json::json!({"type": "user", "sessionId": "sess-1", "timestamp": "2025-01-15T10:00:00Z", "cwd": "/proj", "isMeta": true, "message": {"role": "user", "content": "system init"}}),
        ];
        let adapter = ClaudeCodeAdapter;
        assert!(adapter.normalize(&raw(records, "/proj")).is_none());
    }

    #[test]
    fn format_tool_input_handles_bash() {
        let input = serde_json::json!({"command": "ls -la"});
        assert_eq!(format_tool_input("Bash", &input), "ls -la");
    }
}
