//! Retrieval & formatting (C9): message reconstruction, tool-output
//! stripping, outline rendering, expand windows, token-budget truncation
//! (§4.9).

use rusqlite::Connection;

use crate::error::Result;
use crate::model::{Conversation, Message, Role};
use crate::repo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Full,
    Stripped,
    UserOnly,
    Outline,
}

#[derive(Debug, Clone)]
pub struct ExpandWindow {
    pub message_index: u32,
    pub before: u32,
    pub after: u32,
}

impl ExpandWindow {
    pub fn around(message_index: u32) -> Self {
        Self { message_index, before: 2, after: 2 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub format: Option<Format>,
    pub expand: Option<ExpandWindow>,
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FormattedMessage {
    pub message_index: u32,
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct RetrievedConversation {
    pub conversation: Conversation,
    pub messages: Vec<FormattedMessage>,
    pub has_more_before: bool,
    pub has_more_after: bool,
    pub truncated: bool,
}

/// `get(ids, options)` (§4.10 tool interface, §4.9 formatting rules).
/// Unknown ids are silently skipped — callers can diff `ids` against the
/// returned conversation ids to detect misses.
pub fn get(conn: &Connection, ids: &[String], options: &GetOptions) -> Result<Vec<RetrievedConversation>> {
    let format = options.format.unwrap_or(Format::Full);
    let mut out = Vec::with_capacity(ids.len());

    for id in ids {
        let Some(conversation) = repo::conversation_by_id(conn, id)? else { continue };
        let all_messages = repo::messages_by_conversation(conn, id)?;

        let (window, has_more_before, has_more_after) = match &options.expand {
            Some(expand) => apply_expand_window(&all_messages, expand),
            None => (all_messages, false, false),
        };

        let window: Vec<Message> = if format == Format::UserOnly {
            window.into_iter().filter(|m| m.role == Role::User).collect()
        } else {
            window
        };

        let mut formatted: Vec<FormattedMessage> = window.iter().map(|m| format_message(m, format)).collect();

        let truncated = match options.max_tokens {
            Some(budget) => apply_token_budget(&mut formatted, &window, budget),
            None => false,
        };

        out.push(RetrievedConversation { conversation, messages: formatted, has_more_before, has_more_after, truncated });
    }

    Ok(out)
}

fn apply_expand_window(messages: &[Message], expand: &ExpandWindow) -> (Vec<Message>, bool, bool) {
    let lo = expand.message_index.saturating_sub(expand.before);
    let hi = expand.message_index + expand.after;
    let window: Vec<Message> = messages
        .iter()
        .filter(|m| m.message_index >= lo && m.message_index <= hi)
        .cloned()
        .collect();
    let has_more_before = messages.iter().any(|m| m.message_index < lo);
    let has_more_after = messages.iter().any(|m| m.message_index > hi);
    (window, has_more_before, has_more_after)
}

fn format_message(m: &Message, format: Format) -> FormattedMessage {
    let content = match format {
        Format::Full | Format::UserOnly => m.content.clone(),
        Format::Stripped => strip_tool_blocks(&m.content),
        Format::Outline => outline_line(m),
    };
    FormattedMessage { message_index: m.message_index, role: m.role, content }
}

/// Per-message token estimate: stored counters when present, else
/// `ceil(chars/4)` (§4.9).
pub fn estimate_tokens(m: &Message) -> u64 {
    let stored = m.counters.input_tokens
        + m.counters.output_tokens
        + m.counters.cache_creation_tokens
        + m.counters.cache_read_tokens;
    if stored > 0 {
        stored
    } else {
        let chars = m.content.chars().count() as u64;
        chars.div_ceil(4)
    }
}

fn outline_line(m: &Message) -> String {
    let role = match m.role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
    };
    let first_line: String = m.content.lines().next().unwrap_or("").chars().take(60).collect();
    let stored = m.counters.input_tokens
        + m.counters.output_tokens
        + m.counters.cache_creation_tokens
        + m.counters.cache_read_tokens;
    let tokens = if stored > 0 { format_token_count(stored) } else { "tokens N/A".to_string() };
    format!("[{role}] {first_line} ({tokens})")
}

fn format_token_count(n: u64) -> String {
    if n >= 1000 {
        format!("{:.1}K tokens", n as f64 / 1000.0)
    } else {
        format!("{n} tokens")
    }
}

/// Truncate the message list from the tail once `max_tokens` of budget is
/// exhausted. The message straddling the boundary is kept, truncated, and
/// suffixed with `"\n... (truncated)"` when at least 100 tokens of budget
/// remain for it; otherwise it is dropped outright (§4.9).
fn apply_token_budget(formatted: &mut Vec<FormattedMessage>, source: &[Message], max_tokens: u64) -> bool {
    let mut budget = max_tokens;
    let mut kept = Vec::with_capacity(formatted.len());
    let mut truncated_any = false;

    for (fm, m) in formatted.iter().zip(source.iter()) {
        let tokens = estimate_tokens(m);
        if tokens <= budget {
            budget -= tokens;
            kept.push(fm.clone());
            continue;
        }
        if budget >= 100 {
            let max_chars = (budget * 4) as usize;
            let mut content: String = fm.content.chars().take(max_chars).collect();
            content.push_str("\n... (truncated)");
            kept.push(FormattedMessage { message_index: fm.message_index, role: fm.role, content });
        }
        truncated_any = true;
        break;
    }

    *formatted = kept;
    truncated_any
}

/// Strips inline tool-output blocks from assistant message content (§6,
/// §8 property 7). The fenced block is delimited by a `---` line, a
/// `**label**` line, a fence of 3 or 4 backticks, arbitrary content, and a
/// matching closing fence of the same length followed by another `---`
/// line.
///
/// Hand-rolled rather than a single regex: the wire format requires the
/// closing fence to match the opening fence's exact backtick count, a
/// backreference the `regex` crate's finite-automaton engine cannot
/// express.
pub fn strip_tool_blocks(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut i = 0;

    while i < lines.len() {
        if lines[i] == "---" && i + 2 < lines.len() && is_label_line(lines[i + 1]) {
            if let Some(fence_len) = fence_length(lines[i + 2]) {
                if let Some(close_rel) = find_closing_fence(&lines[i + 3..], fence_len) {
                    let close_idx = i + 3 + close_rel;
                    let end = if close_idx + 1 < lines.len() && lines[close_idx + 1] == "---" {
                        close_idx + 1
                    } else {
                        close_idx
                    };
                    i = end + 1;
                    continue;
                }
            }
        }
        out.push(lines[i]);
        i += 1;
    }

    out.join("\n").trim().to_string()
}

fn is_label_line(line: &str) -> bool {
    line.starts_with("**") && line[2..].contains("**")
}

fn fence_length(line: &str) -> Option<usize> {
    if (3..=4).contains(&line.len()) && !line.is_empty() && line.chars().all(|c| c == '`') {
        Some(line.len())
    } else {
        None
    }
}

fn find_closing_fence(lines: &[&str], fence_len: usize) -> Option<usize> {
    let fence = "`".repeat(fence_len);
    lines.iter().position(|l| *l == fence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Counters;

    fn msg(idx: u32, role: Role, content: &str) -> Message {
        Message {
            id: format!("c:{idx}"),
            conversation_id: "c".into(),
            role,
            content: content.to_string(),
            timestamp: None,
            message_index: idx,
            counters: Counters::default(),
            vector: Message::placeholder_vector(),
        }
    }

    #[test]
    fn strip_tool_blocks_removes_fenced_block() {
        let content = "before\n---\n**Bash**\n```\nls -la\ntotal 0\n```\n---\nafter";
        let stripped = strip_tool_blocks(content);
        assert_eq!(stripped, "before\nafter");
    }

    #[test]
    fn strip_tool_blocks_respects_four_backtick_fence() {
        let content = "before\n---\n**Write**\n````\ncontent with ``` inside\n````\n---\nafter";
        let stripped = strip_tool_blocks(content);
        assert_eq!(stripped, "before\nafter");
    }

    #[test]
    fn strip_tool_blocks_leaves_unfenced_content_untouched() {
        let content = "just plain text\nno tool blocks here";
        assert_eq!(strip_tool_blocks(content), content);
    }

    #[test]
    fn outline_line_truncates_first_line_to_60_chars() {
        let long = "x".repeat(100);
        let m = msg(0, Role::User, &long);
        let line = outline_line(&m);
        assert!(line.starts_with("[User] "));
        assert!(line.contains("tokens N/A"));
    }

    #[test]
    fn estimate_tokens_falls_back_to_char_estimate() {
        let m = msg(0, Role::User, "12345678");
        assert_eq!(estimate_tokens(&m), 2);
    }

    #[test]
    fn estimate_tokens_prefers_stored_counters() {
        let mut m = msg(0, Role::User, "hi");
        m.counters.input_tokens = 10;
        m.counters.output_tokens = 5;
        assert_eq!(estimate_tokens(&m), 15);
    }

    #[test]
    fn estimate_tokens_includes_cache_counters() {
        let mut m = msg(0, Role::User, "hi");
        m.counters.input_tokens = 10;
        m.counters.output_tokens = 5;
        m.counters.cache_creation_tokens = 2;
        m.counters.cache_read_tokens = 3;
        assert_eq!(estimate_tokens(&m), 20);
    }

    #[test]
    fn apply_expand_window_clips_and_flags_more() {
        let messages: Vec<Message> = (0..10).map(|i| msg(i, Role::User, "x")).collect();
        let (window, before, after) = apply_expand_window(&messages, &ExpandWindow::around(5));
        assert_eq!(window.len(), 5);
        assert!(before);
        assert!(after);
    }

    #[test]
    fn apply_token_budget_truncates_when_budget_allows() {
        let mut m = msg(0, Role::Assistant, &"word ".repeat(200));
        m.counters.output_tokens = 0;
        let formatted = vec![format_message(&m, Format::Full)];
        let mut formatted = formatted;
        let truncated = apply_token_budget(&mut formatted, &[m], 150);
        assert!(truncated);
        assert!(formatted[0].content.ends_with("\n... (truncated)"));
    }

    #[test]
    fn apply_token_budget_drops_message_when_budget_too_small() {
        let m = msg(0, Role::Assistant, &"word ".repeat(200));
        let formatted = vec![format_message(&m, Format::Full)];
        let mut formatted = formatted;
        let truncated = apply_token_budget(&mut formatted, &[m], 10);
        assert!(truncated);
        assert!(formatted.is_empty());
    }
}
