//! Tool interface (C10): a JSON-RPC-style stdio transport exposing
//! `stats`, `list`, `search`, and `get` as a small set of request/response
//! pairs over stdin/stdout, one JSON object per line (§4.10).
//!
//! Read-line/parse/dispatch/write-response, the same shape as any
//! line-delimited JSON-RPC server, generalized from a tools/list +
//! tools/call envelope to dex's four named operations.

use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, Write};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::Config;
use crate::embed::EmbeddingClient;
use crate::error::{DexError, Result};
use crate::model::{Conversation, Source};
use crate::repo::{self, ListFilter};
use crate::retrieval::{self, GetOptions};
use crate::search::{self, SearchOutcome};
use crate::store::Store;

#[derive(Debug, Deserialize, Default)]
struct ListParams {
    project: Option<String>,
    source: Option<String>,
    from: Option<String>,
    to: Option<String>,
    #[serde(default = "default_list_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_list_limit() -> usize {
    20
}

#[derive(Debug, Deserialize, Default)]
struct SearchParams {
    query: String,
    file: Option<String>,
    project: Option<String>,
    source: Option<String>,
    from: Option<String>,
    to: Option<String>,
    #[serde(default = "default_search_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_search_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Default)]
struct GetParams {
    ids: Vec<String>,
    format: Option<String>,
    expand: Option<u32>,
    max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StatsParams {
    #[serde(default = "default_period_days")]
    period_days: i64,
}

fn default_period_days() -> i64 {
    30
}

/// Parses a `YYYY-MM-DD` date filter. `inclusive_end` extends `to` by 24h
/// so the named day is fully included (§4.10 "`to` is inclusive by adding
/// 24h").
fn parse_date_filter(raw: &str, inclusive_end: bool) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| DexError::InvalidInput(format!("invalid date: {raw}")))?;
    let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
    Ok(if inclusive_end { start + chrono::Duration::hours(24) } else { start })
}

fn list_filter_from(project: &Option<String>, source: &Option<String>, from: &Option<String>, to: &Option<String>) -> Result<ListFilter> {
    Ok(ListFilter {
        source: source.as_deref().and_then(|s| s.to_lowercase().parse::<Source>().ok()),
        project: project.clone(),
        from: from.as_deref().map(|s| parse_date_filter(s, false)).transpose()?,
        to: to.as_deref().map(|s| parse_date_filter(s, true)).transpose()?,
    })
}

fn conversation_json(c: &Conversation) -> Value {
    json!({
        "id": c.id,
        "source": c.source.to_string(),
        "title": c.title,
        "subtitle": c.subtitle,
        "workspacePath": c.workspace_path,
        "projectName": c.project_name,
        "model": c.model,
        "mode": c.mode.to_string(),
        "createdAt": c.created_at,
        "updatedAt": c.updated_at,
        "messageCount": c.message_count,
    })
}

fn handle_stats(store: &Store, params: StatsParams) -> Result<Value> {
    let since = Utc::now() - chrono::Duration::days(params.period_days.max(0));
    let filter = ListFilter { from: Some(since), ..Default::default() };
    let (conversations, total) = repo::list_conversations(store.connection(), &filter, usize::MAX, 0)?;

    let mut by_source: HashMap<String, usize> = HashMap::new();
    let mut by_project: HashMap<String, usize> = HashMap::new();
    let mut days: BTreeSet<NaiveDate> = BTreeSet::new();
    let mut total_messages = 0u64;

    for c in &conversations {
        *by_source.entry(c.source.to_string()).or_insert(0) += 1;
        *by_project.entry(c.project_name.clone()).or_insert(0) += 1;
        days.insert(c.created_at.date_naive());
        total_messages += c.message_count as u64;
    }

    let mut top_projects: Vec<(String, usize)> = by_project.into_iter().collect();
    top_projects.sort_by(|a, b| b.1.cmp(&a.1));
    top_projects.truncate(10);

    Ok(json!({
        "totalConversations": total,
        "totalMessages": total_messages,
        "bySource": by_source,
        "topProjects": top_projects.into_iter().map(|(name, count)| json!({"project": name, "count": count})).collect::<Vec<_>>(),
        "streak": longest_streak(&days),
    }))
}

/// Longest run of consecutive calendar days with at least one conversation.
fn longest_streak(days: &BTreeSet<NaiveDate>) -> i64 {
    let mut longest = 0i64;
    let mut current = 0i64;
    let mut previous: Option<NaiveDate> = None;

    for day in days {
        match previous {
            Some(prev) if *day == prev + chrono::Duration::days(1) => current += 1,
            _ => current = 1,
        }
        longest = longest.max(current);
        previous = Some(*day);
    }
    longest
}

fn handle_list(store: &Store, params: ListParams) -> Result<Value> {
    let filter = list_filter_from(&params.project, &params.source, &params.from, &params.to)?;
    let (conversations, total) = repo::list_conversations(store.connection(), &filter, params.limit, params.offset)?;
    Ok(json!({
        "conversations": conversations.iter().map(conversation_json).collect::<Vec<_>>(),
        "total": total,
    }))
}

async fn handle_search(store: &Store, embedding: Option<&EmbeddingClient>, params: SearchParams) -> Result<Value> {
    let mut query = params.query.clone();
    if let Some(source) = &params.source {
        query = format!("source:{source} {query}");
    }
    if let Some(file) = &params.file {
        query = format!("file:{file} {query}");
    }

    let outcome = search::search(store, &query, params.limit + params.offset, embedding).await?;
    match outcome {
        SearchOutcome::Search(results) => {
            let page: Vec<_> = results.results.into_iter().skip(params.offset).take(params.limit).collect();
            Ok(json!({
                "conversations": page.iter().map(|m| {
                    let mut c = conversation_json(&m.conversation);
                    c["score"] = json!(m.score);
                    if let Some(best) = &m.best_match {
                        c["snippet"] = json!(best.snippet);
                    }
                    c
                }).collect::<Vec<_>>(),
                "totalConversations": results.total_conversations,
            }))
        }
        SearchOutcome::List { conversations, total } => Ok(json!({
            "conversations": conversations.iter().map(conversation_json).collect::<Vec<_>>(),
            "totalConversations": total,
        })),
    }
}

fn handle_get(store: &Store, params: GetParams) -> Result<Value> {
    let format = match params.format.as_deref() {
        Some("stripped") => Some(retrieval::Format::Stripped),
        Some("user_only") => Some(retrieval::Format::UserOnly),
        Some("outline") => Some(retrieval::Format::Outline),
        Some("full") | None => Some(retrieval::Format::Full),
        Some(other) => return Err(DexError::InvalidInput(format!("unknown format: {other}"))),
    };
    let expand = params.expand.map(retrieval::ExpandWindow::around);
    let options = GetOptions { format, expand, max_tokens: params.max_tokens };
    let retrieved = retrieval::get(store.connection(), &params.ids, &options)?;

    Ok(json!({
        "conversations": retrieved.iter().map(|rc| {
            let mut c = conversation_json(&rc.conversation);
            c["messages"] = json!(rc.messages.iter().map(|m| json!({
                "messageIndex": m.message_index,
                "role": m.role.to_string(),
                "content": m.content,
            })).collect::<Vec<_>>());
            c["hasMoreBefore"] = json!(rc.has_more_before);
            c["hasMoreAfter"] = json!(rc.has_more_after);
            c["truncated"] = json!(rc.truncated);
            c
        }).collect::<Vec<_>>(),
    }))
}

fn write_response<W: Write>(out: &mut W, id: Value, error: Option<Value>, result: Option<Value>) -> std::io::Result<()> {
    let mut response = json!({ "jsonrpc": "2.0", "id": id });
    if let Some(err) = error {
        response["error"] = err;
    } else {
        response["result"] = result.unwrap_or(Value::Null);
    }
    writeln!(out, "{response}")?;
    out.flush()
}

fn rpc_error(code: i64, message: String) -> Value {
    json!({ "code": code, "message": message })
}

/// Blocking stdio loop: reads one JSON-RPC request per line until EOF.
/// Each request dispatches synchronously on a small `tokio` current-thread
/// runtime so `search`'s async embedding call can run without spinning up
/// a full multi-thread runtime for a single-client tool server.
pub fn run(store: &Store, config: &Config) -> Result<()> {
    let embedding = crate::sync::embedding_client_from_config(config);
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = std::io::BufReader::new(stdin.lock());
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                write_response(&mut stdout, Value::Null, Some(rpc_error(-32700, format!("parse error: {e}"))), None)?;
                continue;
            }
        };

        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(|v| v.as_str()).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or(json!({}));

        let outcome = dispatch(store, &embedding, &runtime, method, params);
        match outcome {
            Ok(result) => write_response(&mut stdout, id, None, Some(result))?,
            Err(e) => write_response(&mut stdout, id, Some(rpc_error(-32000, e.to_string())), None)?,
        }
    }

    Ok(())
}

fn dispatch(
    store: &Store,
    embedding: &Option<EmbeddingClient>,
    runtime: &tokio::runtime::Runtime,
    method: &str,
    params: Value,
) -> Result<Value> {
    match method {
        "stats" => {
            let params: StatsParams = serde_json::from_value(params).unwrap_or_default();
            handle_stats(store, params)
        }
        "list" => {
            let params: ListParams = serde_json::from_value(params).unwrap_or_default();
            handle_list(store, params)
        }
        "search" => {
            let params: SearchParams = serde_json::from_value(params)
                .map_err(|e| DexError::InvalidInput(format!("invalid search params: {e}")))?;
            runtime.block_on(handle_search(store, embedding.as_ref(), params))
        }
        "get" => {
            let params: GetParams = serde_json::from_value(params)
                .map_err(|e| DexError::InvalidInput(format!("invalid get params: {e}")))?;
            handle_get(store, params)
        }
        other => Err(DexError::InvalidInput(format!("unknown method: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn parse_date_filter_inclusive_end_adds_24h() {
        let parsed = parse_date_filter("2026-01-01", true).unwrap();
        let exclusive = parse_date_filter("2026-01-01", false).unwrap();
        assert_eq!(parsed, exclusive + Duration::hours(24));
    }

    #[test]
    fn parse_date_filter_rejects_malformed_date() {
        assert!(parse_date_filter("not-a-date", false).is_err());
    }

    #[test]
    fn longest_streak_finds_consecutive_run() {
        let mut days = BTreeSet::new();
        let base = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        days.insert(base);
        days.insert(base + Duration::days(1));
        days.insert(base + Duration::days(2));
        days.insert(base + Duration::days(5));
        assert_eq!(longest_streak(&days), 3);
    }

    #[test]
    fn longest_streak_empty_is_zero() {
        assert_eq!(longest_streak(&BTreeSet::new()), 0);
    }

    #[test]
    fn handle_list_round_trips_through_store() {
        let store = Store::open_in_memory().unwrap();
        let result = handle_list(&store, ListParams::default()).unwrap();
        assert_eq!(result["total"], json!(0));
    }

    #[test]
    fn handle_get_skips_unknown_ids() {
        let store = Store::open_in_memory().unwrap();
        let params = GetParams { ids: vec!["missing".to_string()], ..Default::default() };
        let result = handle_get(&store, params).unwrap();
        assert_eq!(result["conversations"].as_array().unwrap().len(), 0);
    }
}
