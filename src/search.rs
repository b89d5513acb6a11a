//! Hybrid search service (C8): FTS + vector fused by Reciprocal Rank
//! Fusion, the filter-prefix query language, file-path boosting, and
//! snippet/highlight generation (§4.6-§4.8).

use std::collections::HashMap;

use crate::embed::EmbeddingClient;
use crate::error::Result;
use crate::model::{Conversation, Message};
use crate::query::{self, ParsedQuery};
use crate::repo::{self, ListFilter};
use crate::store::Store;

const RRF_K: f64 = 60.0;
const SNIPPET_RADIUS: usize = 100;

#[derive(Debug, Clone)]
pub struct MessageMatch {
    pub message_id: String,
    pub conversation_id: String,
    pub score: f64,
    pub snippet: String,
    pub highlight_ranges: Vec<(usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct ConversationMatch {
    pub conversation: Conversation,
    pub best_match: Option<MessageMatch>,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub results: Vec<ConversationMatch>,
    pub total_conversations: usize,
}

/// Whether a query resolved to a ranked search or a plain filtered listing
/// (§4.6 "Filter-only ... → repository list with filters, not search").
#[derive(Debug, Clone)]
pub enum SearchOutcome {
    Search(SearchResults),
    List { conversations: Vec<Conversation>, total: usize },
}

/// `search(query, limit)` (§4.8). `embedding` is `None` when the endpoint
/// is known to be unreachable — callers that have already round-tripped
/// `embed_query` once and seen `EmbeddingUnavailable` should pass `None`
/// rather than retrying inside the hot path.
pub async fn search(store: &Store, raw_query: &str, limit: usize, embedding: Option<&EmbeddingClient>) -> Result<SearchOutcome> {
    let parsed = query::parse(raw_query);

    if parsed.is_filter_only() {
        let filter = ListFilter { source: parsed.source, ..Default::default() };
        let (conversations, total) = repo::list_conversations(store.connection(), &filter, limit, 0)?;
        return Ok(SearchOutcome::List { conversations, total });
    }

    if parsed.is_file_only() {
        return Ok(SearchOutcome::Search(file_only_search(store, &parsed, limit)?));
    }

    Ok(SearchOutcome::Search(hybrid_search(store, &parsed, limit, embedding).await?))
}

fn file_only_search(store: &Store, parsed: &ParsedQuery, limit: usize) -> Result<SearchResults> {
    let pattern = parsed.file.as_deref().unwrap_or_default();
    let sums = file_scores_by_conversation(store, pattern)?;

    let mut results = Vec::new();
    for (conversation_id, score) in sums {
        let Some(conversation) = repo::conversation_by_id(store.connection(), &conversation_id)? else { continue };
        if !passes_metadata_filters(&conversation, parsed) {
            continue;
        }
        results.push(ConversationMatch { conversation, best_match: None, score });
    }
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(limit);
    let total = results.len();
    Ok(SearchResults { results, total_conversations: total })
}

async fn hybrid_search(store: &Store, parsed: &ParsedQuery, limit: usize, embedding: Option<&EmbeddingClient>) -> Result<SearchResults> {
    let matches = hybrid_message_search(store, &parsed.free_text, limit, embedding).await?;

    let file_scores = match &parsed.file {
        Some(pattern) => Some(file_scores_by_conversation(store, pattern)?),
        None => None,
    };

    let mut grouped: HashMap<String, Vec<MessageMatch>> = HashMap::new();
    for m in matches {
        grouped.entry(m.conversation_id.clone()).or_default().push(m);
    }

    let mut results = Vec::new();
    for (conversation_id, mut msgs) in grouped {
        if let Some(scores) = &file_scores {
            if !scores.contains_key(&conversation_id) {
                continue;
            }
        }
        let Some(conversation) = repo::conversation_by_id(store.connection(), &conversation_id)? else { continue };
        if !passes_metadata_filters(&conversation, parsed) {
            continue;
        }

        msgs.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let best = msgs.into_iter().next().unwrap();
        let mut score = best.score;
        if let Some(scores) = &file_scores {
            if let Some(file_score) = scores.get(&conversation_id) {
                score += 0.5 * file_score;
            }
        }
        results.push(ConversationMatch { conversation, best_match: Some(best), score });
    }

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(limit);
    let total = results.len();
    Ok(SearchResults { results, total_conversations: total })
}

fn passes_metadata_filters(conversation: &Conversation, parsed: &ParsedQuery) -> bool {
    if let Some(source) = parsed.source {
        if conversation.source != source {
            return false;
        }
    }
    if let Some(model_substr) = &parsed.model {
        if !conversation.model.to_lowercase().contains(&model_substr.to_lowercase()) {
            return false;
        }
    }
    true
}

/// Sum of role scores per conversation across every matching file path
/// (§4.6: "rank by summed role-scores").
fn file_scores_by_conversation(store: &Store, pattern: &str) -> Result<HashMap<String, f64>> {
    let hits = repo::search_by_file_path(store.connection(), pattern, usize::MAX)?;
    let mut sums: HashMap<String, f64> = HashMap::new();
    for (conversation_id, score) in hits {
        *sums.entry(conversation_id).or_insert(0.0) += score;
    }
    Ok(sums)
}

/// Steps 1-5 of §4.8: FTS + vector fan-out, RRF fusion, snippet
/// generation. Empty free text returns no matches (§4.6 edge case).
async fn hybrid_message_search(
    store: &Store,
    free_text: &str,
    limit: usize,
    embedding: Option<&EmbeddingClient>,
) -> Result<Vec<MessageMatch>> {
    if free_text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let fetch_n = 2 * limit.max(1);
    let fts_results = store.fts_search(free_text, fetch_n)?;

    let vector_results = match embedding {
        Some(client) => match client.embed_query(free_text).await {
            Ok(vector) => store.vector_search(&vector, fetch_n)?,
            Err(_) => Vec::new(),
        },
        None => Vec::new(),
    };

    let fused = if vector_results.is_empty() {
        fts_results
    } else {
        reciprocal_rank_fusion(&fts_results, &vector_results)
    };

    let candidate_ids: Vec<String> = fused.iter().map(|(id, _)| id.clone()).collect();
    let messages = repo::messages_by_ids(store.connection(), &candidate_ids)?;
    let by_id: HashMap<String, Message> = messages.into_iter().map(|m| (m.id.clone(), m)).collect();

    let terms: Vec<String> = free_text.split_whitespace().map(|s| s.to_string()).collect();

    let mut matches = Vec::new();
    for (id, score) in fused {
        let Some(m) = by_id.get(&id) else { continue };
        if m.content.trim().is_empty() {
            continue;
        }
        let (snippet, highlight_ranges) = build_snippet(&m.content, &terms);
        matches.push(MessageMatch {
            message_id: m.id.clone(),
            conversation_id: m.conversation_id.clone(),
            score,
            snippet,
            highlight_ranges,
        });
        if matches.len() >= limit {
            break;
        }
    }
    Ok(matches)
}

/// Reciprocal Rank Fusion, k=60 (§4.8 step 3, §8 property 6).
fn reciprocal_rank_fusion(fts: &[(String, f64)], vector: &[(String, f64)]) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for (rank, (id, _)) in fts.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (RRF_K + rank as f64 + 1.0);
    }
    for (rank, (id, _)) in vector.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (RRF_K + rank as f64 + 1.0);
    }
    let mut out: Vec<(String, f64)> = scores.into_iter().collect();
    out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// ~200-char window centered on the first matching term, with `"..."`
/// markers when truncated, plus byte-offset highlight ranges within the
/// returned snippet (§4.8 step 5).
fn build_snippet(content: &str, terms: &[String]) -> (String, Vec<(usize, usize)>) {
    let lower = content.to_lowercase();
    let mut center = 0usize;
    for term in terms {
        if term.is_empty() {
            continue;
        }
        if let Some(pos) = lower.find(&term.to_lowercase()) {
            center = pos;
            break;
        }
    }

    let raw_start = center.saturating_sub(SNIPPET_RADIUS);
    let raw_end = (center + SNIPPET_RADIUS).min(content.len());
    let start = floor_char_boundary(content, raw_start);
    let end = ceil_char_boundary(content, raw_end);

    let prefix = start > 0;
    let suffix = end < content.len();
    let mut snippet = content[start..end].to_string();
    if suffix {
        snippet.push_str("...");
    }
    if prefix {
        snippet = format!("...{snippet}");
    }

    let highlight_ranges = find_highlight_ranges(&snippet, terms);
    (snippet, highlight_ranges)
}

fn find_highlight_ranges(snippet: &str, terms: &[String]) -> Vec<(usize, usize)> {
    let snippet_lower = snippet.to_lowercase();
    let mut ranges = Vec::new();
    for term in terms {
        if term.is_empty() {
            continue;
        }
        let term_lower = term.to_lowercase();
        let mut search_from = 0;
        while let Some(rel) = snippet_lower[search_from..].find(&term_lower) {
            let abs = search_from + rel;
            ranges.push((abs, abs + term_lower.len()));
            search_from = abs + term_lower.len();
        }
    }
    ranges.sort();
    ranges
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_places_doubly_ranked_item_first() {
        let fts = vec![("a".to_string(), 1.0), ("b".to_string(), 0.5)];
        let vector = vec![("a".to_string(), 0.9), ("b".to_string(), 0.8)];
        let fused = reciprocal_rank_fusion(&fts, &vector);
        assert_eq!(fused[0].0, "a");
    }

    #[test]
    fn rrf_monotonicity_better_rank_in_both_wins() {
        let fts = vec![("a".to_string(), 1.0), ("b".to_string(), 1.0), ("c".to_string(), 1.0)];
        let vector = vec![("a".to_string(), 1.0), ("c".to_string(), 1.0), ("b".to_string(), 1.0)];
        let fused = reciprocal_rank_fusion(&fts, &vector);
        let pos = |id: &str| fused.iter().position(|(i, _)| i == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
    }

    #[test]
    fn build_snippet_centers_on_first_match_and_marks_truncation() {
        let content = format!("{}{}{}", "x".repeat(300), "authentication", "y".repeat(300));
        let (snippet, ranges) = build_snippet(&content, &["auth".to_string()]);
        assert!(snippet.starts_with("..."));
        assert!(snippet.ends_with("..."));
        assert!(snippet.contains("authentication"));
        assert!(!ranges.is_empty());
        let (s, e) = ranges[0];
        assert_eq!(&snippet[s..e], "auth");
    }

    #[test]
    fn build_snippet_no_truncation_markers_on_short_content() {
        let (snippet, _) = build_snippet("short content with a bug", &["bug".to_string()]);
        assert!(!snippet.starts_with("..."));
        assert!(!snippet.ends_with("..."));
    }

    #[tokio::test]
    async fn hybrid_message_search_returns_empty_for_blank_free_text() {
        let store = Store::open_in_memory().unwrap();
        let matches = hybrid_message_search(&store, "   ", 10, None).await.unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn search_filter_only_returns_list_outcome() {
        let store = Store::open_in_memory().unwrap();
        let outcome = search(&store, "source:codex", 10, None).await.unwrap();
        assert!(matches!(outcome, SearchOutcome::List { .. }));
    }
}
