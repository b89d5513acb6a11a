//! Filter-prefix query language for search (§4.6).
//!
//! A query is a whitespace-separated sequence of optional filter prefixes
//! (`source:`, `model:`, `file:`) and free text. Prefix removal is
//! left-to-right by regex; what remains is the free-text query.

use regex::Regex;
use std::sync::LazyLock;

use crate::model::Source;

static SOURCE_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bsource:(\S+)").unwrap());
static MODEL_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bmodel:(\S+)").unwrap());
static FILE_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bfile:(\S+)").unwrap());

/// A parsed search query: recognized filter prefixes plus whatever free
/// text is left over.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    pub source: Option<Source>,
    pub model: Option<String>,
    pub file: Option<String>,
    pub free_text: String,
}

impl ParsedQuery {
    pub fn is_filter_only(&self) -> bool {
        self.free_text.trim().is_empty() && self.file.is_none()
    }

    pub fn is_file_only(&self) -> bool {
        self.file.is_some() && self.free_text.trim().is_empty()
    }
}

/// Parse a raw query string into filters plus free text (§4.6).
///
/// Unknown `source:` values are kept as `None` (the filter is then
/// effectively ignored) rather than rejecting the query outright — an
/// unrecognized source name degrades to "no source filter" rather than an
/// error, since source filtering is advisory, not load-bearing.
pub fn parse(raw: &str) -> ParsedQuery {
    let mut query = ParsedQuery::default();
    let mut remaining = raw.to_string();

    if let Some(caps) = SOURCE_PREFIX.captures(&remaining) {
        query.source = caps.get(1).and_then(|m| m.as_str().to_lowercase().parse().ok());
    }
    remaining = SOURCE_PREFIX.replace_all(&remaining, "").to_string();

    if let Some(caps) = MODEL_PREFIX.captures(&remaining) {
        query.model = caps.get(1).map(|m| m.as_str().to_string());
    }
    remaining = MODEL_PREFIX.replace_all(&remaining, "").to_string();

    if let Some(caps) = FILE_PREFIX.captures(&remaining) {
        query.file = caps.get(1).map(|m| m.as_str().to_string());
    }
    remaining = FILE_PREFIX.replace_all(&remaining, "").to_string();

    query.free_text = remaining.split_whitespace().collect::<Vec<_>>().join(" ");
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_free_text_only() {
        let q = parse("authentication bug");
        assert_eq!(q.free_text, "authentication bug");
        assert!(q.source.is_none());
        assert!(q.file.is_none());
    }

    #[test]
    fn parses_source_prefix() {
        let q = parse("source:cursor login flow");
        assert_eq!(q.source, Some(Source::Cursor));
        assert_eq!(q.free_text, "login flow");
    }

    #[test]
    fn parses_model_and_file_prefixes() {
        let q = parse("model:gpt-5 file:auth.ts bug");
        assert_eq!(q.model.as_deref(), Some("gpt-5"));
        assert_eq!(q.file.as_deref(), Some("auth.ts"));
        assert_eq!(q.free_text, "bug");
    }

    #[test]
    fn filter_only_detects_no_free_text_or_file() {
        let q = parse("source:codex");
        assert!(q.is_filter_only());
    }

    #[test]
    fn file_only_detects_file_with_no_free_text() {
        let q = parse("file:auth.ts");
        assert!(q.is_file_only());
        assert!(!q.is_filter_only());
    }

    #[test]
    fn unknown_source_value_is_ignored_not_rejected() {
        let q = parse("source:bogus thing");
        assert!(q.source.is_none());
        assert_eq!(q.free_text, "thing");
    }

    #[test]
    fn is_case_insensitive() {
        let q = parse("SOURCE:Cursor hello");
        assert_eq!(q.source, Some(Source::Cursor));
        assert_eq!(q.free_text, "hello");
    }
}
