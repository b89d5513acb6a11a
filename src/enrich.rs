//! Enrichment driver (C11): bounded-concurrency title generation for
//! untitled conversations (§4.11).
//!
//! This module owns the driver logic — selection of untitled
//! conversations, provider priority fallback, bounded fan-out, progress
//! reporting, per-conversation failure counting — behind a small
//! `TitleProvider` trait. Concrete providers are thin `reqwest` clients;
//! the actual prompt/response shape of each provider's API is the one
//! external-collaborator detail left loosely specified, so these are a
//! minimal, plausible implementation rather than a fixed wire contract.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::config::EnrichmentConfig;
use crate::error::{DexError, Result};
use crate::model::Conversation;
use crate::repo;
use crate::store::Store;

/// A source of conversation titles. One implementation per provider in
/// `provider_priority`; `is_available` lets a provider opt out at runtime
/// (e.g. no API key configured) without the driver needing to know why.
#[async_trait]
pub trait TitleProvider: Send + Sync {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
    async fn generate_title(&self, conversation_summary: &str) -> Result<String>;
}

/// `POST https://api.anthropic.com/v1/messages` with a short title-only
/// prompt. Reads its key from `ANTHROPIC_API_KEY`.
pub struct AnthropicTitleProvider {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl AnthropicTitleProvider {
    pub fn from_env() -> Self {
        Self { http: reqwest::Client::new(), api_key: std::env::var("ANTHROPIC_API_KEY").ok() }
    }
}

#[async_trait]
impl TitleProvider for AnthropicTitleProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate_title(&self, conversation_summary: &str) -> Result<String> {
        let Some(key) = &self.api_key else {
            return Err(DexError::EnrichmentFailure {
                conversation_id: String::new(),
                reason: "ANTHROPIC_API_KEY not set".into(),
            });
        };
        let body = serde_json::json!({
            "model": "claude-3-5-haiku-latest",
            "max_tokens": 32,
            "messages": [{"role": "user", "content": title_prompt(conversation_summary)}],
        });
        let resp = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| enrichment_failure(e.to_string()))?;
        let value: serde_json::Value = resp.json().await.map_err(|e| enrichment_failure(e.to_string()))?;
        let text = value["content"][0]["text"].as_str().unwrap_or_default();
        Ok(extract_title(text))
    }
}

/// `POST https://api.openai.com/v1/chat/completions`. Reads its key from
/// `OPENAI_API_KEY`.
pub struct OpenAiTitleProvider {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl OpenAiTitleProvider {
    pub fn from_env() -> Self {
        Self { http: reqwest::Client::new(), api_key: std::env::var("OPENAI_API_KEY").ok() }
    }
}

#[async_trait]
impl TitleProvider for OpenAiTitleProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate_title(&self, conversation_summary: &str) -> Result<String> {
        let Some(key) = &self.api_key else {
            return Err(DexError::EnrichmentFailure {
                conversation_id: String::new(),
                reason: "OPENAI_API_KEY not set".into(),
            });
        };
        let body = serde_json::json!({
            "model": "gpt-4o-mini",
            "max_tokens": 32,
            "messages": [{"role": "user", "content": title_prompt(conversation_summary)}],
        });
        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| enrichment_failure(e.to_string()))?;
        let value: serde_json::Value = resp.json().await.map_err(|e| enrichment_failure(e.to_string()))?;
        let text = value["choices"][0]["message"]["content"].as_str().unwrap_or_default();
        Ok(extract_title(text))
    }
}

fn enrichment_failure(reason: String) -> DexError {
    DexError::EnrichmentFailure { conversation_id: String::new(), reason }
}

fn title_prompt(conversation_summary: &str) -> String {
    format!("Generate a single title of 60 characters or fewer for this coding conversation. Reply with only the title.\n\n{conversation_summary}")
}

/// First line of the reply, surrounding quotes stripped (§4.11).
fn extract_title(reply: &str) -> String {
    let first_line = reply.lines().next().unwrap_or("").trim();
    first_line.trim_matches('"').trim_matches('\'').to_string()
}

/// Builds the default provider chain from `provider_priority`, in order,
/// skipping names it does not recognize.
pub fn providers_from_priority(priority: &[String]) -> Vec<Arc<dyn TitleProvider>> {
    priority
        .iter()
        .filter_map(|name| match name.as_str() {
            "anthropic" => Some(Arc::new(AnthropicTitleProvider::from_env()) as Arc<dyn TitleProvider>),
            "openai" => Some(Arc::new(OpenAiTitleProvider::from_env()) as Arc<dyn TitleProvider>),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct EnrichProgress {
    pub completed: usize,
    pub total: usize,
    pub in_flight: usize,
    pub recent_titles: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EnrichResult {
    pub enriched: usize,
    pub failed: usize,
    pub skipped: usize,
    pub provider: Option<String>,
}

/// Builds a short summary of a conversation's content for the title
/// prompt: the first few user-message lines.
fn summarize(store: &Store, conversation_id: &str) -> Result<String> {
    let messages = repo::messages_by_conversation(store.connection(), conversation_id)?;
    let summary: Vec<String> = messages
        .iter()
        .filter(|m| m.role == crate::model::Role::User)
        .take(3)
        .map(|m| m.content.lines().take(2).collect::<Vec<_>>().join(" "))
        .collect();
    Ok(summary.join("\n"))
}

/// Finds up to 100 untitled conversations and generates titles via the
/// highest-priority available provider, 4 in-flight at a time (§4.11).
/// Never returns `Err` for provider failures — those are counted in
/// `EnrichResult::failed` so a sync never aborts because of enrichment.
pub async fn run(
    store: &Store,
    config: &EnrichmentConfig,
    providers: &[Arc<dyn TitleProvider>],
    mut progress_cb: Box<dyn FnMut(&EnrichProgress) + Send + '_>,
) -> Result<EnrichResult> {
    if !config.enabled {
        return Ok(EnrichResult::default());
    }

    let provider = providers.iter().find(|p| p.is_available());
    let Some(provider) = provider else {
        return Ok(EnrichResult { skipped: 1, ..Default::default() });
    };

    let untitled = untitled_conversations(store, 100)?;
    let total = untitled.len();
    if total == 0 {
        return Ok(EnrichResult { provider: Some(provider.name().to_string()), ..Default::default() });
    }

    let concurrency = config.concurrency.max(1) as usize;
    let mut progress = EnrichProgress { completed: 0, total, in_flight: 0, recent_titles: Vec::new() };

    let work = untitled.into_iter().map(|conversation| {
        let provider = Arc::clone(provider);
        let summary = summarize(store, &conversation.id).unwrap_or_default();
        async move {
            let result = provider.generate_title(&summary).await;
            (conversation, result)
        }
    });

    let mut stream = stream::iter(work).buffer_unordered(concurrency);
    let mut enriched = 0usize;
    let mut failed = 0usize;

    while let Some((conversation, result)) = stream.next().await {
        match result {
            Ok(title) if !title.trim().is_empty() => {
                repo::set_conversation_title(store.connection(), &conversation.id, &title)?;
                enriched += 1;
                progress.recent_titles.push(title);
                if progress.recent_titles.len() > 5 {
                    progress.recent_titles.remove(0);
                }
            }
            _ => failed += 1,
        }
        progress.completed += 1;
        progress_cb(&progress);
    }

    Ok(EnrichResult { enriched, failed, skipped: 0, provider: Some(provider.name().to_string()) })
}

fn untitled_conversations(store: &Store, limit: usize) -> Result<Vec<Conversation>> {
    repo::untitled_conversations(store.connection(), limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider {
        available: bool,
        title: String,
    }

    #[async_trait]
    impl TitleProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn generate_title(&self, _conversation_summary: &str) -> Result<String> {
            Ok(self.title.clone())
        }
    }

    #[test]
    fn extract_title_strips_surrounding_quotes() {
        assert_eq!(extract_title("\"Fix the auth bug\"\nextra line"), "Fix the auth bug");
    }

    #[test]
    fn extract_title_takes_first_line_only() {
        assert_eq!(extract_title("Title line\nsecond line"), "Title line");
    }

    #[tokio::test]
    async fn run_reports_skipped_when_no_provider_available() {
        let store = Store::open_in_memory().unwrap();
        let config = EnrichmentConfig { enabled: true, provider_priority: vec![], concurrency: 4 };
        let providers: Vec<Arc<dyn TitleProvider>> =
            vec![Arc::new(StubProvider { available: false, title: "x".into() })];
        let result = run(&store, &config, &providers, Box::new(|_| {})).await.unwrap();
        assert_eq!(result.skipped, 1);
    }

    #[tokio::test]
    async fn run_returns_default_when_disabled() {
        let store = Store::open_in_memory().unwrap();
        let config = EnrichmentConfig { enabled: false, provider_priority: vec![], concurrency: 4 };
        let providers: Vec<Arc<dyn TitleProvider>> = vec![];
        let result = run(&store, &config, &providers, Box::new(|_| {})).await.unwrap();
        assert_eq!(result.enriched, 0);
        assert_eq!(result.skipped, 0);
    }
}
