//! Configuration loading and management for dex.
//!
//! # Architecture overview
//!
//! Configuration lives in `~/.config/dex/config.toml` and is purely optional.
//! When absent, every option falls back to a sensible default so that dex
//! works out of the box without any setup.
//!
//! Config values flow into the rest of the system through two paths:
//! 1. **`Config::load()`** — used at runtime by the CLI to fill in defaults
//!    before a sync, search, or worker run.
//! 2. **`get_value` / `set_value` / `unset_value`** — used by the `dex
//!    get/set/unset` subcommands to read and write individual keys from the
//!    live file.
//!
//! # Design philosophy
//!
//! CLI flags always override config values. `main.rs` merges them after
//! loading config, so this module only needs to expose the raw config data
//! and the mutation helpers — it does not need to know about the CLI at all.
//!
//! # TRADE-OFFS
//!
//! - `toml_edit` is used instead of plain `toml` for the mutation helpers
//!   because it preserves comments and formatting in the user's config
//!   file. This adds a second TOML dependency but is worth it to avoid
//!   silently destroying hand-written comments.
//! - Source paths are stored as `Option<String>` rather than `Option<PathBuf>`
//!   so that tilde expansion happens at point-of-use rather than at parse
//!   time, making serialization round-trips lossless.

use std::path::PathBuf;

use serde::Deserialize;
use toml_edit::DocumentMut;

use crate::error::DexError;

/// Per-tool source path overrides from `[sources]` table.
///
/// WHY: Users who keep their AI tool data in non-standard locations (e.g., a
/// different drive or a shared network directory) need a way to point dex
/// at the right place without patching the binary. Each field is
/// `Option<String>` so that an absent key means "use the default path"
/// rather than "no path at all".
#[derive(Debug, Default, Deserialize)]
pub struct SourcesConfig {
    pub cursor: Option<String>,
    pub codex: Option<String>,
    pub claude_code: Option<String>,
}

impl SourcesConfig {
    pub fn cursor_path(&self) -> Option<PathBuf> {
        self.cursor.as_deref().map(expand_tilde)
    }

    pub fn codex_path(&self) -> Option<PathBuf> {
        self.codex.as_deref().map(expand_tilde)
    }

    pub fn claude_code_path(&self) -> Option<PathBuf> {
        self.claude_code.as_deref().map(expand_tilde)
    }
}

/// Embedding endpoint options from `[embedding]` table (§4.5).
#[derive(Debug, Deserialize)]
pub struct EmbeddingConfig {
    pub endpoint_url: Option<String>,
    pub model: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_embedding_concurrency")]
    pub concurrency: u32,
}

fn default_batch_size() -> u32 {
    64
}

fn default_embedding_concurrency() -> u32 {
    4
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            model: None,
            batch_size: default_batch_size(),
            concurrency: default_embedding_concurrency(),
        }
    }
}

/// Title-enrichment driver options from `[enrichment]` table (§4.11).
#[derive(Debug, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_provider_priority")]
    pub provider_priority: Vec<String>,
    #[serde(default = "default_enrichment_concurrency")]
    pub concurrency: u32,
}

fn default_provider_priority() -> Vec<String> {
    vec!["anthropic".to_string(), "openai".to_string()]
}

fn default_enrichment_concurrency() -> u32 {
    4
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider_priority: default_provider_priority(),
            concurrency: default_enrichment_concurrency(),
        }
    }
}

/// Top-level config deserialized from `~/.config/dex/config.toml`.
///
/// All fields are optional. Missing fields fall back to built-in defaults,
/// so a config file with a single key is valid and common. `Config::load()`
/// returns `Config::default()` when the file is absent rather than erroring,
/// so dex is always runnable without any configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Override for `$HOME/.dex` (§6).
    pub data_dir: Option<String>,
    pub sources: Option<SourcesConfig>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
}

impl Config {
    /// Load config from `~/.config/dex/config.toml`.
    ///
    /// Returns `Config::default()` silently when the file is absent — dex is
    /// designed to be zero-config, so a missing file is never an error.
    /// Parse failures also fall back to default to avoid breaking normal
    /// usage when a user has written an invalid value.
    pub fn load() -> Config {
        let Some(home) = dirs::home_dir() else {
            return Config::default();
        };
        let path = home.join(".config/dex/config.toml");
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Config::default();
        };
        toml::from_str(&content).unwrap_or_default()
    }

    /// Resolve the configured data directory, expanding a leading `~`.
    /// Falls back to `crate::paths::data_dir()` when unset.
    pub fn data_dir_path(&self) -> Option<PathBuf> {
        self.data_dir.as_deref().map(expand_tilde).or_else(crate::paths::data_dir)
    }
}

/// Print a config value by dotted key (e.g. `"sources.cursor"` or `"data_dir"`).
///
/// Reads the live config file so that comments and formatting written by
/// the user are not disturbed. Errors if the key does not exist.
pub fn get_value(key: &str) -> Result<(), DexError> {
    let content = read_config_file()?;
    let doc: DocumentMut = content
        .parse()
        .map_err(|e| DexError::Other(format!("Failed to parse config: {e}")))?;

    let value = resolve_key(&doc, key);
    match value {
        Some(item) => {
            println!("{}", format_item(item));
            Ok(())
        }
        None => Err(DexError::Other(format!("Key not found: {key}"))),
    }
}

/// Write a config value by dotted key (e.g. `dex set embedding.batch_size 32`).
///
/// Creates the config file and any intermediate TOML tables as needed.
/// Values are type-inferred from their string representation — `"true"` /
/// `"false"` become booleans, numeric strings become integers or floats,
/// and everything else becomes a string.
pub fn set_value(key: &str, value: &str) -> Result<(), DexError> {
    let content = read_config_file().unwrap_or_default();
    let mut doc: DocumentMut = content
        .parse()
        .map_err(|e| DexError::Other(format!("Failed to parse config: {e}")))?;

    let (table_path, field) = split_key(key)?;

    let mut table = doc.as_table_mut();
    for segment in &table_path {
        if !table.contains_key(segment) {
            table.insert(segment, toml_edit::Item::Table(toml_edit::Table::new()));
        }
        table = table[segment]
            .as_table_mut()
            .ok_or_else(|| DexError::Other(format!("'{segment}' is not a table")))?;
    }

    let toml_value = infer_value(value);
    table.insert(&field, toml_edit::Item::Value(toml_value));

    write_config_file(&doc.to_string())?;
    Ok(())
}

/// Remove a config value by dotted key (`dex unset <key>`).
///
/// Errors if the key does not exist, so the command gives clear feedback
/// rather than silently succeeding on a typo.
pub fn unset_value(key: &str) -> Result<(), DexError> {
    let content = read_config_file()?;
    let mut doc: DocumentMut = content
        .parse()
        .map_err(|e| DexError::Other(format!("Failed to parse config: {e}")))?;

    let (table_path, field) = split_key(key)?;

    let mut table = doc.as_table_mut();
    for segment in &table_path {
        table = table
            .get_mut(segment)
            .and_then(|item| item.as_table_mut())
            .ok_or_else(|| DexError::Other(format!("Key not found: {key}")))?;
    }

    if table.remove(&field).is_none() {
        return Err(DexError::Other(format!("Key not found: {key}")));
    }

    write_config_file(&doc.to_string())?;
    Ok(())
}

/// Print all config values in `key = value` format (`dex get`).
///
/// Lists every leaf key in the config file using dotted notation so that
/// the output can be copy-pasted directly into `dex set` commands.
pub fn list_values() -> Result<(), DexError> {
    let content = read_config_file()?;
    let doc: DocumentMut = content
        .parse()
        .map_err(|e| DexError::Other(format!("Failed to parse config: {e}")))?;

    let mut entries = Vec::new();
    collect_entries(doc.as_table(), "", &mut entries);

    if entries.is_empty() {
        eprintln!("No config values set.");
    } else {
        for (key, value) in entries {
            println!("{key} = {value}");
        }
    }
    Ok(())
}

/// Write the default config template to `~/.config/dex/config.toml`.
///
/// All options are commented out so that the file documents what is
/// available without actually changing any behavior. Errors if the file
/// already exists to avoid silently overwriting user customizations.
pub fn init() -> Result<(), DexError> {
    let path = config_path()?;
    if path.exists() {
        return Err(DexError::Other(format!(
            "Config file already exists: {}",
            path.display()
        )));
    }

    let template = r#"# dex configuration
# See: dex docs

# Override for $HOME/.dex
# data_dir = "~/.dex"

[sources]
# Override default source paths (leave commented to use defaults)
# cursor = "~/.config/Cursor/User"
# codex = "~/.codex/sessions"
# claude_code = "~/.claude/projects"

[embedding]
# endpoint_url = "http://localhost:11434/v1/embeddings"
# model = "text-embedding-3-small"
# batch_size = 64
# concurrency = 4

[enrichment]
# enabled = false
# provider_priority = ["anthropic", "openai"]
# concurrency = 4
"#;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, template)?;

    eprintln!("Created config file: {}", path.display());
    eprintln!();
    eprintln!("Edit it directly, or use:");
    eprintln!("  dex set data_dir ~/.dex");
    eprintln!("  dex set embedding.batch_size 32");
    eprintln!("  dex get");

    Ok(())
}

// ── Private helpers ───────────────────────────────────────────────────────

fn config_path() -> Result<PathBuf, DexError> {
    let home = dirs::home_dir().ok_or_else(|| DexError::Other("Cannot determine home directory".into()))?;
    Ok(home.join(".config/dex/config.toml"))
}

fn read_config_file() -> Result<String, DexError> {
    let path = config_path()?;
    std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DexError::Other(format!("Config file not found: {}", path.display()))
        } else {
            DexError::Io(e)
        }
    })
}

fn write_config_file(content: &str) -> Result<(), DexError> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, content)?;
    Ok(())
}

/// Parse a dotted key into a table path and a leaf field name.
///
/// `"embedding.batch_size"` → `(["embedding"], "batch_size")`
/// `"data_dir"` → `([], "data_dir")`
fn split_key(key: &str) -> Result<(Vec<String>, String), DexError> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.is_empty() || parts.iter().any(|p| p.is_empty()) {
        return Err(DexError::Other(format!("Invalid key: {key}")));
    }
    let field = parts.last().unwrap().to_string();
    let table_path = parts[..parts.len() - 1].iter().map(|s| s.to_string()).collect();
    Ok((table_path, field))
}

/// Walk a dotted key path in a `toml_edit` document and return the matching item.
fn resolve_key<'a>(doc: &'a DocumentMut, key: &str) -> Option<&'a toml_edit::Item> {
    let parts: Vec<&str> = key.split('.').collect();
    let mut current: &toml_edit::Item = doc.as_item();
    for part in &parts {
        current = current.as_table_like()?.get(part)?;
    }
    Some(current)
}

/// Render a `toml_edit::Item` as a clean user-facing string.
fn format_item(item: &toml_edit::Item) -> String {
    match item {
        toml_edit::Item::Value(v) => match v {
            toml_edit::Value::String(s) => s.value().clone(),
            toml_edit::Value::Integer(i) => i.value().to_string(),
            toml_edit::Value::Float(f) => f.value().to_string(),
            toml_edit::Value::Boolean(b) => b.value().to_string(),
            other => other.to_string(),
        },
        toml_edit::Item::Table(t) => {
            let mut entries = Vec::new();
            collect_entries(t, "", &mut entries);
            entries.iter().map(|(k, v)| format!("{k} = {v}")).collect::<Vec<_>>().join("\n")
        }
        other => other.to_string(),
    }
}

/// Recursively walk a TOML table and collect all leaf values as `(key, value)` pairs.
fn collect_entries(table: &toml_edit::Table, prefix: &str, out: &mut Vec<(String, String)>) {
    for (key, item) in table.iter() {
        let full_key = if prefix.is_empty() { key.to_string() } else { format!("{prefix}.{key}") };
        match item {
            toml_edit::Item::Value(v) => {
                out.push((full_key, format_value(v)));
            }
            toml_edit::Item::Table(t) => {
                collect_entries(t, &full_key, out);
            }
            _ => {}
        }
    }
}

/// Render a TOML scalar value as a clean string without `toml_edit` decoration.
fn format_value(v: &toml_edit::Value) -> String {
    match v {
        toml_edit::Value::String(s) => format!("\"{}\"", s.value()),
        toml_edit::Value::Integer(i) => i.value().to_string(),
        toml_edit::Value::Float(f) => f.value().to_string(),
        toml_edit::Value::Boolean(b) => b.value().to_string(),
        other => other.to_string(),
    }
}

/// Infer a TOML value type from a CLI string argument.
///
/// Precedence: boolean → integer → float (only when the string contains
/// `.`) → string.
///
/// EDGE: `"3.0"` without a decimal point is treated as integer `3`, not
/// float. This matches the most common user expectation for version-like
/// values.
fn infer_value(s: &str) -> toml_edit::Value {
    if s == "true" {
        return toml_edit::Value::from(true);
    }
    if s == "false" {
        return toml_edit::Value::from(false);
    }
    if let Ok(n) = s.parse::<i64>() {
        return toml_edit::Value::from(n);
    }
    if let Ok(f) = s.parse::<f64>() {
        if s.contains('.') {
            return toml_edit::Value::from(f);
        }
    }
    toml_edit::Value::from(s)
}

/// Expand a leading `~` or `~/` prefix to the user's home directory.
///
/// EDGE: A bare `"~"` (no trailing slash) is expanded to the home directory
/// itself. Paths without a leading `~` are returned unchanged, so absolute
/// and relative paths both work.
pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_key_simple() {
        let (table, field) = split_key("data_dir").unwrap();
        assert!(table.is_empty());
        assert_eq!(field, "data_dir");
    }

    #[test]
    fn test_split_key_dotted() {
        let (table, field) = split_key("embedding.batch_size").unwrap();
        assert_eq!(table, vec!["embedding"]);
        assert_eq!(field, "batch_size");
    }

    #[test]
    fn test_split_key_deeply_nested() {
        let (table, field) = split_key("a.b.c").unwrap();
        assert_eq!(table, vec!["a", "b"]);
        assert_eq!(field, "c");
    }

    #[test]
    fn test_split_key_empty_segment_errors() {
        assert!(split_key("a..b").is_err());
        assert!(split_key(".a").is_err());
        assert!(split_key("a.").is_err());
    }

    #[test]
    fn test_infer_value_true() {
        assert_eq!(infer_value("true").as_bool(), Some(true));
    }

    #[test]
    fn test_infer_value_false() {
        assert_eq!(infer_value("false").as_bool(), Some(false));
    }

    #[test]
    fn test_infer_value_integer() {
        assert_eq!(infer_value("42").as_integer(), Some(42));
    }

    #[test]
    fn test_infer_value_float() {
        let f = infer_value("3.14").as_float().unwrap();
        assert!((f - 3.14).abs() < 0.001);
    }

    #[test]
    fn test_infer_value_string() {
        assert_eq!(infer_value("hello world").as_str(), Some("hello world"));
    }

    #[test]
    fn test_expand_tilde_with_path() {
        let result = expand_tilde("~/projects");
        let home = dirs::home_dir().unwrap();
        assert_eq!(result, home.join("projects"));
    }

    #[test]
    fn test_expand_tilde_bare() {
        let result = expand_tilde("~");
        let home = dirs::home_dir().unwrap();
        assert_eq!(result, home);
    }

    #[test]
    fn test_expand_tilde_absolute_unchanged() {
        assert_eq!(expand_tilde("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_config_deserialize() {
        let toml_str = r#"
data_dir = "~/.dex"

[sources]
cursor = "~/.config/Cursor/User"

[embedding]
endpoint_url = "http://localhost:11434/v1/embeddings"
batch_size = 32

[enrichment]
enabled = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data_dir.as_deref(), Some("~/.dex"));
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.embedding.concurrency, 4);
        assert!(config.enrichment.enabled);
        assert_eq!(config.enrichment.provider_priority, vec!["anthropic", "openai"]);
        assert_eq!(config.sources.as_ref().unwrap().cursor.as_deref(), Some("~/.config/Cursor/User"));
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.data_dir.is_none());
        assert_eq!(config.embedding.batch_size, 64);
        assert!(!config.enrichment.enabled);
    }

    #[test]
    fn test_config_data_dir_path_expands_tilde() {
        let config = Config { data_dir: Some("~/.dex".to_string()), ..Default::default() };
        let path = config.data_dir_path().unwrap();
        let home = dirs::home_dir().unwrap();
        assert_eq!(path, home.join(".dex"));
    }

    #[test]
    fn test_resolve_key_top_level() {
        let doc: toml_edit::DocumentMut = "data_dir = \"test\"".parse().unwrap();
        assert!(resolve_key(&doc, "data_dir").is_some());
    }

    #[test]
    fn test_resolve_key_nested() {
        let doc: toml_edit::DocumentMut = "[embedding]\nbatch_size = 32".parse().unwrap();
        assert!(resolve_key(&doc, "embedding.batch_size").is_some());
    }

    #[test]
    fn test_resolve_key_missing() {
        let doc: toml_edit::DocumentMut = "data_dir = \"test\"".parse().unwrap();
        assert!(resolve_key(&doc, "nonexistent").is_none());
    }
}
