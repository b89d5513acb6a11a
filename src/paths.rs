//! Platform path resolution (C1): vendor storage roots and dex's own data
//! directory.
//!
//! WHY a dedicated module: every adapter and the store need a consistent,
//! testable way to find "where things live" without duplicating per-OS
//! branches.

use std::path::PathBuf;

use crate::model::Source;

/// `$HOME/.dex` — contains the store file and the worker progress sentinel
/// (§6). Honors `DEX_DATA_DIR` for tests and for the config override.
pub fn data_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DEX_DATA_DIR") {
        return Some(PathBuf::from(dir));
    }
    dirs::home_dir().map(|h| h.join(".dex"))
}

pub fn store_path() -> Option<PathBuf> {
    data_dir().map(|d| d.join("dex.db"))
}

pub fn sync_lock_path() -> Option<PathBuf> {
    data_dir().map(|d| d.join("sync.lock"))
}

pub fn worker_progress_path() -> Option<PathBuf> {
    data_dir().map(|d| d.join("worker-progress.json"))
}

/// Default on-disk root for a vendor's conversation store, or `None` when
/// the tool is not installed on this machine.
///
/// WHY `None` rather than an error: `sync::Orchestrator` treats an absent
/// source as `MissingSource`, not a fatal condition (§7).
pub fn default_source_root(source: Source) -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let path = match source {
        Source::Cursor => cursor_app_support_dir()?,
        Source::ClaudeCode => home.join(".claude/projects"),
        Source::Codex => home.join(".codex/sessions"),
    };
    if path.exists() { Some(path) } else { None }
}

/// Cursor's per-OS "User" application-support directory, which contains
/// `globalStorage/state.vscdb` and `workspaceStorage/<id>/state.vscdb`.
fn cursor_app_support_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        dirs::home_dir().map(|h| h.join("Library/Application Support/Cursor/User"))
    }
    #[cfg(target_os = "linux")]
    {
        dirs::home_dir().map(|h| h.join(".config/Cursor/User"))
    }
    #[cfg(target_os = "windows")]
    {
        dirs::data_dir().map(|d| d.join("Cursor/User"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

/// Derive a project name from a workspace path: its basename, or the full
/// path when there is no separator (§3 "derived project name").
pub fn project_name(workspace_path: &str) -> String {
    std::path::Path::new(workspace_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| workspace_path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_takes_basename() {
        assert_eq!(project_name("/Users/alice/code/dex"), "dex");
    }

    #[test]
    fn project_name_handles_trailing_slash() {
        assert_eq!(project_name("/Users/alice/code/dex/"), "dex");
    }

    #[test]
    fn project_name_falls_back_to_whole_string_without_separators() {
        assert_eq!(project_name("dex"), "dex");
    }

    #[test]
    fn data_dir_respects_env_override() {
        unsafe {
            std::env::set_var("DEX_DATA_DIR", "/tmp/dex-test-data");
        }
        assert_eq!(data_dir(), Some(PathBuf::from("/tmp/dex-test-data")));
        unsafe {
            std::env::remove_var("DEX_DATA_DIR");
        }
    }
}
