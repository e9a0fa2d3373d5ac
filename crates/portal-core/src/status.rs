//! Persistent `key=value` status file.
//!
//! The whole file is rewritten on every change. Lines without `=` are ignored
//! when reading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

/// Key holding the last selected proxy mode.
pub const LAST_PROXY_MODE: &str = "lastProxyMode";

/// Key holding the epoch millis of the last successful remote rule update.
pub const REMOTE_RULE_UPDATE_TIME: &str = "remoteRuleUpdateTime";

/// Small key/value store backed by a text file.
pub struct StatusFile {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl std::fmt::Debug for StatusFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusFile").field("path", &self.path).finish()
    }
}

impl StatusFile {
    /// Opens the status file, starting empty if it does not exist or cannot
    /// be read.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(text) => parse_entries(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Failed to read status file {:?}: {}", path, e);
                BTreeMap::new()
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the value stored under `key`.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Stores `value` under `key` and rewrites the file.
    ///
    /// The in-memory value is kept even if the write fails.
    pub async fn set(&self, key: &str, value: impl Into<String>) -> std::io::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value.into());
        tokio::fs::write(&self.path, render_entries(&entries)).await
    }
}

fn parse_entries(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn render_entries(entries: &BTreeMap<String, String>) -> String {
    entries
        .iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let status = StatusFile::open(dir.path().join("portal.status")).await;
        assert_eq!(status.get(LAST_PROXY_MODE).await, None);
    }

    #[tokio::test]
    async fn test_set_rewrites_whole_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("portal.status");

        let status = StatusFile::open(&path).await;
        status.set(LAST_PROXY_MODE, "RELAY").await.unwrap();
        status.set(REMOTE_RULE_UPDATE_TIME, "1700000000000").await.unwrap();
        status.set(LAST_PROXY_MODE, "DIRECT").await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "lastProxyMode=DIRECT\nremoteRuleUpdateTime=1700000000000\n"
        );
    }

    #[tokio::test]
    async fn test_reopen_reads_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("portal.status");
        std::fs::write(&path, "lastProxyMode=RULE\ngarbage line\n=empty\n").unwrap();

        let status = StatusFile::open(&path).await;
        assert_eq!(status.get(LAST_PROXY_MODE).await.as_deref(), Some("RULE"));
        assert_eq!(status.get("garbage line").await, None);
        assert_eq!(status.get("").await, None);
    }
}
