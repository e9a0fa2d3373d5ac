//! Proxy rule manager: proxy mode plus the local and remote rule sources.
//!
//! ## Architecture
//!
//! ```text
//! Router ──► should_relay(host) ──► mode ──┬─ DIRECT ─► false
//!                                          ├─ RELAY ──► true
//!                                          └─ RULE ───► test_host(host) == BLACK
//!
//! test_host: local BLACK ─► BLACK
//!            local WHITE ─► WHITE
//!            remote BLACK ─► BLACK
//!            otherwise ─► UNKNOWN
//! ```
//!
//! Reads never block on writers for longer than a pointer swap. Rule
//! updates are serialized, and status file writes are serialized
//! independently so a slow download never delays a mode change.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::Result;
use crate::host_rules::{HostRuleSet, HostRuleTestResult, RuleCounts};
use crate::proxy_mode::ProxyMode;
use crate::rule_source::{RemoteRuleFetcher, RuleSource, LOCAL_RULES_FILE, REMOTE_RULES_FILE};
use crate::status::{StatusFile, LAST_PROXY_MODE, REMOTE_RULE_UPDATE_TIME};

/// File name of the status file.
pub const STATUS_FILE: &str = "portal.status";

/// How often the remote refresher checks whether an update is due.
pub const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Snapshot of the mode and rule counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRuleInfo {
    pub mode: ProxyMode,
    pub local_black: usize,
    pub local_white: usize,
    pub remote_black: usize,
    pub remote_white: usize,
}

/// Options for opening a [`ProxyRuleManager`].
#[derive(Debug, Clone)]
pub struct RuleManagerOptions {
    /// Mode used when the status file holds none.
    pub default_mode: ProxyMode,
    /// Remote rule mirrors.
    pub remote_urls: Vec<String>,
    /// Whether remote payloads are base64 encoded.
    pub remote_base64_encoded: bool,
    /// Age after which the remote rules are refreshed.
    pub remote_update_interval: Duration,
}

impl Default for RuleManagerOptions {
    fn default() -> Self {
        Self {
            default_mode: ProxyMode::default(),
            remote_urls: Vec::new(),
            remote_base64_encoded: true,
            remote_update_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Owns the proxy mode and both rule sources.
pub struct ProxyRuleManager {
    mode: RwLock<ProxyMode>,
    local: RuleSource,
    remote: RuleSource,
    fetcher: RemoteRuleFetcher,
    remote_update_interval: Duration,
    status: StatusFile,
    update_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ProxyRuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRuleManager")
            .field("mode", &self.mode())
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("remote_urls", &self.fetcher.urls().len())
            .finish()
    }
}

impl ProxyRuleManager {
    /// Opens the manager rooted at `data_dir`.
    ///
    /// Restores the last mode from the status file, loads the local rules
    /// (creating an empty file if needed) and loads the remote rules if a
    /// remote file exists. Rule file errors are logged, not returned.
    pub async fn open(data_dir: &Path, options: RuleManagerOptions) -> Result<Self> {
        let status = StatusFile::open(data_dir.join(STATUS_FILE)).await;

        let mode = match status.get(LAST_PROXY_MODE).await {
            Some(value) => value.parse().unwrap_or_else(|e| {
                tracing::warn!("Ignoring stored proxy mode: {}", e);
                options.default_mode
            }),
            None => options.default_mode,
        };

        let manager = Self {
            mode: RwLock::new(mode),
            local: RuleSource::new("local", data_dir.join(LOCAL_RULES_FILE)),
            remote: RuleSource::new("remote", data_dir.join(REMOTE_RULES_FILE)),
            fetcher: RemoteRuleFetcher::new(
                options.remote_urls,
                options.remote_base64_encoded,
            )?,
            remote_update_interval: options.remote_update_interval,
            status,
            update_lock: tokio::sync::Mutex::new(()),
        };

        if let Err(e) = manager.local.load_or_create().await {
            tracing::error!("Failed to load local rules: {}", e);
        }
        if manager.remote.file_exists().await {
            if let Err(e) = manager.remote.load_from_disk().await {
                tracing::error!("Failed to load remote rules: {}", e);
            }
        }

        tracing::info!("Proxy mode: {}", mode);
        Ok(manager)
    }

    /// Returns the current proxy mode.
    #[inline]
    pub fn mode(&self) -> ProxyMode {
        *self.mode.read()
    }

    /// Sets the proxy mode and persists it.
    ///
    /// A persistence failure is logged; the new mode stays in effect.
    pub async fn set_mode(&self, mode: ProxyMode) {
        let previous = std::mem::replace(&mut *self.mode.write(), mode);
        if previous != mode {
            tracing::info!("Proxy mode changed: {} -> {}", previous, mode);
        }
        if let Err(e) = self.status.set(LAST_PROXY_MODE, mode.as_str()).await {
            tracing::error!("Failed to persist proxy mode: {}", e);
        }
    }

    /// Decides whether a request for `host` should go through the relay.
    pub fn should_relay(&self, host: &str) -> bool {
        match self.mode() {
            ProxyMode::Direct => false,
            ProxyMode::Relay => true,
            ProxyMode::Rule => self.test_host(host) == HostRuleTestResult::Black,
        }
    }

    /// Tests `host` against both rule sources, local first.
    pub fn test_host(&self, host: &str) -> HostRuleTestResult {
        match self.local.snapshot().test(host) {
            HostRuleTestResult::Unknown => {}
            result => return result,
        }
        match self.remote.snapshot().test(host) {
            HostRuleTestResult::Black => HostRuleTestResult::Black,
            _ => HostRuleTestResult::Unknown,
        }
    }

    /// Returns whether `host` would be relayed in RULE mode, whatever the
    /// current mode is.
    pub fn test_proxy_rule(&self, host: &str) -> bool {
        self.test_host(host) == HostRuleTestResult::Black
    }

    /// Returns the mode and rule counts.
    pub fn info(&self) -> ProxyRuleInfo {
        let local = self.local.counts();
        let remote = self.remote.counts();
        ProxyRuleInfo {
            mode: self.mode(),
            local_black: local.black,
            local_white: local.white,
            remote_black: remote.black,
            remote_white: remote.white,
        }
    }

    /// Returns the local rule source.
    pub fn local(&self) -> &RuleSource {
        &self.local
    }

    /// Returns the remote rule source.
    pub fn remote(&self) -> &RuleSource {
        &self.remote
    }

    /// Reloads the local rules from disk.
    pub async fn update_local(&self) -> Result<RuleCounts> {
        let _guard = self.update_lock.lock().await;
        self.local.load_or_create().await
    }

    /// Re-reads both rule files from disk.
    ///
    /// The remote rules are only reloaded when their file exists.
    pub async fn reload_rules(&self) -> Result<ProxyRuleInfo> {
        let _guard = self.update_lock.lock().await;
        self.local.load_or_create().await?;
        if self.remote.file_exists().await {
            self.remote.load_from_disk().await?;
        }
        Ok(self.info())
    }

    /// Downloads the remote rules, persists them and installs them.
    ///
    /// The previous remote rules stay in place if the download or decode
    /// fails. A failure to write the rule file is only logged.
    pub async fn update_remote(&self) -> Result<RuleCounts> {
        let _guard = self.update_lock.lock().await;

        let bytes = self.fetcher.fetch().await?;
        if let Err(e) = self.remote.persist(&bytes).await {
            tracing::error!("Failed to save remote rules: {}", e);
        }

        let rules = HostRuleSet::parse(&String::from_utf8_lossy(&bytes));
        let counts = self.remote.install(rules);

        let now = Utc::now().timestamp_millis();
        if let Err(e) = self.status.set(REMOTE_RULE_UPDATE_TIME, now.to_string()).await {
            tracing::error!("Failed to persist remote rule update time: {}", e);
        }

        Ok(counts)
    }

    /// Returns the epoch millis of the last successful remote update.
    pub async fn remote_update_time(&self) -> Option<i64> {
        self.status
            .get(REMOTE_RULE_UPDATE_TIME)
            .await
            .and_then(|value| value.parse().ok())
    }

    /// Returns true if the remote rules are missing or older than the
    /// configured update interval.
    pub async fn remote_update_due(&self) -> bool {
        if !self.remote.file_exists().await {
            return true;
        }
        let Some(last) = self.remote_update_time().await else {
            return true;
        };
        let interval = i64::try_from(self.remote_update_interval.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_sub(last) >= interval
    }

    /// Creates the background remote refresh task.
    ///
    /// Returns a future that should be spawned. It checks once immediately
    /// and then every [`REFRESH_CHECK_INTERVAL`].
    pub fn start_remote_refresh(self: Arc<Self>) -> impl std::future::Future<Output = ()> + Send {
        let manager = self;
        async move {
            if manager.fetcher.urls().is_empty() {
                tracing::info!("No remote rule URLs configured, remote refresh disabled");
                return;
            }
            loop {
                if manager.remote_update_due().await {
                    match manager.update_remote().await {
                        Ok(counts) => tracing::info!(
                            "Remote rules refreshed: {} black, {} white",
                            counts.black,
                            counts.white
                        ),
                        Err(e) => tracing::warn!("Failed to refresh remote rules: {}", e),
                    }
                }
                tokio::time::sleep(REFRESH_CHECK_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuleError;
    use base64::Engine;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn open(dir: &TempDir, options: RuleManagerOptions) -> ProxyRuleManager {
        ProxyRuleManager::open(dir.path(), options).await.unwrap()
    }

    /// Serves one canned HTTP response and returns its URL.
    async fn serve_once(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
        });
        format!("http://{addr}/rules.txt")
    }

    #[tokio::test]
    async fn test_open_creates_local_file_and_uses_default_mode() {
        let dir = TempDir::new().unwrap();
        let manager = open(
            &dir,
            RuleManagerOptions {
                default_mode: ProxyMode::Direct,
                ..Default::default()
            },
        )
        .await;

        assert_eq!(manager.mode(), ProxyMode::Direct);
        assert!(dir.path().join(LOCAL_RULES_FILE).exists());
        assert!(!dir.path().join(REMOTE_RULES_FILE).exists());
    }

    #[tokio::test]
    async fn test_mode_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let manager = open(&dir, RuleManagerOptions::default()).await;
            manager.set_mode(ProxyMode::Relay).await;
        }

        let manager = open(&dir, RuleManagerOptions::default()).await;
        assert_eq!(manager.mode(), ProxyMode::Relay);
    }

    #[tokio::test]
    async fn test_should_relay_follows_mode() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOCAL_RULES_FILE), "||blocked.test\n").unwrap();
        let manager = open(&dir, RuleManagerOptions::default()).await;

        manager.set_mode(ProxyMode::Direct).await;
        assert!(!manager.should_relay("blocked.test"));

        manager.set_mode(ProxyMode::Relay).await;
        assert!(manager.should_relay("open.test"));

        manager.set_mode(ProxyMode::Rule).await;
        assert!(manager.should_relay("www.blocked.test"));
        assert!(!manager.should_relay("open.test"));
    }

    #[tokio::test]
    async fn test_local_rules_take_precedence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(LOCAL_RULES_FILE),
            "||local-black.test\n@@||local-white.test\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join(REMOTE_RULES_FILE),
            "@@||local-black.test\n||local-white.test\n||remote.test\n@@||remote-white.test\n",
        )
        .unwrap();
        let manager = open(&dir, RuleManagerOptions::default()).await;

        assert_eq!(manager.test_host("local-black.test"), HostRuleTestResult::Black);
        assert_eq!(manager.test_host("local-white.test"), HostRuleTestResult::White);
        assert_eq!(manager.test_host("remote.test"), HostRuleTestResult::Black);
        assert_eq!(manager.test_host("remote-white.test"), HostRuleTestResult::Unknown);
        assert_eq!(manager.test_host("nothing.test"), HostRuleTestResult::Unknown);
    }

    #[tokio::test]
    async fn test_proxy_rule_ignores_mode() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOCAL_RULES_FILE), "||blocked.test\n").unwrap();
        let manager = open(&dir, RuleManagerOptions::default()).await;
        manager.set_mode(ProxyMode::Direct).await;

        assert!(manager.test_proxy_rule("blocked.test"));
        assert!(!manager.test_proxy_rule("open.test"));
    }

    #[tokio::test]
    async fn test_info_reports_counts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOCAL_RULES_FILE), "||a.test\n||b.test\n@@||c.test\n")
            .unwrap();
        std::fs::write(dir.path().join(REMOTE_RULES_FILE), "||d.test\n").unwrap();
        let manager = open(&dir, RuleManagerOptions::default()).await;

        let info = manager.info();
        assert_eq!(info.mode, ProxyMode::Rule);
        assert_eq!((info.local_black, info.local_white), (2, 1));
        assert_eq!((info.remote_black, info.remote_white), (1, 0));

        let json = serde_json::to_value(info).unwrap();
        assert_eq!(json["localBlack"], 2);
        assert_eq!(json["mode"], "RULE");
    }

    #[tokio::test]
    async fn test_update_local_picks_up_file_changes() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir, RuleManagerOptions::default()).await;
        assert_eq!(manager.info().local_black, 0);

        std::fs::write(dir.path().join(LOCAL_RULES_FILE), "||new.test\n").unwrap();
        let counts = manager.update_local().await.unwrap();
        assert_eq!(counts, RuleCounts { black: 1, white: 0 });
        assert!(manager.should_relay("new.test"));
    }

    #[tokio::test]
    async fn test_update_remote_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let text = "! list\n||remote.test\n@@||fine.test\n*.wild.test\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(text);
        let url = serve_once("200 OK", encoded.into_bytes()).await;

        let manager = open(
            &dir,
            RuleManagerOptions {
                remote_urls: vec![url],
                remote_base64_encoded: true,
                ..Default::default()
            },
        )
        .await;

        let counts = manager.update_remote().await.unwrap();
        assert_eq!(counts, RuleCounts { black: 2, white: 1 });
        assert!(manager.remote_update_time().await.is_some());
        assert!(!manager.remote_update_due().await);

        let hosts = ["remote.test", "a.remote.test", "fine.test", "x.wild.test", "none.test"];
        let downloaded: Vec<_> = hosts.iter().map(|h| manager.remote().snapshot().test(h)).collect();

        manager.remote().load_from_disk().await.unwrap();
        let reloaded: Vec<_> = hosts.iter().map(|h| manager.remote().snapshot().test(h)).collect();
        assert_eq!(downloaded, reloaded);
    }

    #[tokio::test]
    async fn test_update_remote_failure_keeps_previous_rules() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(REMOTE_RULES_FILE), "||kept.test\n").unwrap();
        let url = serve_once("404 Not Found", Vec::new()).await;

        let manager = open(
            &dir,
            RuleManagerOptions {
                remote_urls: vec![url],
                ..Default::default()
            },
        )
        .await;

        let err = manager.update_remote().await.unwrap_err();
        assert!(matches!(err, RuleError::Status { status: 404, .. }));
        assert_eq!(manager.test_host("kept.test"), HostRuleTestResult::Black);
        assert!(manager.remote_update_due().await);
    }

    #[tokio::test]
    async fn test_update_remote_without_urls() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir, RuleManagerOptions::default()).await;
        assert!(matches!(
            manager.update_remote().await,
            Err(RuleError::NoRemoteUrls)
        ));
    }

    #[tokio::test]
    async fn test_reload_rules_reads_both_files() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir, RuleManagerOptions::default()).await;
        assert!(!manager.test_proxy_rule("later.test"));

        std::fs::write(dir.path().join(LOCAL_RULES_FILE), "||later.test\n").unwrap();
        std::fs::write(dir.path().join(REMOTE_RULES_FILE), "||remote.test\n@@||ok.test\n").unwrap();

        let info = manager.reload_rules().await.unwrap();
        assert_eq!((info.local_black, info.remote_black, info.remote_white), (1, 1, 1));
        assert!(manager.test_proxy_rule("later.test"));
        assert!(manager.test_proxy_rule("remote.test"));
    }
}
