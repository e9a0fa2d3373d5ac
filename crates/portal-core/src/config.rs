//! Configuration model for `portal.config.json`.
//!
//! ```json
//! {
//!   "port": 8080,
//!   "directProxy": {
//!     "defaultMode": "rule",
//!     "remoteRuleUrls": ["https://example.com/rules.txt"],
//!     "relayHandler": { "type": "portal", "url": "http://peer:8080/", "password": "secret" }
//!   },
//!   "relayProxy": { "enabled": true, "password": "secret" }
//! }
//! ```
//!
//! Call [`PortalConfig::load`] (or [`PortalConfig::validate`] after
//! deserializing by hand); an invalid configuration must stop startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::proxy_mode::ProxyMode;
use crate::rule_manager::RuleManagerOptions;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "portal.config.json";

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_client_pool_size() -> usize {
    32
}

fn default_portal_pool_size() -> usize {
    128
}

fn default_update_interval_hours() -> u64 {
    24
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalConfig {
    /// Worker thread count.
    #[serde(default)]
    pub instance_number: InstanceNumber,
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Idle connections kept per origin by the direct client.
    #[serde(default = "default_client_pool_size")]
    pub client_pool_size_per_endpoint: usize,
    /// Directory for rule and status files.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Tear down tunnels idle for this many seconds.
    #[serde(default)]
    pub tunnel_idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub direct_proxy: DirectProxyConfig,
    #[serde(default)]
    pub relay_proxy: RelayProxyConfig,
}

/// Worker count: `"auto"` or a positive integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "InstanceNumberRepr")]
pub enum InstanceNumber {
    #[default]
    Auto,
    Fixed(usize),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InstanceNumberRepr {
    Count(usize),
    Keyword(String),
}

impl TryFrom<InstanceNumberRepr> for InstanceNumber {
    type Error = String;

    fn try_from(value: InstanceNumberRepr) -> Result<Self, Self::Error> {
        match value {
            InstanceNumberRepr::Count(0) => Err("instanceNumber must be positive".to_string()),
            InstanceNumberRepr::Count(n) => Ok(InstanceNumber::Fixed(n)),
            InstanceNumberRepr::Keyword(s) if s.eq_ignore_ascii_case("auto") => {
                Ok(InstanceNumber::Auto)
            }
            InstanceNumberRepr::Keyword(s) => Err(format!("invalid instanceNumber: {s}")),
        }
    }
}

impl InstanceNumber {
    /// Resolves to a concrete worker count.
    pub fn resolve(&self) -> usize {
        match self {
            InstanceNumber::Fixed(n) => *n,
            InstanceNumber::Auto => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
        }
    }
}

/// Control surface settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl WebConfig {
    /// Expected `Authorization` header value, if credentials are set.
    pub fn authorization(&self) -> Option<String> {
        basic_authorization(&self.username, &self.password)
    }
}

/// Direct (forward) proxy settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectProxyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub default_mode: ProxyMode,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub remote_rule_urls: Vec<String>,
    #[serde(default = "default_true")]
    pub remote_rule_base64_encoded: bool,
    #[serde(default = "default_update_interval_hours")]
    pub remote_rule_update_interval_hours: u64,
    #[serde(default)]
    pub relay_handler: Option<RelayHandlerConfig>,
}

impl Default for DirectProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_mode: ProxyMode::default(),
            username: String::new(),
            password: String::new(),
            remote_rule_urls: Vec::new(),
            remote_rule_base64_encoded: true,
            remote_rule_update_interval_hours: default_update_interval_hours(),
            relay_handler: None,
        }
    }
}

impl DirectProxyConfig {
    /// Expected `Proxy-Authorization` header value, if credentials are set.
    pub fn proxy_authorization(&self) -> Option<String> {
        basic_authorization(&self.username, &self.password)
    }

    /// Options for the rule manager.
    pub fn rule_manager_options(&self) -> RuleManagerOptions {
        RuleManagerOptions {
            default_mode: self.default_mode,
            remote_urls: self.remote_rule_urls.clone(),
            remote_base64_encoded: self.remote_rule_base64_encoded,
            remote_update_interval: Duration::from_secs(
                self.remote_rule_update_interval_hours.saturating_mul(60 * 60),
            ),
        }
    }
}

/// Relay handler selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayHandlerConfig {
    /// Relay through another Portal instance.
    Portal(PortalRelayConfig),
    /// Relay through a third-party HTTP or SOCKS proxy.
    Proxy(UpstreamProxyConfig),
}

/// Peer relay settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalRelayConfig {
    /// Peer URL, e.g. `http://peer.example.com:8080/`.
    pub url: String,
    /// Shared secret, in plain text.
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_portal_pool_size")]
    pub client_pool_size: usize,
}

/// Upstream proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Socks4,
    Socks5,
}

/// Third-party proxy settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamProxyConfig {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_client_pool_size")]
    pub client_pool_size_per_endpoint: usize,
}

/// Peer relay receiver settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Shared secret, in plain text.
    #[serde(default)]
    pub password: String,
}

impl PortalConfig {
    /// Reads, parses and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values serde cannot check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid("host must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("port must be in 1..=65535"));
        }
        if self.client_pool_size_per_endpoint == 0 {
            return Err(invalid("clientPoolSizePerEndpoint must be positive"));
        }

        if self.direct_proxy.enabled {
            match &self.direct_proxy.relay_handler {
                None => {
                    return Err(invalid(
                        "directProxy.relayHandler is required when the direct proxy is enabled",
                    ))
                }
                Some(RelayHandlerConfig::Portal(portal)) => portal.validate()?,
                Some(RelayHandlerConfig::Proxy(proxy)) => proxy.validate()?,
            }
            for url in &self.direct_proxy.remote_rule_urls {
                reqwest::Url::parse(url)
                    .map_err(|e| invalid(format!("invalid remote rule URL {url}: {e}")))?;
            }
        }

        Ok(())
    }

    /// Bind address as `host:port`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Directory for rule and status files.
    ///
    /// Uses `dataDir` when set, else the platform data directory, else the
    /// working directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| ProjectDirs::from("", "portal", "Portal").map(|d| d.data_dir().to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Tunnel idle timeout, if configured.
    pub fn tunnel_idle_timeout(&self) -> Option<Duration> {
        self.tunnel_idle_timeout_secs.map(Duration::from_secs)
    }
}

impl PortalRelayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| invalid(format!("invalid portal relay URL {}: {e}", self.url)))?;
        if url.scheme() != "http" {
            return Err(invalid(format!(
                "portal relay URL must use http, got {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(invalid("portal relay URL has no host"));
        }
        if self.client_pool_size == 0 {
            return Err(invalid("portal relay clientPoolSize must be positive"));
        }
        Ok(())
    }

    /// The shared secret as sent on the wire.
    pub fn encoded_password(&self) -> String {
        encode_secret(&self.password)
    }
}

impl UpstreamProxyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid("upstream proxy host must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("upstream proxy port must be in 1..=65535"));
        }
        if self.client_pool_size_per_endpoint == 0 {
            return Err(invalid("upstream proxy clientPoolSizePerEndpoint must be positive"));
        }
        Ok(())
    }

    /// Username and password, if a username is set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() {
            None
        } else {
            Some((&self.username, &self.password))
        }
    }
}

impl RelayProxyConfig {
    /// The shared secret as compared on the wire.
    pub fn encoded_password(&self) -> String {
        encode_secret(&self.password)
    }
}

/// Encodes a shared secret for the wire. Empty stays empty.
pub fn encode_secret(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        STANDARD.encode(secret)
    }
}

/// Builds a `Basic` credential when both parts are non-empty.
pub fn basic_authorization(username: &str, password: &str) -> Option<String> {
    if username.is_empty() || password.is_empty() {
        return None;
    }
    Some(format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))))
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn parse(value: serde_json::Value) -> Result<PortalConfig, ConfigError> {
        let config: PortalConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    fn portal_relay() -> serde_json::Value {
        json!({ "type": "portal", "url": "http://peer.test:8080/", "password": "abc" })
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse(json!({
            "port": 8080,
            "directProxy": { "relayHandler": portal_relay() }
        }))
        .unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.instance_number, InstanceNumber::Auto);
        assert_eq!(config.client_pool_size_per_endpoint, 32);
        assert!(config.web.enabled);
        assert!(config.direct_proxy.enabled);
        assert_eq!(config.direct_proxy.default_mode, ProxyMode::Rule);
        assert!(config.direct_proxy.remote_rule_base64_encoded);
        assert!(!config.relay_proxy.enabled);
        assert_eq!(config.tunnel_idle_timeout(), None);

        match config.direct_proxy.relay_handler {
            Some(RelayHandlerConfig::Portal(ref portal)) => {
                assert_eq!(portal.client_pool_size, 128);
                assert_eq!(portal.encoded_password(), "YWJj");
            }
            ref other => panic!("unexpected relay handler: {:?}", other),
        }
    }

    #[test]
    fn test_upstream_proxy_config() {
        let config = parse(json!({
            "port": 8080,
            "instanceNumber": 4,
            "directProxy": {
                "defaultMode": "Direct",
                "relayHandler": {
                    "type": "proxy",
                    "protocol": "socks5",
                    "host": "127.0.0.1",
                    "port": 1080,
                    "username": "user",
                    "password": "pass"
                }
            }
        }))
        .unwrap();

        assert_eq!(config.instance_number.resolve(), 4);
        assert_eq!(config.direct_proxy.default_mode, ProxyMode::Direct);
        match config.direct_proxy.relay_handler {
            Some(RelayHandlerConfig::Proxy(ref proxy)) => {
                assert_eq!(proxy.protocol, ProxyProtocol::Socks5);
                assert_eq!(proxy.credentials(), Some(("user", "pass")));
            }
            ref other => panic!("unexpected relay handler: {:?}", other),
        }
    }

    #[test]
    fn test_relay_handler_required_for_direct_proxy() {
        let err = parse(json!({ "port": 8080 })).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = parse(json!({
            "port": 8080,
            "directProxy": { "enabled": false },
            "relayProxy": { "enabled": true }
        }))
        .unwrap();
        assert!(config.relay_proxy.enabled);
        assert_eq!(config.relay_proxy.encoded_password(), "");
    }

    #[test]
    fn test_rejects_invalid_values() {
        let bad_port = parse(json!({ "port": 0, "directProxy": { "relayHandler": portal_relay() } }));
        assert!(bad_port.is_err());

        let bad_mode = parse(json!({
            "port": 8080,
            "directProxy": { "defaultMode": "sometimes", "relayHandler": portal_relay() }
        }));
        assert!(matches!(bad_mode, Err(ConfigError::Parse(_))));

        let https_peer = parse(json!({
            "port": 8080,
            "directProxy": { "relayHandler": { "type": "portal", "url": "https://peer.test/" } }
        }));
        assert!(matches!(https_peer, Err(ConfigError::Invalid(_))));

        let bad_instances = parse(json!({
            "port": 8080,
            "instanceNumber": "many",
            "directProxy": { "relayHandler": portal_relay() }
        }));
        assert!(matches!(bad_instances, Err(ConfigError::Parse(_))));

        let bad_url = parse(json!({
            "port": 8080,
            "directProxy": { "remoteRuleUrls": ["not a url"], "relayHandler": portal_relay() }
        }));
        assert!(matches!(bad_url, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_basic_authorization() {
        assert_eq!(
            basic_authorization("user", "pass").as_deref(),
            Some("Basic dXNlcjpwYXNz")
        );
        assert_eq!(basic_authorization("user", ""), None);
        assert_eq!(basic_authorization("", "pass"), None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            json!({
                "port": 9090,
                "dataDir": dir.path(),
                "tunnelIdleTimeoutSecs": 300,
                "directProxy": { "relayHandler": portal_relay() }
            })
            .to_string(),
        )
        .unwrap();

        let config = PortalConfig::load(&path).unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:9090");
        assert_eq!(config.data_dir(), dir.path());
        assert_eq!(config.tunnel_idle_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = PortalConfig::load(Path::new("/nonexistent/portal.config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
