//! Portal Core - host rules, rule sources, proxy mode and configuration.
//!
//! This crate holds everything the proxy consults when deciding whether a
//! request goes straight to the origin or through the relay:
//!
//! - [`host_rules`] parses Adblock-style host rules into black/white suffix sets
//! - [`rule_source`] binds a rule set to its file and downloads remote lists
//! - [`rule_manager`] owns the proxy mode and both rule sources
//! - [`status`] persists the mode and remote update time as `key=value` lines
//! - [`config`] is the `portal.config.json` model

pub mod config;
pub mod error;
pub mod host_rules;
pub mod proxy_mode;
pub mod rule_manager;
pub mod rule_source;
pub mod status;

pub use config::{
    PortalConfig, PortalRelayConfig, ProxyProtocol, RelayHandlerConfig, UpstreamProxyConfig,
};
pub use error::{ConfigError, Result, RuleError};
pub use host_rules::{HostRuleSet, HostRuleTestResult, RuleCounts};
pub use proxy_mode::ProxyMode;
pub use rule_manager::{ProxyRuleInfo, ProxyRuleManager, RuleManagerOptions};
pub use rule_source::{RemoteRuleFetcher, RuleSource};
