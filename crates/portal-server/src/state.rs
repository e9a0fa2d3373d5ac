//! Shared state for the router and the control API.

use std::sync::Arc;
use std::time::Duration;

use portal_core::{PortalConfig, ProxyRuleManager};
use portal_proxy::{Forwarder, RelayHandler};

use crate::ServerError;

/// Per-feature switches and credentials resolved from configuration.
#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    /// Serve absolute-form requests and CONNECT.
    pub direct_proxy_enabled: bool,
    /// Accept `PORTAL` requests from peers.
    pub relay_proxy_enabled: bool,
    /// Serve the control API.
    pub web_enabled: bool,
    /// Expected `Proxy-Authorization`, if proxy credentials are set.
    pub proxy_authorization: Option<String>,
    /// Expected `Authorization` for the control API.
    pub web_authorization: Option<String>,
    /// Encoded peer secret. Empty means any peer sending no password is
    /// accepted.
    pub relay_secret: String,
    pub tunnel_idle_timeout: Option<Duration>,
}

impl ProxySettings {
    pub fn from_config(config: &PortalConfig) -> Self {
        Self {
            direct_proxy_enabled: config.direct_proxy.enabled,
            relay_proxy_enabled: config.relay_proxy.enabled,
            web_enabled: config.web.enabled,
            proxy_authorization: config.direct_proxy.proxy_authorization(),
            web_authorization: config.web.authorization(),
            relay_secret: config.relay_proxy.encoded_password(),
            tunnel_idle_timeout: config.tunnel_idle_timeout(),
        }
    }

    /// The control API is only mounted next to the direct proxy.
    pub fn control_enabled(&self) -> bool {
        self.web_enabled && self.direct_proxy_enabled
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Proxy mode and rule sources.
    pub rules: Arc<ProxyRuleManager>,
    /// Direct origin access.
    pub forwarder: Forwarder,
    /// Relay for hosts the rules send elsewhere. Absent when the direct
    /// proxy is disabled.
    pub relay: Option<Arc<RelayHandler>>,
    pub settings: Arc<ProxySettings>,
}

impl AppState {
    /// Builds the state for `config` around an opened rule manager.
    pub fn new(config: &PortalConfig, rules: Arc<ProxyRuleManager>) -> Result<Self, ServerError> {
        let relay = match (&config.direct_proxy.relay_handler, config.direct_proxy.enabled) {
            (Some(relay), true) => Some(Arc::new(RelayHandler::from_config(relay)?)),
            _ => None,
        };

        let settings = ProxySettings::from_config(config);
        if settings.relay_proxy_enabled && settings.relay_secret.is_empty() {
            tracing::warn!("Relay proxy is enabled without a password; any peer can use it");
        }

        Ok(Self {
            rules,
            forwarder: Forwarder::new(config.client_pool_size_per_endpoint),
            relay,
            settings: Arc::new(settings),
        })
    }

    /// Creates state from parts.
    pub fn with_parts(
        rules: Arc<ProxyRuleManager>,
        relay: Option<RelayHandler>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            rules,
            forwarder: Forwarder::new(8),
            relay: relay.map(Arc::new),
            settings: Arc::new(settings),
        }
    }

    /// The relay to use for `host`, or `None` to go direct.
    pub fn relay_for(&self, host: &str) -> Option<&RelayHandler> {
        let relay = self.relay.as_deref()?;
        if self.rules.should_relay(host) {
            Some(relay)
        } else {
            None
        }
    }
}
