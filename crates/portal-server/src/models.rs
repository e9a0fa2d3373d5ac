//! API request and response models.

use serde::{Deserialize, Serialize};

use portal_core::ProxyMode;

/// Response body for GET /api/proxyMode/{mode}.
#[derive(Debug, Serialize)]
pub struct ProxyModeResponse {
    pub mode: ProxyMode,
}

/// Query parameters for GET /api/testProxyRule.
#[derive(Debug, Deserialize)]
pub struct TestProxyRuleQuery {
    pub host: String,
}

/// Response body for GET /api/testProxyRule.
#[derive(Debug, Serialize)]
pub struct TestProxyRuleResponse {
    pub host: String,
    /// Whether the rules alone would send this host through the relay.
    pub relay: bool,
}
