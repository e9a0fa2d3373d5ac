//! Control API route handlers.

use axum::extract::{Path, Query, State};
use axum::Json;
use tracing::{debug, info};

use portal_core::{ProxyMode, ProxyRuleInfo, RuleCounts};

use crate::error::{ApiError, Result};
use crate::models::{ProxyModeResponse, TestProxyRuleQuery, TestProxyRuleResponse};
use crate::state::AppState;

/// GET /api/proxyRuleInfo - Current mode and rule counts.
pub async fn get_proxy_rule_info(State(state): State<AppState>) -> Json<ProxyRuleInfo> {
    Json(state.rules.info())
}

/// GET /api/proxyMode/{mode} - Switch the proxy mode.
pub async fn set_proxy_mode(
    State(state): State<AppState>,
    Path(mode): Path<String>,
) -> Result<Json<ProxyModeResponse>> {
    let mode = mode
        .parse::<ProxyMode>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.rules.set_mode(mode).await;
    Ok(Json(ProxyModeResponse { mode }))
}

/// GET /api/testProxyRule?host= - Whether the rules would relay `host`.
pub async fn test_proxy_rule(
    State(state): State<AppState>,
    Query(query): Query<TestProxyRuleQuery>,
) -> Json<TestProxyRuleResponse> {
    let relay = state.rules.test_proxy_rule(&query.host);
    debug!(host = %query.host, relay, "Tested proxy rule");
    Json(TestProxyRuleResponse {
        host: query.host,
        relay,
    })
}

/// GET /api/updateLocalProxyRules - Reload the local rule file.
pub async fn update_local_proxy_rules(State(state): State<AppState>) -> Result<Json<RuleCounts>> {
    let counts = state.rules.update_local().await?;
    info!("Local rules reloaded: {} black, {} white", counts.black, counts.white);
    Ok(Json(counts))
}

/// GET /api/updateRemoteProxyRules - Download the remote rules now.
pub async fn update_remote_proxy_rules(
    State(state): State<AppState>,
) -> Result<Json<RuleCounts>> {
    let counts = state.rules.update_remote().await?;
    info!("Remote rules updated: {} black, {} white", counts.black, counts.white);
    Ok(Json(counts))
}

/// GET /api/reloadConfigurations - Re-read both rule files from disk.
pub async fn reload_configurations(State(state): State<AppState>) -> Result<Json<ProxyRuleInfo>> {
    let info = state.rules.reload_rules().await?;
    info!(
        "Rules reloaded: local {}/{}, remote {}/{}",
        info.local_black, info.local_white, info.remote_black, info.remote_white
    );
    Ok(Json(info))
}

/// Fallback for unknown control paths.
pub async fn not_found(uri: axum::http::Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}
