//! The control API router.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::warn;

use crate::error::ApiError;
use crate::handlers;
use crate::state::AppState;

/// Builds the control API.
pub fn control_router(state: AppState) -> Router {
    Router::new()
        .route("/api/proxyRuleInfo", get(handlers::get_proxy_rule_info))
        .route("/api/proxyMode/{mode}", get(handlers::set_proxy_mode))
        .route("/api/testProxyRule", get(handlers::test_proxy_rule))
        .route("/api/updateLocalProxyRules", get(handlers::update_local_proxy_rules))
        .route("/api/updateRemoteProxyRules", get(handlers::update_remote_proxy_rules))
        .route("/api/reloadConfigurations", get(handlers::reload_configurations))
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), require_basic_auth))
        .with_state(state)
}

/// Requires `Authorization: Basic` when web credentials are configured.
async fn require_basic_auth(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let Some(expected) = &state.settings.web_authorization else {
        return next.run(request).await;
    };

    let provided = request.headers().get(AUTHORIZATION);
    match provided {
        Some(value) if value.as_bytes() == expected.as_bytes() => next.run(request).await,
        Some(_) => {
            warn!("Invalid control API credentials");
            ApiError::Unauthorized.into_response()
        }
        None => ApiError::Unauthorized.into_response(),
    }
}
