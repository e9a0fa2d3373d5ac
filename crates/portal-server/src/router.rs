//! Request classification and dispatch.
//!
//! ```text
//! *            → 400
//! /…  PORTAL   → peer relay receiver
//! /…  GET      → control API
//! /…  other    → 405
//! absolute     → direct proxy (CONNECT or plain http://)
//! ```
//!
//! Every request logs its routing decision once. A tunnel or forward that
//! fails afterwards adds a `FAILED` line.

use std::net::SocketAddr;

use axum::Router;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode, Uri};
use tower::ServiceExt;
use tracing::{debug, warn};

use portal_proxy::body::{status_response, BoxError, ProxyBody};
use portal_proxy::portal::{self, PortalEnvelope, X_PORTAL_METHOD, X_PORTAL_REAL_IP, X_PORTAL_URI};
use portal_proxy::{spawn_tunnel, AccessKind, AccessRecord, Authority, BoxedStream, HeaderFilter};

use crate::state::AppState;

/// Request shape, decided from the method and request target alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Asterisk-form or otherwise unusable target.
    Malformed,
    /// Origin-form `PORTAL` request from a peer.
    PeerRelay,
    /// Origin-form `GET`.
    Control,
    /// Origin-form with any other method.
    MethodNotAllowed,
    /// Absolute-form or authority-form.
    DirectProxy,
}

/// Classifies a request.
pub fn classify(method: &Method, uri: &Uri) -> Route {
    if uri.scheme().is_some() || uri.authority().is_some() {
        return Route::DirectProxy;
    }
    if !uri.path().starts_with('/') {
        return Route::Malformed;
    }
    if portal::is_portal_method(method) {
        Route::PeerRelay
    } else if method == Method::GET {
        Route::Control
    } else {
        Route::MethodNotAllowed
    }
}

/// Routes one request from `client`.
pub async fn route(
    state: AppState,
    control: Option<Router>,
    req: Request<ProxyBody>,
    client: SocketAddr,
) -> Response<ProxyBody> {
    let client_ip = client.ip().to_string();

    match classify(req.method(), req.uri()) {
        Route::Malformed => deny(&request_record(&req, &client_ip), StatusCode::BAD_REQUEST),
        Route::MethodNotAllowed => {
            deny(&request_record(&req, &client_ip), StatusCode::METHOD_NOT_ALLOWED)
        }
        Route::Control => serve_control(control, req, &client_ip).await,
        Route::PeerRelay => receive_peer(&state, req, &client_ip).await,
        Route::DirectProxy => direct_proxy(&state, req, &client_ip).await,
    }
}

fn request_record<B>(req: &Request<B>, client_ip: &str) -> AccessRecord {
    AccessRecord::new(client_ip, req.method().as_str(), req.uri().to_string())
}

fn deny(record: &AccessRecord, status: StatusCode) -> Response<ProxyBody> {
    record.log(AccessKind::Denied);
    status_response(status)
}

async fn serve_control(
    control: Option<Router>,
    req: Request<ProxyBody>,
    client_ip: &str,
) -> Response<ProxyBody> {
    let record = request_record(&req, client_ip);
    let Some(control) = control else {
        return deny(&record, StatusCode::NOT_FOUND);
    };

    let response = match tokio::spawn(control.oneshot(req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(never)) => match never {},
        Err(e) => {
            warn!("Control request task failed: {}", e);
            record.log(AccessKind::Failed);
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let kind = if response.status().is_client_error() {
        AccessKind::Denied
    } else if response.status().is_server_error() {
        AccessKind::Failed
    } else {
        AccessKind::Accepted
    };
    record.log(kind);
    response.map(|body| body.map_err(BoxError::from).boxed_unsync())
}

async fn direct_proxy(state: &AppState, req: Request<ProxyBody>, client_ip: &str) -> Response<ProxyBody> {
    let record = request_record(&req, client_ip);

    if !state.settings.direct_proxy_enabled {
        return deny(&record, StatusCode::FORBIDDEN);
    }
    if let Some(expected) = &state.settings.proxy_authorization {
        let authorized = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .is_some_and(|value| value.as_bytes() == expected.as_bytes());
        if !authorized {
            let mut response = deny(&record, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
            response.headers_mut().insert(
                PROXY_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"portal\""),
            );
            return response;
        }
    }

    let method = req.method().clone();
    let uri = req.uri().clone();
    dispatch(state, req, method, uri, client_ip, record, true).await
}

/// Access record for a peer request, preferring the carried values.
fn peer_record(headers: &HeaderMap, client_ip: &str, req_method: &Method, req_uri: &Uri) -> AccessRecord {
    AccessRecord::new(
        header_str(headers, &X_PORTAL_REAL_IP).unwrap_or(client_ip),
        header_str(headers, &X_PORTAL_METHOD).unwrap_or(req_method.as_str()),
        header_str(headers, &X_PORTAL_URI)
            .map(str::to_string)
            .unwrap_or_else(|| req_uri.to_string()),
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn receive_peer(state: &AppState, req: Request<ProxyBody>, client_ip: &str) -> Response<ProxyBody> {
    let record = peer_record(req.headers(), client_ip, req.method(), req.uri());

    if !state.settings.relay_proxy_enabled {
        return deny(&record, StatusCode::METHOD_NOT_ALLOWED);
    }

    let envelope = match PortalEnvelope::from_headers(req.headers())
        .and_then(|envelope| envelope.authenticate(&state.settings.relay_secret).map(|_| envelope))
    {
        Ok(envelope) => envelope,
        Err(rejection) => {
            debug!("Rejected peer request from {}: {}", client_ip, rejection);
            return deny(&record, StatusCode::METHOD_NOT_ALLOWED);
        }
    };

    let uri: Uri = match envelope.uri.parse() {
        Ok(uri) => uri,
        Err(e) => {
            debug!("Invalid peer URI {}: {}", envelope.uri, e);
            return deny(&record, target_rejection(false));
        }
    };
    let real_ip = envelope.real_ip.as_deref().unwrap_or(client_ip);
    dispatch(state, req, envelope.method, uri, real_ip, record, false).await
}

/// Status for an unusable target: `502` for proxy clients, `405` for peers.
fn target_rejection(as_direct_proxy: bool) -> StatusCode {
    if as_direct_proxy {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::METHOD_NOT_ALLOWED
    }
}

fn dispatch_kind(relayed: bool, as_direct_proxy: bool) -> AccessKind {
    match (relayed, as_direct_proxy) {
        (true, _) => AccessKind::Relayed,
        (false, true) => AccessKind::Direct,
        (false, false) => AccessKind::Accepted,
    }
}

/// Sends the request to the origin or through the relay.
///
/// With `as_direct_proxy` unset the request came from a peer: it always
/// goes straight to the origin and a tunnel is answered with `101`.
async fn dispatch(
    state: &AppState,
    req: Request<ProxyBody>,
    method: Method,
    uri: Uri,
    client_ip: &str,
    record: AccessRecord,
    as_direct_proxy: bool,
) -> Response<ProxyBody> {
    if method == Method::CONNECT {
        tunnel(state, req, &uri, client_ip, record, as_direct_proxy).await
    } else {
        forward(state, req, method, uri, client_ip, record, as_direct_proxy).await
    }
}

async fn tunnel(
    state: &AppState,
    req: Request<ProxyBody>,
    uri: &Uri,
    client_ip: &str,
    record: AccessRecord,
    as_direct_proxy: bool,
) -> Response<ProxyBody> {
    let target = match Authority::from_authority_uri(uri) {
        Ok(target) => target,
        Err(e) => {
            debug!("Invalid CONNECT target: {}", e);
            return deny(&record, target_rejection(as_direct_proxy));
        }
    };

    let relay = if as_direct_proxy {
        state.relay_for(&target.host)
    } else {
        None
    };
    record.log(dispatch_kind(relay.is_some(), as_direct_proxy));
    let stream = match relay {
        Some(relay) => relay.relay_connect(req.headers(), &target, client_ip).await,
        None => state
            .forwarder
            .connect_origin(&target)
            .await
            .map(|stream| Box::new(stream) as BoxedStream),
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to open tunnel to {}: {}", target, e);
            record.log(AccessKind::Failed);
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    spawn_tunnel(
        hyper::upgrade::on(req),
        stream,
        state.settings.tunnel_idle_timeout,
        target.to_string(),
    );

    if as_direct_proxy {
        status_response(StatusCode::OK)
    } else {
        let mut response = status_response(StatusCode::SWITCHING_PROTOCOLS);
        portal::write_upgrade_headers(response.headers_mut());
        response
    }
}

async fn forward(
    state: &AppState,
    req: Request<ProxyBody>,
    method: Method,
    uri: Uri,
    client_ip: &str,
    record: AccessRecord,
    as_direct_proxy: bool,
) -> Response<ProxyBody> {
    let target = match Authority::from_http_uri(&uri) {
        Ok(target) => target,
        Err(e) => {
            debug!("Refusing to forward {}: {}", uri, e);
            return deny(&record, target_rejection(as_direct_proxy));
        }
    };

    let relay = if as_direct_proxy {
        state.relay_for(&target.host)
    } else {
        None
    };
    record.log(dispatch_kind(relay.is_some(), as_direct_proxy));
    let result = match relay {
        Some(relay) => relay.relay_non_connect(req, method, uri, client_ip).await,
        None if as_direct_proxy => {
            state.forwarder.forward(req, method, uri, HeaderFilter::ORIGIN).await
        }
        None => state.forwarder.forward(req, method, uri, HeaderFilter::PEER).await,
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            warn!("Failed to forward request to {}: {}", target, e);
            record.log(AccessKind::Failed);
            status_response(StatusCode::BAD_GATEWAY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(name: &str) -> Method {
        Method::from_bytes(name.as_bytes()).unwrap()
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_classify_asterisk_form() {
        assert_eq!(classify(&Method::OPTIONS, &uri("*")), Route::Malformed);
    }

    #[test]
    fn test_classify_origin_form() {
        assert_eq!(classify(&method("PORTAL"), &uri("/")), Route::PeerRelay);
        assert_eq!(classify(&Method::GET, &uri("/api/proxyRuleInfo")), Route::Control);
        assert_eq!(classify(&Method::POST, &uri("/api/proxyRuleInfo")), Route::MethodNotAllowed);
        assert_eq!(classify(&method("portal"), &uri("/")), Route::MethodNotAllowed);
    }

    #[test]
    fn test_target_rejection_depends_on_caller() {
        assert_eq!(target_rejection(true), StatusCode::BAD_GATEWAY);
        assert_eq!(target_rejection(false), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_dispatch_kind() {
        assert_eq!(dispatch_kind(true, true), AccessKind::Relayed);
        assert_eq!(dispatch_kind(false, true), AccessKind::Direct);
        assert_eq!(dispatch_kind(false, false), AccessKind::Accepted);
    }

    #[test]
    fn test_classify_proxy_forms() {
        assert_eq!(classify(&Method::CONNECT, &uri("example.com:443")), Route::DirectProxy);
        assert_eq!(classify(&Method::GET, &uri("http://x.test/")), Route::DirectProxy);
        assert_eq!(classify(&Method::GET, &uri("https://x.test/")), Route::DirectProxy);
    }
}
