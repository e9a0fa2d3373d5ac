//! Relay handlers.
//!
//! The relay handler is chosen once from configuration. [`RelayHandler::Portal`]
//! talks to another Portal instance over the Portal sub-protocol;
//! [`RelayHandler::Upstream`] uses a third-party HTTP or SOCKS proxy.
//!
//! Tunnels always get a dedicated outbound connection. Plain requests share
//! a pooled client.

use std::sync::Arc;

use hyper::header::{HeaderMap, HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::http::uri::{PathAndQuery, Scheme};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use portal_core::{PortalRelayConfig, RelayHandlerConfig, UpstreamProxyConfig};

use crate::body::{self, ProxyBody};
use crate::connector::UpstreamConnector;
use crate::error::{ProxyError, Result};
use crate::forward::{http_connector, outbound_request, pooled_client, send};
use crate::headers::HeaderFilter;
use crate::portal::{self, PortalEnvelope};
use crate::target::Authority;
use crate::upstream::{BoxedStream, UpstreamProxy};

/// Where relayed traffic goes.
#[derive(Clone)]
pub enum RelayHandler {
    Portal(PortalRelay),
    Upstream(UpstreamRelay),
}

impl RelayHandler {
    /// Builds the handler selected in configuration.
    pub fn from_config(config: &RelayHandlerConfig) -> Result<Self> {
        match config {
            RelayHandlerConfig::Portal(portal) => Ok(Self::Portal(PortalRelay::from_config(portal)?)),
            RelayHandlerConfig::Proxy(proxy) => Ok(Self::Upstream(UpstreamRelay::from_config(proxy))),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Portal(_) => "portal",
            Self::Upstream(_) => "proxy",
        }
    }

    /// Opens a raw stream to `target` through the relay. `headers` are the
    /// client's CONNECT request headers.
    ///
    /// The caller answers the client and splices once this returns.
    pub async fn relay_connect(
        &self,
        headers: &HeaderMap,
        target: &Authority,
        client_ip: &str,
    ) -> Result<BoxedStream> {
        match self {
            Self::Portal(relay) => relay.connect(headers, target, client_ip).await,
            Self::Upstream(relay) => relay.proxy.connect(target).await,
        }
    }

    /// Sends a plain HTTP request through the relay.
    pub async fn relay_non_connect(
        &self,
        req: Request<ProxyBody>,
        method: Method,
        uri: Uri,
        client_ip: &str,
    ) -> Result<Response<ProxyBody>> {
        match self {
            Self::Portal(relay) => relay.request(req, method, uri, client_ip).await,
            Self::Upstream(relay) => relay.request(req, method, uri).await,
        }
    }
}

/// Relays to a peer Portal instance.
#[derive(Clone)]
pub struct PortalRelay {
    peer: Authority,
    peer_uri: Uri,
    encoded_password: String,
    client: Client<HttpConnector, ProxyBody>,
}

impl std::fmt::Debug for PortalRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalRelay")
            .field("peer_uri", &self.peer_uri)
            .finish()
    }
}

impl PortalRelay {
    pub fn from_config(config: &PortalRelayConfig) -> Result<Self> {
        let url: Uri = config
            .url
            .parse()
            .map_err(|_| ProxyError::InvalidTarget(config.url.clone()))?;
        let peer = Authority::from_http_uri(&url)?;
        let path = url
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        let peer_uri = Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(peer.to_string())
            .path_and_query(path)
            .build()?;

        Ok(Self {
            peer,
            peer_uri,
            encoded_password: config.encoded_password(),
            client: pooled_client(http_connector(), config.client_pool_size),
        })
    }

    fn envelope(&self, method: &Method, uri: String, client_ip: &str) -> PortalEnvelope {
        PortalEnvelope {
            method: method.clone(),
            uri,
            password: self.encoded_password.clone(),
            real_ip: Some(client_ip.to_string()),
        }
    }

    fn portal_request(
        &self,
        uri: Uri,
        headers: &HeaderMap,
        envelope: &PortalEnvelope,
        body: ProxyBody,
    ) -> Result<Request<ProxyBody>> {
        let method = Method::from_bytes(portal::METHOD.as_bytes())
            .map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
        let mut request = outbound_request(method, uri, headers, HeaderFilter::PEER, body)?;
        envelope
            .write_headers(request.headers_mut())
            .map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
        Ok(request)
    }

    /// Opens a dedicated connection to the peer and upgrades it into a
    /// tunnel to `target`.
    async fn connect(&self, headers: &HeaderMap, target: &Authority, client_ip: &str) -> Result<BoxedStream> {
        let stream = TcpStream::connect((self.peer.host.as_str(), self.peer.port)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for peer {}: {}", self.peer, e);
        }
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        let peer = self.peer.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!("Peer connection to {} ended: {}", peer, e);
            }
        });

        let origin_form = self
            .peer_uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/")
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
        let envelope = self.envelope(&Method::CONNECT, target.to_string(), client_ip);
        let mut request = self.portal_request(origin_form, headers, &envelope, body::empty())?;
        request.headers_mut().insert(
            HOST,
            HeaderValue::from_str(&self.peer.to_string())
                .map_err(|e| ProxyError::InvalidTarget(e.to_string()))?,
        );
        portal::write_upgrade_headers(request.headers_mut());

        let mut response = sender.send_request(request).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(ProxyError::UnexpectedStatus(response.status()));
        }
        let upgraded = hyper::upgrade::on(&mut response).await?;
        Ok(Box::new(TokioIo::new(upgraded)))
    }

    async fn request(
        &self,
        req: Request<ProxyBody>,
        method: Method,
        uri: Uri,
        client_ip: &str,
    ) -> Result<Response<ProxyBody>> {
        let (parts, body) = req.into_parts();
        let envelope = self.envelope(&method, uri.to_string(), client_ip);
        let request = self.portal_request(self.peer_uri.clone(), &parts.headers, &envelope, body)?;
        send(&self.client, request).await
    }
}

/// Relays through a third-party proxy.
#[derive(Clone)]
pub struct UpstreamRelay {
    proxy: Arc<UpstreamProxy>,
    client: Client<UpstreamConnector, ProxyBody>,
}

impl UpstreamRelay {
    pub fn from_config(config: &UpstreamProxyConfig) -> Self {
        let proxy = Arc::new(UpstreamProxy::from_config(config));
        let client = pooled_client(
            UpstreamConnector::new(proxy.clone()),
            config.client_pool_size_per_endpoint,
        );
        Self { proxy, client }
    }

    async fn request(&self, req: Request<ProxyBody>, method: Method, uri: Uri) -> Result<Response<ProxyBody>> {
        let (parts, body) = req.into_parts();
        let mut request = outbound_request(method, uri, &parts.headers, HeaderFilter::ORIGIN, body)?;
        if let Some(authorization) = self.proxy.proxy_authorization() {
            request.headers_mut().insert(PROXY_AUTHORIZATION, authorization);
        }
        send(&self.client, request).await
    }
}
