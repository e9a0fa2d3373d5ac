//! Error types for the proxy.

use hyper::StatusCode;
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP protocol error on a dedicated connection.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Pooled client error.
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    /// Request could not be built.
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    /// SOCKS handshake failed.
    #[error("SOCKS error: {0}")]
    Socks(#[from] tokio_socks::Error),

    /// Request target is not usable.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Relay or upstream proxy answered with an unexpected status.
    #[error("unexpected status {0}")]
    UnexpectedStatus(StatusCode),

    /// Upstream proxy sent a malformed response.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
