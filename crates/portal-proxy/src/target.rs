//! Request target parsing.

use hyper::http::uri::{Scheme, Uri};

use crate::error::{ProxyError, Result};

/// Host and port of a request target. IPv6 hosts are stored without
/// brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Authority {
    /// Parses a CONNECT target (`host:port`). The port is required.
    pub fn from_authority_uri(uri: &Uri) -> Result<Self> {
        if uri.scheme().is_some() {
            return Err(invalid(uri, "expected host:port"));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| invalid(uri, "missing authority"))?;
        let port = authority
            .port_u16()
            .ok_or_else(|| invalid(uri, "missing port"))?;
        Ok(Self {
            host: unbracket(authority.host()),
            port,
        })
    }

    /// Parses a CONNECT target from a string.
    pub fn from_authority_str(s: &str) -> Result<Self> {
        let uri: Uri = s.parse().map_err(|_| ProxyError::InvalidTarget(s.to_string()))?;
        Self::from_authority_uri(&uri)
    }

    /// Parses a plain-HTTP absolute URI, defaulting the port to 80.
    ///
    /// Only the `http` scheme is accepted; HTTPS goes through CONNECT.
    pub fn from_http_uri(uri: &Uri) -> Result<Self> {
        if uri.scheme() != Some(&Scheme::HTTP) {
            return Err(invalid(uri, "only http URLs can be forwarded"));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| invalid(uri, "missing authority"))?;
        if authority.host().is_empty() {
            return Err(invalid(uri, "missing host"));
        }
        Ok(Self {
            host: unbracket(authority.host()),
            port: authority.port_u16().unwrap_or(80),
        })
    }
}

fn unbracket(host: &str) -> String {
    host.trim_start_matches('[').trim_end_matches(']').to_string()
}

fn invalid(uri: &Uri, reason: &str) -> ProxyError {
    ProxyError::InvalidTarget(format!("{uri}: {reason}"))
}
