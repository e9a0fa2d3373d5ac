//! The Portal relay sub-protocol.
//!
//! A relaying instance sends an origin-form request with the `PORTAL`
//! method to its peer. The original request travels in headers:
//!
//! ```text
//! PORTAL / HTTP/1.1
//! Connection: Upgrade            (CONNECT only)
//! Upgrade: Portal                (CONNECT only)
//! X-Portal-Method: CONNECT
//! X-Portal-URI: example.com:443  (absolute URI for other methods)
//! X-Portal-Password: <base64>    (omitted when no secret is set)
//! X-Portal-Real-IP: 203.0.113.7
//! ```
//!
//! The peer answers `101 Switching Protocols` for CONNECT and the
//! connection becomes a raw tunnel. Other methods get the origin's response.

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, UPGRADE};
use hyper::Method;
use thiserror::Error;

/// Reserved pseudo-method.
pub const METHOD: &str = "PORTAL";

/// Protocol token sent in `Upgrade`.
pub const UPGRADE_PROTOCOL: &str = "Portal";

/// Prefix shared by every Portal header, in lower case.
pub const HEADER_PREFIX: &str = "x-portal-";

pub const X_PORTAL_METHOD: HeaderName = HeaderName::from_static("x-portal-method");
pub const X_PORTAL_URI: HeaderName = HeaderName::from_static("x-portal-uri");
pub const X_PORTAL_PASSWORD: HeaderName = HeaderName::from_static("x-portal-password");
pub const X_PORTAL_REAL_IP: HeaderName = HeaderName::from_static("x-portal-real-ip");

/// Why a Portal request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortalRejection {
    #[error("missing or invalid X-Portal-Method")]
    InvalidMethod,
    #[error("missing X-Portal-URI")]
    MissingUri,
    #[error("wrong X-Portal-Password")]
    WrongPassword,
}

/// The original request carried by a Portal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalEnvelope {
    pub method: Method,
    pub uri: String,
    pub password: String,
    pub real_ip: Option<String>,
}

impl PortalEnvelope {
    /// Reads the envelope from request headers.
    ///
    /// A missing password header reads as the empty string.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, PortalRejection> {
        let method = header_str(headers, &X_PORTAL_METHOD)
            .and_then(|value| Method::from_bytes(value.as_bytes()).ok())
            .ok_or(PortalRejection::InvalidMethod)?;
        let uri = header_str(headers, &X_PORTAL_URI)
            .filter(|value| !value.is_empty())
            .ok_or(PortalRejection::MissingUri)?
            .to_string();
        let password = header_str(headers, &X_PORTAL_PASSWORD)
            .unwrap_or_default()
            .to_string();
        let real_ip = header_str(headers, &X_PORTAL_REAL_IP).map(str::to_string);

        Ok(Self {
            method,
            uri,
            password,
            real_ip,
        })
    }

    /// Checks the carried password against the encoded secret.
    ///
    /// Exact comparison: an empty secret only accepts an empty password.
    pub fn authenticate(&self, encoded_secret: &str) -> Result<(), PortalRejection> {
        if self.password == encoded_secret {
            Ok(())
        } else {
            Err(PortalRejection::WrongPassword)
        }
    }

    /// Writes the envelope headers onto an outbound Portal request.
    pub fn write_headers(&self, headers: &mut HeaderMap) -> Result<(), hyper::header::InvalidHeaderValue> {
        headers.insert(X_PORTAL_METHOD, HeaderValue::from_str(self.method.as_str())?);
        headers.insert(X_PORTAL_URI, HeaderValue::from_str(&self.uri)?);
        if !self.password.is_empty() {
            headers.insert(X_PORTAL_PASSWORD, HeaderValue::from_str(&self.password)?);
        }
        if let Some(real_ip) = &self.real_ip {
            headers.insert(X_PORTAL_REAL_IP, HeaderValue::from_str(real_ip)?);
        }
        Ok(())
    }
}

/// Returns true if `method` is the Portal pseudo-method.
pub fn is_portal_method(method: &Method) -> bool {
    method.as_str() == METHOD
}

/// Adds `Connection: Upgrade` and `Upgrade: Portal`.
pub fn write_upgrade_headers(headers: &mut HeaderMap) {
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
