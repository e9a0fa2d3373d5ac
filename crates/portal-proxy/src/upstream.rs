//! Connections through a third-party HTTP or SOCKS proxy.

use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::HeaderValue;
use hyper::StatusCode;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};

use portal_core::{ProxyProtocol, UpstreamProxyConfig};

use crate::error::{ProxyError, Result};
use crate::target::Authority;

/// Upper bound for a CONNECT response header section.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// A duplex byte stream of any concrete type.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

/// Type-erased stream returned by [`UpstreamProxy::connect`].
pub type BoxedStream = Box<dyn ProxyStream>;

/// A configured third-party proxy.
#[derive(Clone)]
pub struct UpstreamProxy {
    protocol: ProxyProtocol,
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
}

impl std::fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

impl UpstreamProxy {
    /// Creates a proxy from its configuration.
    pub fn from_config(config: &UpstreamProxyConfig) -> Self {
        Self {
            protocol: config.protocol,
            host: config.host.clone(),
            port: config.port,
            credentials: config
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
        }
    }

    /// Returns the proxy protocol.
    pub fn protocol(&self) -> ProxyProtocol {
        self.protocol
    }

    /// `Proxy-Authorization` value for HTTP proxies with credentials.
    pub fn proxy_authorization(&self) -> Option<HeaderValue> {
        if self.protocol != ProxyProtocol::Http {
            return None;
        }
        let (user, pass) = self.credentials.as_ref()?;
        let encoded = STANDARD.encode(format!("{user}:{pass}"));
        HeaderValue::from_str(&format!("Basic {encoded}")).ok()
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                ProxyError::InvalidTarget(format!("cannot resolve proxy {}:{}", self.host, self.port))
            })
    }

    /// Opens a plain TCP connection to the proxy itself.
    pub async fn connect_to_proxy(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.resolve().await?).await?)
    }

    /// Opens a raw byte stream to `target` through the proxy.
    pub async fn connect(&self, target: &Authority) -> Result<BoxedStream> {
        match self.protocol {
            ProxyProtocol::Http => {
                let stream = self.connect_to_proxy().await?;
                let authorization = self
                    .proxy_authorization()
                    .and_then(|value| value.to_str().ok().map(str::to_string));
                let stream = http_connect(stream, target, authorization.as_deref()).await?;
                Ok(Box::new(stream))
            }
            ProxyProtocol::Socks5 => {
                let proxy = self.resolve().await?;
                let stream = match &self.credentials {
                    Some((user, pass)) => {
                        Socks5Stream::connect_with_password(proxy, target.to_string(), user, pass)
                            .await?
                    }
                    None => Socks5Stream::connect(proxy, target.to_string()).await?,
                };
                Ok(Box::new(stream.into_inner()))
            }
            ProxyProtocol::Socks4 => {
                let proxy = self.resolve().await?;
                let stream = match &self.credentials {
                    Some((user, _)) => {
                        Socks4Stream::connect_with_userid(proxy, target.to_string(), user).await?
                    }
                    None => Socks4Stream::connect(proxy, target.to_string()).await?,
                };
                Ok(Box::new(stream.into_inner()))
            }
        }
    }
}

/// Performs an HTTP CONNECT handshake on `stream`.
///
/// The returned reader keeps any bytes the proxy sent after its response
/// header, so nothing from the tunnel is lost.
pub async fn http_connect<S>(
    mut stream: S,
    target: &Authority,
    authorization: Option<&str>,
) -> Result<BufReader<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(authorization) = authorization {
        request.push_str(&format!("Proxy-Authorization: {authorization}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut head = Vec::new();
    loop {
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(ProxyError::MalformedResponse(
                "connection closed before CONNECT response".to_string(),
            ));
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(ProxyError::MalformedResponse(
                "CONNECT response header too large".to_string(),
            ));
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::MalformedResponse(
                "incomplete CONNECT response".to_string(),
            ))
        }
        Err(e) => return Err(ProxyError::MalformedResponse(e.to_string())),
    }

    let code = response
        .code
        .ok_or_else(|| ProxyError::MalformedResponse("missing status code".to_string()))?;
    let status =
        StatusCode::from_u16(code).map_err(|e| ProxyError::MalformedResponse(e.to_string()))?;
    if !status.is_success() {
        return Err(ProxyError::UnexpectedStatus(status));
    }

    Ok(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio_test::io::Builder;

    fn target() -> Authority {
        Authority {
            host: "example.com".to_string(),
            port: 443,
        }
    }

    #[tokio::test]
    async fn test_http_connect_handshake() {
        let mock = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .read(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .build();

        http_connect(mock, &target(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_keeps_early_tunnel_bytes() {
        let mock = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Authorization: Basic dTpw\r\n\r\n")
            .read(b"HTTP/1.1 200 OK\r\nVia: test\r\n\r\nSSH-2.0")
            .build();

        let mut stream = http_connect(mock, &target(), Some("Basic dTpw")).await.unwrap();
        let mut banner = [0u8; 7];
        stream.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SSH-2.0");
    }

    #[tokio::test]
    async fn test_http_connect_rejected() {
        let mock = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n")
            .build();

        let err = http_connect(mock, &target(), None).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::UnexpectedStatus(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        ));
    }

    #[test]
    fn test_proxy_authorization_only_for_http() {
        let mut config = UpstreamProxyConfig {
            protocol: ProxyProtocol::Http,
            host: "proxy.test".to_string(),
            port: 3128,
            username: "user".to_string(),
            password: "pass".to_string(),
            client_pool_size_per_endpoint: 8,
        };
        let proxy = UpstreamProxy::from_config(&config);
        assert_eq!(proxy.proxy_authorization().unwrap(), "Basic dXNlcjpwYXNz");

        config.protocol = ProxyProtocol::Socks5;
        assert!(UpstreamProxy::from_config(&config).proxy_authorization().is_none());

        config.protocol = ProxyProtocol::Http;
        config.username.clear();
        assert!(UpstreamProxy::from_config(&config).proxy_authorization().is_none());
    }
}
