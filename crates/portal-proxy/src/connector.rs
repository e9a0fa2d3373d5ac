//! hyper-util connector that dials through an [`UpstreamProxy`].
//!
//! For an HTTP proxy the pooled connection goes to the proxy itself and is
//! marked as proxied, so hyper writes requests in absolute form. For SOCKS
//! the connection is tunneled to the origin and requests stay in origin
//! form.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;

use portal_core::ProxyProtocol;

use crate::error::ProxyError;
use crate::target::Authority;
use crate::upstream::{BoxedStream, UpstreamProxy};

/// Connector for `hyper_util::client::legacy::Client`.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    proxy: Arc<UpstreamProxy>,
}

impl UpstreamConnector {
    pub fn new(proxy: Arc<UpstreamProxy>) -> Self {
        Self { proxy }
    }
}

impl tower::Service<Uri> for UpstreamConnector {
    type Response = UpstreamConnection;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let proxy = self.proxy.clone();
        Box::pin(async move {
            match proxy.protocol() {
                ProxyProtocol::Http => {
                    let stream = proxy.connect_to_proxy().await?;
                    Ok(UpstreamConnection::new(Box::new(stream), true))
                }
                ProxyProtocol::Socks4 | ProxyProtocol::Socks5 => {
                    let target = Authority::from_http_uri(&dst)?;
                    let stream = proxy.connect(&target).await?;
                    Ok(UpstreamConnection::new(stream, false))
                }
            }
        })
    }
}

/// A pooled connection opened by [`UpstreamConnector`].
pub struct UpstreamConnection {
    io: TokioIo<BoxedStream>,
    proxied: bool,
}

impl UpstreamConnection {
    fn new(stream: BoxedStream, proxied: bool) -> Self {
        Self {
            io: TokioIo::new(stream),
            proxied,
        }
    }
}

impl Connection for UpstreamConnection {
    fn connected(&self) -> Connected {
        Connected::new().proxy(self.proxied)
    }
}

impl hyper::rt::Read for UpstreamConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.get_mut().io), cx, buf)
    }
}

impl hyper::rt::Write for UpstreamConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.get_mut().io), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.get_mut().io), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.get_mut().io), cx)
    }
}
