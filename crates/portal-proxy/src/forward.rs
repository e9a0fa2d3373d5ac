//! Direct connections to origins.

use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpStream;

use crate::body::{self, ProxyBody};
use crate::error::Result;
use crate::headers::HeaderFilter;
use crate::target::Authority;

/// Pooled HTTP client plus dedicated origin connects for tunnels.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, ProxyBody>,
}

impl Forwarder {
    /// Creates a forwarder keeping at most `pool_size_per_endpoint` idle
    /// connections per origin.
    pub fn new(pool_size_per_endpoint: usize) -> Self {
        Self {
            client: pooled_client(http_connector(), pool_size_per_endpoint),
        }
    }

    /// Opens a dedicated TCP connection to `target` for a tunnel.
    pub async fn connect_origin(&self, target: &Authority) -> Result<TcpStream> {
        let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", target, e);
        }
        Ok(stream)
    }

    /// Sends `req` to the origin named by `uri` and returns its response.
    ///
    /// Client headers pass through `filter`; the body is streamed.
    pub async fn forward(
        &self,
        req: Request<ProxyBody>,
        method: Method,
        uri: Uri,
        filter: HeaderFilter,
    ) -> Result<Response<ProxyBody>> {
        let (parts, body) = req.into_parts();
        let outbound = outbound_request(method, uri, &parts.headers, filter, body)?;
        send(&self.client, outbound).await
    }
}

/// Plain-HTTP connector for pooled clients.
pub(crate) fn http_connector() -> HttpConnector {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector
}

pub(crate) fn pooled_client<C>(connector: C, max_idle_per_host: usize) -> Client<C, ProxyBody>
where
    C: Connect + Clone,
{
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(max_idle_per_host)
        .build(connector)
}

/// Builds an outbound request carrying the filtered client headers.
///
/// When `filter` drops `Host`, the pooled client fills it in from `uri`.
pub(crate) fn outbound_request(
    method: Method,
    uri: Uri,
    headers: &HeaderMap,
    filter: HeaderFilter,
    body: ProxyBody,
) -> Result<Request<ProxyBody>> {
    let mut request = Request::builder().method(method).uri(uri).body(body)?;
    filter.copy(headers, request.headers_mut());
    Ok(request)
}

pub(crate) async fn send<C>(
    client: &Client<C, ProxyBody>,
    request: Request<ProxyBody>,
) -> Result<Response<ProxyBody>>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    let response: Response<Incoming> = client.request(request).await?;
    Ok(response.map(body::incoming))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::header::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts one connection, returns the request head it read and
    /// answers with a fixed body.
    async fn origin_once(listener: TcpListener) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0);
            head.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nx-origin: yes\r\n\r\nhello")
            .await
            .unwrap();
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn test_forward_filters_headers_and_streams_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let origin = tokio::spawn(origin_once(listener));

        let uri: Uri = format!("http://{addr}/page?q=1").parse().unwrap();
        let mut req = Request::new(body::empty());
        req.headers_mut()
            .insert("proxy-authorization", HeaderValue::from_static("Basic abc"));
        req.headers_mut()
            .insert("x-custom", HeaderValue::from_static("kept"));

        let forwarder = Forwarder::new(4);
        let response = forwarder
            .forward(req, Method::GET, uri, HeaderFilter::PEER)
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().get("x-origin").unwrap(), "yes");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");

        let head = origin.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /page?q=1 http/1.1\r\n"));
        assert!(head.contains(&format!("host: {addr}")));
        assert!(head.contains("x-custom: kept"));
        assert!(!head.contains("proxy-authorization"));
    }

    #[tokio::test]
    async fn test_connect_origin_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = Authority {
            host: "127.0.0.1".to_string(),
            port,
        };
        assert!(Forwarder::new(1).connect_origin(&target).await.is_err());
    }
}
