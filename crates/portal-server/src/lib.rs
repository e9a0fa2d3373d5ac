//! Portal Server - the proxy listener.
//!
//! One HTTP/1.1 listener serves three audiences:
//!
//! - proxy clients (absolute-form requests and `CONNECT`)
//! - peer Portal instances (`PORTAL` requests)
//! - the control API (origin-form `GET`)
//!
//! ## Control API
//!
//! - `GET /api/proxyRuleInfo` - Mode and rule counts
//! - `GET /api/proxyMode/{mode}` - Switch between DIRECT, RELAY and RULE
//! - `GET /api/testProxyRule?host=` - Whether the rules would relay a host
//! - `GET /api/updateLocalProxyRules` - Reload the local rule file
//! - `GET /api/updateRemoteProxyRules` - Download the remote rules
//! - `GET /api/reloadConfigurations` - Re-read both rule files from disk
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use portal_core::{PortalConfig, ProxyRuleManager};
//! use portal_server::{AppState, Server};
//!
//! # async fn run(config: PortalConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let rules = ProxyRuleManager::open(&config.data_dir(), config.direct_proxy.rule_manager_options()).await?;
//! let state = AppState::new(&config, Arc::new(rules))?;
//! Server::bind(&config.bind_address(), state).await?.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod control;
pub mod error;
mod handlers;
pub mod models;
pub mod router;
pub mod state;

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info};

use portal_proxy::body;

pub use control::control_router;
pub use error::{ApiError, Result};
pub use router::{classify, Route};
pub use state::{AppState, ProxySettings};

/// Listen backlog.
const BACKLOG: i32 = 1024;

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to resolve the bind address.
    #[error("cannot resolve {0}: {1}")]
    Resolve(String, std::io::Error),

    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Relay handler could not be built.
    #[error("relay handler error: {0}")]
    Relay(#[from] portal_proxy::ProxyError),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// The proxy server.
pub struct Server {
    listener: TcpListener,
    state: AppState,
    control: Option<Router>,
}

impl Server {
    /// Binds to `addr` (`host:port`) with `SO_REUSEADDR`.
    pub async fn bind(addr: &str, state: AppState) -> std::result::Result<Self, ServerError> {
        let addr = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| ServerError::Resolve(addr.to_string(), e))?
            .next()
            .ok_or_else(|| {
                ServerError::Resolve(
                    addr.to_string(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no address"),
                )
            })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(addr, e))?;

        // Allow address reuse (helps with TIME_WAIT sockets after a restart)
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(addr, e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| ServerError::BindError(addr, e))?;
        socket
            .listen(BACKLOG)
            .map_err(|e| ServerError::BindError(addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener =
            TcpListener::from_std(std_listener).map_err(|e| ServerError::BindError(addr, e))?;

        let control = state
            .settings
            .control_enabled()
            .then(|| control_router(state.clone()));

        Ok(Self {
            listener,
            state,
            control,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> std::result::Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Runtime(e.to_string()))
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        info!("Portal listening on {}", self.local_addr()?);
        loop {
            let (stream, client) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!("Accept failed: {}", e);
                    continue;
                }
            };
            let state = self.state.clone();
            let control = self.control.clone();
            tokio::spawn(serve_connection(stream, client, state, control));
        }
    }

    /// Starts the server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> std::result::Result<ServerHandle, ServerError> {
        let addr = self.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = self.run() => {
                    if let Err(e) = result {
                        tracing::error!("Server error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Server shutdown signal received");
                }
            }
        });

        Ok(ServerHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

async fn serve_connection(stream: TcpStream, client: SocketAddr, state: AppState, control: Option<Router>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", client, e);
    }
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        let control = control.clone();
        async move {
            Ok::<_, Infallible>(router::route(state, control, req.map(body::incoming), client).await)
        }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!("Connection from {} ended with error: {}", client, e);
    }
}

/// Handle for controlling a running server.
pub struct ServerHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Returns the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the server to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the server to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the server and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
