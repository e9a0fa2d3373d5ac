//! Portal Proxy - outbound connections, relaying and tunnels.
//!
//! This crate holds everything the router needs once it has decided where a
//! request goes:
//!
//! - [`forward`] talks straight to origins (pooled client, dedicated connects)
//! - [`relay`] hands requests to a peer Portal or a third-party proxy
//! - [`upstream`] dials through HTTP CONNECT, SOCKS4 and SOCKS5 proxies
//! - [`tunnel`] splices two byte streams for CONNECT
//! - [`portal`] defines the Portal sub-protocol headers
//!
//! ## Architecture
//!
//! ```text
//!                       ┌──────────── Forwarder ─────────────► origin
//! client ─► router ─────┤
//!                       └─ RelayHandler ─┬─ Portal ──────────► peer Portal ─► origin
//!                                        └─ Upstream ────────► HTTP/SOCKS proxy ─► origin
//! ```

pub mod access;
pub mod body;
mod connector;
mod error;
pub mod forward;
pub mod headers;
pub mod portal;
pub mod relay;
pub mod target;
pub mod tunnel;
pub mod upstream;

pub use access::{AccessKind, AccessRecord, ACCESS_LOG_TARGET};
pub use body::{BoxError, ProxyBody};
pub use connector::{UpstreamConnection, UpstreamConnector};
pub use error::{ProxyError, Result};
pub use forward::Forwarder;
pub use headers::HeaderFilter;
pub use portal::{PortalEnvelope, PortalRejection};
pub use relay::{PortalRelay, RelayHandler, UpstreamRelay};
pub use target::Authority;
pub use tunnel::{spawn_tunnel, splice, TunnelStats};
pub use upstream::{BoxedStream, UpstreamProxy};
