//! Header sanitizing for requests leaving the proxy.

use hyper::header::{HeaderMap, HeaderName};

const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "te", "trailer", "upgrade"];
const HOP_BY_HOP_AND_HOST: &[&str] = &["connection", "keep-alive", "te", "trailer", "upgrade", "host"];

/// Decides which client headers are copied onto an outbound request.
///
/// Names are compared in lower case, which is how hyper stores them.
#[derive(Debug, Clone, Copy)]
pub struct HeaderFilter {
    prefixes: &'static [&'static str],
    names: &'static [&'static str],
}

impl HeaderFilter {
    /// Requests sent to an origin or through a third-party proxy.
    pub const ORIGIN: HeaderFilter = HeaderFilter {
        prefixes: &["proxy-", crate::portal::HEADER_PREFIX],
        names: HOP_BY_HOP,
    };

    /// Requests crossing the peer hop, in either direction. The hop's `Host`
    /// names the peer, not the origin.
    pub const PEER: HeaderFilter = HeaderFilter {
        prefixes: &["proxy-", crate::portal::HEADER_PREFIX],
        names: HOP_BY_HOP_AND_HOST,
    };

    /// Returns true if `name` should be copied.
    pub fn allows(&self, name: &HeaderName) -> bool {
        let name = name.as_str();
        !self.prefixes.iter().any(|prefix| name.starts_with(prefix))
            && !self.names.contains(&name)
    }

    /// Appends every allowed header from `from` to `to`.
    pub fn copy(&self, from: &HeaderMap, to: &mut HeaderMap) {
        for (name, value) in from {
            if self.allows(name) {
                to.append(name.clone(), value.clone());
            }
        }
    }
}
