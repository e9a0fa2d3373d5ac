//! Access log records.
//!
//! One line per routed request, emitted on [`ACCESS_LOG_TARGET`] so the
//! binary can send them to a separate file.

use std::fmt;

/// Tracing target for access log lines.
pub const ACCESS_LOG_TARGET: &str = "portal::access";

/// How a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Served by connecting straight to the origin.
    Direct,
    /// Handed to the relay handler.
    Relayed,
    /// Received from a peer and served.
    Accepted,
    /// Refused before any outbound connection.
    Denied,
    /// Outbound connection or transfer failed.
    Failed,
}

impl AccessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKind::Direct => "DIRECT",
            AccessKind::Relayed => "RELAYED",
            AccessKind::Accepted => "ACCEPTED",
            AccessKind::Denied => "DENIED",
            AccessKind::Failed => "FAILED",
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub client: String,
    pub method: String,
    pub uri: String,
}

impl AccessRecord {
    pub fn new(client: impl Into<String>, method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            method: method.into(),
            uri: uri.into(),
        }
    }

    /// Formats the access line for `kind`.
    pub fn line(&self, kind: AccessKind) -> String {
        format!("{} - {} {} {}", kind, self.client, self.method, self.uri)
    }

    /// Emits the access line.
    pub fn log(&self, kind: AccessKind) {
        tracing::info!(target: ACCESS_LOG_TARGET, "{}", self.line(kind));
    }
}
