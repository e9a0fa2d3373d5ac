//! Error types for rule sources and configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Rule source error type.
#[derive(Debug, Error)]
pub enum RuleError {
    /// No remote rule URL configured.
    #[error("no remote rule URLs configured")]
    NoRemoteUrls,

    /// Network error while downloading rules.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The rule server answered with a non-success status.
    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    /// Base64 payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    /// Rule file could not be read or created.
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for the expected shape.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A property has an invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for rule source operations.
pub type Result<T> = std::result::Result<T, RuleError>;
