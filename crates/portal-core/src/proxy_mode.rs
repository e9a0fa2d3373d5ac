//! Proxy mode selection.

use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

/// Decides whether direct-proxy traffic goes to the origin or through the
/// relay handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum ProxyMode {
    /// Always connect to the origin.
    Direct,
    /// Always go through the relay handler.
    Relay,
    /// Relay hosts that the rule sources classify as black.
    #[default]
    Rule,
}

impl ProxyMode {
    /// Returns the mode name as stored in the status file.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Direct => "DIRECT",
            ProxyMode::Relay => "RELAY",
            ProxyMode::Rule => "RULE",
        }
    }
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown proxy mode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown proxy mode: {0}")]
pub struct ParseProxyModeError(pub String);

impl FromStr for ProxyMode {
    type Err = ParseProxyModeError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DIRECT" => Ok(ProxyMode::Direct),
            "RELAY" => Ok(ProxyMode::Relay),
            "RULE" => Ok(ProxyMode::Rule),
            _ => Err(ParseProxyModeError(s.to_string())),
        }
    }
}

impl TryFrom<String> for ProxyMode {
    type Error = ParseProxyModeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for ProxyMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
