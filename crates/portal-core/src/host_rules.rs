//! Host rule sets parsed from an Adblock-style subset.
//!
//! Only host rules are understood. Each line either lands in the black list,
//! the white list (`@@` prefix), or is skipped:
//!
//! - `||example.com` - the remainder is taken verbatim
//! - `|http://example.com/` - the authority after `//`
//! - `.example.com`, `*.example.com`, `example.com`, `example.com/`
//!
//! Comments (`!`), section headers (`[`), regex rules (`/.../`), embedded
//! wildcards, real paths and bare host names never produce a rule.

use std::collections::HashSet;

use serde::Serialize;

/// Result of testing a host against a [`HostRuleSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostRuleTestResult {
    /// Matched a white (`@@`) rule.
    White,
    /// Matched a black rule.
    Black,
    /// No rule applies.
    Unknown,
}

impl HostRuleTestResult {
    /// Returns the result name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            HostRuleTestResult::White => "WHITE",
            HostRuleTestResult::Black => "BLACK",
            HostRuleTestResult::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for HostRuleTestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of rules held by a rule set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleCounts {
    pub black: usize,
    pub white: usize,
}

/// Black and white host suffix sets.
///
/// A set is immutable once built; callers replace it wholesale with
/// [`HostRuleSet::load`] or by swapping in a freshly parsed instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostRuleSet {
    black_hosts: HashSet<String>,
    white_hosts: HashSet<String>,
}

impl HostRuleSet {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a rule set from text, one rule per line.
    pub fn parse(text: &str) -> Self {
        Self::from_lines(text.lines())
    }

    /// Builds a rule set from individual lines.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Self::new();
        rules.load(lines);
        rules
    }

    /// Replaces both sets with the rules found in `lines`.
    ///
    /// Malformed or unsupported lines are skipped silently.
    pub fn load<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.black_hosts.clear();
        self.white_hosts.clear();

        for line in lines {
            if let Some((host, white)) = parse_rule(line.as_ref()) {
                if white {
                    self.white_hosts.insert(host);
                } else {
                    self.black_hosts.insert(host);
                }
            }
        }
    }

    /// Tests a host. White rules are consulted before black rules.
    pub fn test(&self, host: &str) -> HostRuleTestResult {
        let host = host.to_ascii_lowercase();
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() <= 1 {
            return HostRuleTestResult::Unknown;
        }

        if matches_suffix(&self.white_hosts, &labels) {
            HostRuleTestResult::White
        } else if matches_suffix(&self.black_hosts, &labels) {
            HostRuleTestResult::Black
        } else {
            HostRuleTestResult::Unknown
        }
    }

    /// Returns the number of black and white rules.
    pub fn counts(&self) -> RuleCounts {
        RuleCounts {
            black: self.black_hosts.len(),
            white: self.white_hosts.len(),
        }
    }

    /// Returns true if neither set holds a rule.
    pub fn is_empty(&self) -> bool {
        self.black_hosts.is_empty() && self.white_hosts.is_empty()
    }
}

/// Walks suffixes from the last label leftward: `tld`, `example.tld`, ...
fn matches_suffix(set: &HashSet<String>, labels: &[&str]) -> bool {
    if set.is_empty() {
        return false;
    }
    let mut suffix = String::new();
    for label in labels.iter().rev() {
        if suffix.is_empty() {
            suffix.push_str(label);
        } else {
            suffix.insert(0, '.');
            suffix.insert_str(0, label);
        }
        if set.contains(&suffix) {
            return true;
        }
    }
    false
}

/// Parses a single line into `(host, is_white)`.
fn parse_rule(raw: &str) -> Option<(String, bool)> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('[') || line.starts_with('!') {
        return None;
    }

    let (mut line, white) = match line.strip_prefix("@@") {
        Some(rest) => (rest, true),
        None => (line, false),
    };

    if line.starts_with('/') {
        return None;
    }

    if let Some(domain) = line.strip_prefix("||") {
        return Some((domain.to_ascii_lowercase(), white));
    }

    if line.starts_with('|') {
        let start = line.find("//")?;
        line = &line[start + 2..];
    } else if let Some(rest) = line.strip_prefix('.') {
        line = rest;
    }

    if let Some(rest) = line.strip_prefix("*.") {
        line = rest;
    }

    if line.contains('*') {
        return None;
    }

    if let Some(slash) = line.find('/') {
        if slash != line.len() - 1 {
            return None;
        }
        line = &line[..slash];
    }

    if !line.contains('.') {
        return None;
    }

    Some((line.to_ascii_lowercase(), white))
}
