//! Rule sources: a rule set bound to its backing file, and the remote
//! rule downloader.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::alphabet;
use base64::engine::general_purpose::GeneralPurposeConfig;
use base64::engine::{DecodePaddingMode, GeneralPurpose};
use base64::Engine;
use parking_lot::RwLock;
use rand::seq::SliceRandom;

use crate::error::{Result, RuleError};
use crate::host_rules::{HostRuleSet, RuleCounts};

/// File name of the local rule source.
pub const LOCAL_RULES_FILE: &str = "portal.rules.local";

/// File name of the remote rule source.
pub const REMOTE_RULES_FILE: &str = "portal.rules.remote";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// MIME-style base64: padding optional, line breaks and stray bytes ignored.
const MIME_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A host rule set and the file it is loaded from.
///
/// Readers take cheap snapshots; loads build a complete new set before
/// swapping it in, so a failed load leaves the previous rules in place.
pub struct RuleSource {
    name: &'static str,
    path: PathBuf,
    rules: RwLock<Arc<HostRuleSet>>,
}

impl std::fmt::Debug for RuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSource")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("counts", &self.counts())
            .finish()
    }
}

impl RuleSource {
    /// Creates an empty rule source backed by `path`.
    pub fn new(name: &'static str, path: impl Into<PathBuf>) -> Self {
        Self {
            name,
            path: path.into(),
            rules: RwLock::new(Arc::new(HostRuleSet::new())),
        }
    }

    /// Returns the source name used in log messages.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current rule set.
    #[inline]
    pub fn snapshot(&self) -> Arc<HostRuleSet> {
        self.rules.read().clone()
    }

    /// Returns the current rule counts.
    pub fn counts(&self) -> RuleCounts {
        self.rules.read().counts()
    }

    /// Replaces the current rule set.
    pub fn install(&self, rules: HostRuleSet) -> RuleCounts {
        let counts = rules.counts();
        *self.rules.write() = Arc::new(rules);
        tracing::info!(
            "Loaded {} rules: {} black, {} white",
            self.name,
            counts.black,
            counts.white
        );
        counts
    }

    /// Returns true if the backing file exists.
    pub async fn file_exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Reads the backing file and replaces the rule set.
    pub async fn load_from_disk(&self) -> Result<RuleCounts> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| RuleError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(self.install(HostRuleSet::parse(&String::from_utf8_lossy(&bytes))))
    }

    /// Like [`load_from_disk`](Self::load_from_disk), but creates an empty
    /// file when none exists.
    pub async fn load_or_create(&self) -> Result<RuleCounts> {
        if !self.file_exists().await {
            tracing::info!("Creating empty {} rule file {:?}", self.name, self.path);
            tokio::fs::write(&self.path, b"")
                .await
                .map_err(|source| RuleError::Io {
                    path: self.path.clone(),
                    source,
                })?;
        }
        self.load_from_disk().await
    }

    /// Writes `bytes` to the backing file.
    pub async fn persist(&self, bytes: &[u8]) -> Result<()> {
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|source| RuleError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Downloads rule lists from one of several mirrors.
#[derive(Debug, Clone)]
pub struct RemoteRuleFetcher {
    client: reqwest::Client,
    urls: Vec<String>,
    base64_encoded: bool,
}

impl RemoteRuleFetcher {
    /// Creates a fetcher for the given mirror list.
    pub fn new(urls: Vec<String>, base64_encoded: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            urls,
            base64_encoded,
        })
    }

    /// Returns the configured mirror list.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Fetches the rule list from a randomly chosen mirror, returning the
    /// decoded rule text bytes.
    pub async fn fetch(&self) -> Result<Vec<u8>> {
        let url = self
            .urls
            .choose(&mut rand::thread_rng())
            .ok_or(RuleError::NoRemoteUrls)?
            .clone();

        tracing::info!("Downloading remote rules from {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(RuleError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await?;
        if self.base64_encoded {
            decode_mime_base64(&body)
        } else {
            Ok(body.to_vec())
        }
    }
}

/// Decodes base64 the way MIME decoders do, skipping bytes outside the
/// alphabet (line breaks, whitespace).
pub fn decode_mime_base64(input: &[u8]) -> Result<Vec<u8>> {
    let filtered: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
        .collect();
    Ok(MIME_BASE64.decode(filtered)?)
}
