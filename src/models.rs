//! Data models shared by the pipeline stages.
//!
//! This module defines the values that flow between the key deriver, the
//! fetcher, the writer and the orchestrator:
//! - [`StorageKey`]: Object key derived from a URL (`host + path`)
//! - [`Generation`]: Version identifier assigned by the store on every write
//! - [`BatchOutcome`]: Per-invocation record of which URLs were stored and which failed
//!
//! The outcome types derive `Serialize` so the binary can print the final
//! report as JSON.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Object key derived from a URL.
///
/// Always `host + path` of the URL it came from. The same URL yields the same
/// key; writing to an existing key creates a new [`Generation`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Slash-separated components of the key, empty components included.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned version of one object write.
///
/// Opaque to the pipeline: numeric for the local backends, the version id for
/// S3. Distinct writes to one key never share a generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(String);

impl Generation {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for Generation {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pipeline stage at which a URL was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The token was not a usable URL.
    Key,
    /// GET, status check, body read or content transform failed.
    Fetch,
    /// The object store rejected or timed out the write.
    Write,
    /// The item was in flight when the invocation deadline passed.
    Deadline,
    /// The deadline had already passed; the item was never attempted.
    Abandoned,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Key => "key",
            Stage::Fetch => "fetch",
            Stage::Write => "write",
            Stage::Deadline => "deadline",
            Stage::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// A URL whose content was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSuccess {
    /// The URL token as it appeared in the payload.
    pub url: String,
    /// Key the content was written under.
    pub key: StorageKey,
    /// Generation created by the write.
    pub generation: Generation,
    /// Number of bytes written after the content transform.
    pub bytes: usize,
}

/// A URL that was not stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// The URL token as it appeared in the payload.
    pub url: String,
    /// Derived key, absent when the token could not be parsed as a URL.
    pub key: Option<StorageKey>,
    pub stage: Stage,
    /// Rendered error message.
    pub cause: String,
}

/// Result of one invocation, in payload order.
///
/// Both lists are append-only while the orchestrator runs. Every URL token of
/// the batch ends up in exactly one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: Vec<ItemSuccess>,
    pub failed: Vec<ItemFailure>,
}

impl BatchOutcome {
    pub fn record_success(&mut self, item: ItemSuccess) {
        self.succeeded.push(item);
    }

    pub fn record_failure(&mut self, item: ItemFailure) {
        self.failed.push(item);
    }

    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn succeeded_keys(&self) -> Vec<&StorageKey> {
        self.succeeded.iter().map(|s| &s.key).collect()
    }

    /// Keys of failed items; tokens that never produced a key are skipped.
    pub fn failed_keys(&self) -> Vec<&StorageKey> {
        self.failed.iter().filter_map(|f| f.key.as_ref()).collect()
    }

    pub fn failed_urls(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.url.as_str()).collect()
    }
}
