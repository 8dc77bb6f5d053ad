//! Error kinds for per-entry processing
//!
//! Every failure that can happen while driving a single memory through the
//! pipeline is a [`MemoryError`]. The scheduler catches these at the entry
//! boundary and records them as an [`EntryError`] on the entry's result, so a
//! single bad URL or broken overlay never terminates the run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-entry processing errors
#[derive(Error, Debug)]
pub enum MemoryError {
    /// URL unreachable, expired, or retries exhausted.
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    /// External transcoder missing, exited non-zero, or timed out.
    #[error("composition failed: {0}")]
    Composition(String),

    /// Metadata could not be embedded. Callers degrade this to a warning.
    #[error("metadata embedding failed: {0}")]
    Metadata(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or missing required fields in a manifest record.
    #[error("invalid manifest entry: {0}")]
    Manifest(String),

    #[error("run cancelled before entry started")]
    Cancelled,

    #[error("worker fault: {0}")]
    Internal(String),
}

impl MemoryError {
    /// Build a network error, stripping signed query parameters from the URL.
    pub fn network(url: &str, reason: impl Into<String>) -> Self {
        Self::Network {
            url: redact_url(url),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Composition(_) => ErrorKind::Composition,
            Self::Metadata(_) => ErrorKind::Metadata,
            Self::Io { .. } => ErrorKind::Io,
            Self::Manifest(_) => ErrorKind::Manifest,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Coarse classification carried on a failed result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Network,
    Composition,
    Metadata,
    Io,
    Manifest,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Network => "NetworkError",
            Self::Composition => "CompositionError",
            Self::Metadata => "MetadataError",
            Self::Io => "IOError",
            Self::Manifest => "ManifestError",
            Self::Cancelled => "Cancelled",
            Self::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

/// Clonable snapshot of a [`MemoryError`] stored on a `ProcessingResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&MemoryError> for EntryError {
    fn from(err: &MemoryError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<MemoryError> for EntryError {
    fn from(err: MemoryError) -> Self {
        Self::from(&err)
    }
}

impl std::fmt::Display for EntryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Drop query string and fragment so signed tokens never reach logs.
#[must_use]
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            let had_query = parsed.query().is_some();
            parsed.set_query(None);
            parsed.set_fragment(None);
            if had_query {
                format!("{parsed}?…")
            } else {
                parsed.to_string()
            }
        }
        Err(_) => raw.split(['?', '#']).next().unwrap_or(raw).to_string(),
    }
}
