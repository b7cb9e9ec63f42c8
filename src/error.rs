//! Error taxonomy shared by the acquisition and storage tiers.
//!
//! Source failures are values (recorded per source, never propagated out of
//! `aggregate`). Storage errors separate "nothing exists" from "could not
//! check" so callers can tell an empty result from an unreachable backend.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::ephemeral::ArtifactId;
use crate::storage::vector::{DocumentId, Similarity};

/// Why a single source did not produce a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Network,
    RateLimited,
    InvalidResponse,
    Auth,
    Timeout,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::Network => "network",
            FailureCause::RateLimited => "rate_limited",
            FailureCause::InvalidResponse => "invalid_response",
            FailureCause::Auth => "auth",
            FailureCause::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure surfaced by a Source Adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{source_name} failed ({cause}): {message}")]
pub struct SourceFailure {
    pub source_name: String,
    pub cause: FailureCause,
    pub message: String,
    /// Provider-requested wait before the next call, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl SourceFailure {
    pub fn new(source: impl Into<String>, cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            source_name: source.into(),
            cause,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn rate_limited(source: impl Into<String>, retry_after_secs: u64) -> Self {
        Self {
            source_name: source.into(),
            cause: FailureCause::RateLimited,
            message: format!("rate limited, retry after {retry_after_secs}s"),
            retry_after_secs: Some(retry_after_secs),
        }
    }

    pub fn timeout(source: impl Into<String>, after_ms: u128) -> Self {
        Self::new(
            source,
            FailureCause::Timeout,
            format!("no response within {after_ms}ms"),
        )
    }
}

/// Errors raised by a storage backend (disk, memory, remote).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised at the AI analysis boundary.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis is disabled")]
    Disabled,

    #[error("analysis timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("analysis provider error: {0}")]
    Provider(String),

    #[error("analysis returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// Errors surfaced by the storage tiers and the Storage Coordinator.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("artifact {0} has expired")]
    ArtifactExpired(ArtifactId),

    #[error("artifact {0} was never stored")]
    ArtifactNotFound(ArtifactId),

    #[error("embedding dimension mismatch: collection expects {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    #[error("no data available for {subject}: every source failed and nothing is cached")]
    NoDataAvailable {
        subject: String,
        failures: Vec<SourceFailure>,
    },

    #[error("document {0} not found")]
    DocumentNotFound(DocumentId),

    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    #[error("vector collection was created with the {stored:?} metric, {requested:?} was requested")]
    SimilarityMismatch {
        stored: Similarity,
        requested: Similarity,
    },

    #[error("unsupported record schema '{schema}' v{version}")]
    Schema { schema: String, version: u16 },

    #[error("storage backend error: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

impl StorageError {
    /// True when the data genuinely does not exist (as opposed to being unreachable).
    pub fn is_no_data(&self) -> bool {
        matches!(
            self,
            StorageError::NoDataAvailable { .. }
                | StorageError::ArtifactNotFound(_)
                | StorageError::ArtifactExpired(_)
                | StorageError::DocumentNotFound(_)
        )
    }

    /// True when the backend could not be consulted at all.
    pub fn is_backend(&self) -> bool {
        matches!(self, StorageError::Backend(_) | StorageError::Schema { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Backend(BackendError::Serialization(e))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_display_names_source_and_cause() {
        let f = SourceFailure::new("finnhub", FailureCause::Auth, "401 Unauthorized");
        assert_eq!(f.to_string(), "finnhub failed (auth): 401 Unauthorized");
    }

    #[test]
    fn no_data_and_backend_are_distinct() {
        let nd = StorageError::NoDataAvailable {
            subject: "AAPL".into(),
            failures: vec![SourceFailure::timeout("finnhub", 10_000)],
        };
        let be = StorageError::Backend(BackendError::Unavailable("disk gone".into()));
        assert!(nd.is_no_data() && !nd.is_backend());
        assert!(be.is_backend() && !be.is_no_data());
    }
}
