//! Error types for the `adk-raptor` crate.
//!
//! Numerical problems (near-singular covariances, zero distances, too few
//! points to cluster) never show up here: they are absorbed by the reducer and
//! the clusterer. Only capability failures, invalid configuration and caller
//! mistakes are surfaced.

use thiserror::Error;

/// Errors that can occur while building or querying a RAPTOR index.
#[derive(Debug, Error)]
pub enum RaptorError {
    /// The embedding capability failed for a specific text.
    #[error("Embedding error ({provider}) for \"{}\": {message}", preview(.text))]
    EmbeddingError {
        /// The embedding provider that produced the error.
        provider: String,
        /// The text that could not be embedded.
        text: String,
        /// A description of the failure.
        message: String,
    },

    /// The text-generation capability failed.
    #[error("Generation error ({provider}): {message}")]
    GenerationError {
        /// The generator that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// A capability call did not complete within its per-call timeout.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// The operation that timed out (`embed`, `summarize`, ...).
        operation: String,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A tree was requested for a document without chunks.
    #[error("cannot build a tree from an empty chunk set")]
    EmptyCorpus,

    /// Embedding vectors of inconsistent width were supplied.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Width of the first vector.
        expected: usize,
        /// Width of the offending vector.
        found: usize,
    },

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// An error in the corpus pipeline orchestration.
    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

impl RaptorError {
    /// Whether retrying the failed call could plausibly succeed.
    ///
    /// Capability failures and timeouts are transient; everything else is a
    /// permanent condition of the input or configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaptorError::EmbeddingError { .. }
                | RaptorError::GenerationError { .. }
                | RaptorError::Timeout { .. }
        )
    }
}

fn preview(text: &str) -> String {
    const MAX_CHARS: usize = 64;
    if text.chars().count() <= MAX_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(MAX_CHARS).collect();
    format!("{head}...")
}

/// A convenience result type for RAPTOR operations.
pub type Result<T> = std::result::Result<T, RaptorError>;
