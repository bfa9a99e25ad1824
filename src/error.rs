//! Error types for the analysis engine.
//!
//! This module provides structured error handling with:
//! - `AnalysisError`: every failure the orchestrator, analyzers and the
//!   resilient client can surface
//! - `RunError`: a failed run together with the results completed before it failed
//! - `Result<T>`: Type alias for Results using AnalysisError

use std::time::Duration;

use thiserror::Error;

use crate::domain::{AnalyzerType, ResultsMap};

// ============================================================================
// DOMAIN ERROR TYPE
// ============================================================================

/// Errors raised while scheduling, executing or calling out.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The run's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// The run (or a single resilient call) exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Waiting for a rate-limit token was aborted
    #[error("Rate limit wait aborted: {0}")]
    RateLimitExceeded(#[source] Box<AnalysisError>),

    /// Every attempt of an external call failed
    #[error("Upstream call '{operation}' failed after {attempts} attempt(s): {source}")]
    UpstreamCallFailed {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<AnalysisError>,
    },

    /// A string did not name one of the known analyzers
    #[error("Unknown analyzer type: {0}")]
    UnknownAnalyzerType(String),

    /// A run was requested while another one is executing
    #[error("Analysis already in progress")]
    AlreadyInProgress,

    /// The analyzer type is already present in the registry
    #[error("Analyzer already registered: {0}")]
    DuplicateAnalyzer(AnalyzerType),

    /// The analyzer type is not present in the registry
    #[error("Analyzer not registered: {0}")]
    NotRegistered(AnalyzerType),

    /// An analyzer needs a collaborator that was not supplied
    #[error("Analyzer {analyzer} requires {collaborator}")]
    MissingCollaborator {
        analyzer: AnalyzerType,
        collaborator: &'static str,
    },

    /// The analyzer task panicked before producing a result
    #[error("Analyzer {0} panicked")]
    AnalyzerPanicked(AnalyzerType),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AnalysisError {
    /// Create an analyzer-level failure from a message
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(anyhow::anyhow!(msg.into()))
    }

    /// True for cancellation and deadline expiry, including a rate-limit
    /// wait that was aborted by either.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled | Self::Timeout(_) => true,
            Self::RateLimitExceeded(inner) => inner.is_cancellation(),
            _ => false,
        }
    }

    /// Whether the resilient client may attempt the call again. Everything
    /// except cancellation and deadline expiry is retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Timeout(_) | Self::RateLimitExceeded(_))
    }
}

/// Result type alias using AnalysisError.
pub type Result<T> = std::result::Result<T, AnalysisError>;

// ============================================================================
// RUN ERROR
// ============================================================================

/// A run that stopped early.
///
/// Carries every analyzer result that completed before the failure so
/// callers can still use partial output.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunError {
    #[source]
    pub error: AnalysisError,
    pub partial: ResultsMap,
}

impl RunError {
    pub fn new(error: AnalysisError, partial: ResultsMap) -> Self {
        Self { error, partial }
    }

    /// A failure that happened before any analyzer ran.
    pub fn before_start(error: AnalysisError) -> Self {
        Self::new(error, ResultsMap::new())
    }
}
