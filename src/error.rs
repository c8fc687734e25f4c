//! Error taxonomy for the reasoning pipeline.
//!
//! Most failures inside the composition pipeline are absorbed into fallback
//! bundles rather than surfaced to the caller. The two exceptions are
//! [`PipelineError::RateLimited`] and [`PipelineError::CircuitOpen`], which
//! tell the caller to back off entirely. Use [`PipelineError::is_hard`] to
//! distinguish them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Fixed-window request quota exhausted for a (requester, endpoint) pair.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Circuit breaker is open for an endpoint after repeated failures.
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// An operation ran past its per-endpoint time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or unusable input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not enough grounded material to answer from.
    #[error("Insufficient evidence: {0}")]
    InsufficientEvidence(String),

    /// Upstream bibliographic or transport failure.
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Storage backend failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Generative model transport or decode failure.
    #[error("Model error: {0}")]
    Model(String),
}

impl PipelineError {
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    pub fn circuit_open(msg: impl Into<String>) -> Self {
        Self::CircuitOpen(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn insufficient_evidence(msg: impl Into<String>) -> Self {
        Self::InsufficientEvidence(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::ExternalService(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Errors that must surface to the caller instead of degrading into a
    /// fallback bundle.
    pub fn is_hard(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::CircuitOpen(_))
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::ExternalService(err.to_string())
        }
    }
}
