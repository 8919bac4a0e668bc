// src/error.rs
use std::time::Duration;

use thiserror::Error;

use crate::model::{BatchId, SourceId};

/// Errors raised by a source adapter (or synthesized by the breaker).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("parse failed: {0}")]
    ParseFailed(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("circuit open, retry in {}s", retry_in.as_secs())]
    Unavailable { retry_in: Duration },
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::RateLimited { .. } | SourceError::Network(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors raised by the analysis collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("analysis request timed out")]
    Timeout,
    #[error("analysis rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("analysis service unavailable: {0}")]
    Unavailable(String),
    #[error("invalid analysis response: {0}")]
    InvalidResponse(String),
}

impl EnrichmentError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, EnrichmentError::InvalidResponse(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EnrichmentError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Boundary validation errors. Partial failure inside a batch is never one of these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("no sources requested")]
    NoSources,
    #[error("unknown source: {0}")]
    UnknownSource(SourceId),
    #[error("keyword list is empty")]
    EmptyKeywords,
    #[error("per-source max items must be positive")]
    InvalidMaxItems,
    #[error("batch {0} not found")]
    NotFound(BatchId),
}
