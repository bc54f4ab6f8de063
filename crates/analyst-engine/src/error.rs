//! Engine error types
//!
//! Planning and generation failures are kept apart from the per-attempt
//! execution outcomes: an outcome is data the correction loop reacts to, these
//! are failures of the loop's own collaborators.

use analyst_core::{ErrorKind, StepError};
use analyst_llm::LlmError;
use std::path::PathBuf;

/// Planner failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    /// Completion text did not contain a usable step list
    #[error("malformed plan: {reason}")]
    Malformed { reason: String, response: String },

    /// Completion service failed
    #[error("plan completion failed: {0}")]
    Completion(#[from] LlmError),
}

impl PlanningError {
    #[inline]
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    /// Taxonomy kind reported to the caller
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed { .. } => ErrorKind::Planning,
            Self::Completion(e) => e.kind(),
        }
    }
}

/// Code generator failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Completion contained no code
    #[error("completion contained no code")]
    Empty,

    /// Completion service failed
    #[error("code completion failed: {0}")]
    Completion(#[from] LlmError),
}

impl GenerationError {
    /// Whether the cause aborts the whole request
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Completion(e) if e.is_fatal())
    }

    /// Error attached to the failed step
    #[must_use]
    pub fn to_step_error(&self) -> StepError {
        match self {
            Self::Empty => StepError::new(ErrorKind::Generation, self.to_string()),
            Self::Completion(e) => StepError::new(e.kind(), e.to_string()),
        }
    }
}

/// Metadata summarizer failures
#[derive(Debug, thiserror::Error)]
pub enum SummarizeError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid csv in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures that end a request before or between steps
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error("generation aborted the request: {0}")]
    Generation(#[from] GenerationError),

    #[error("data source unreadable: {0}")]
    Summarize(#[from] SummarizeError),

    #[error("request budget of {budget_ms} ms spent")]
    Deadline { budget_ms: u64 },
}

impl RequestError {
    /// Taxonomy kind reported to the caller
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Planning(e) => e.kind(),
            Self::Generation(e) => e.to_step_error().kind,
            Self::Summarize(_) => ErrorKind::Internal,
            Self::Deadline { .. } => ErrorKind::Deadline,
        }
    }
}
