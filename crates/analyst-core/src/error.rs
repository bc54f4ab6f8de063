//! Error types shared across the workspace
//!
//! - Configuration loading and validation failures
//! - Illegal step status transitions
//! - The user-visible error taxonomy (`ErrorKind`) carried in reports

use crate::types::StepStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment override could not be parsed
    #[error("invalid value for {key}: '{value}'")]
    InvalidOverride { key: String, value: String },

    /// A field is outside its accepted range
    #[error("invalid configuration: {field} {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

impl ConfigError {
    /// Create out-of-range error
    pub fn out_of_range(field: &'static str, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            field,
            reason: reason.into(),
        }
    }
}

/// State machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not in the allowed table
    #[error("illegal step transition: {from:?} -> {to:?}")]
    IllegalTransition { from: StepStatus, to: StepStatus },

    /// Attempt budget would be exceeded
    #[error("attempt budget exhausted after {attempts} attempts")]
    AttemptBudgetExceeded { attempts: u32 },
}

/// Error taxonomy surfaced to callers
///
/// Every failed step and every aborted request carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Plan could not be parsed
    Planning,
    /// Code generator failed
    Generation,
    /// Blocked import or function used
    SandboxViolation,
    /// Runtime failure inside generated code
    Execution,
    /// Execution budget exceeded
    Timeout,
    /// Completion service kept failing transiently
    TransientExhausted,
    /// Completion service rejected the request
    FatalCompletion,
    /// Whole-request wall-clock budget spent
    Deadline,
    /// Host-side infrastructure failure (spawn, scratch space)
    Internal,
}

impl ErrorKind {
    /// Whether this kind aborts the whole request rather than one step
    #[inline]
    #[must_use]
    pub fn aborts_request(&self) -> bool {
        matches!(self, Self::Planning | Self::FatalCompletion)
    }

    /// Whether a step failing with this kind may be corrected by regenerating code
    #[inline]
    #[must_use]
    pub fn is_correctable(&self) -> bool {
        matches!(self, Self::SandboxViolation | Self::Execution | Self::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Planning => "planning",
            Self::Generation => "generation",
            Self::SandboxViolation => "sandbox_violation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::TransientExhausted => "transient_exhausted",
            Self::FatalCompletion => "fatal_completion",
            Self::Deadline => "deadline",
            Self::Internal => "internal",
        };
        write!(f, "{name}")
    }
}
