//! Completion service errors

use analyst_core::ErrorKind;

/// Errors from the completion service
///
/// Every variant except [`LlmError::TransientExhausted`] is produced by a
/// single call; the retrying client folds repeated transient failures into
/// `TransientExhausted` so callers never see a bare transient error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    /// Service asked us to slow down (HTTP 429)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Connection, DNS or timeout failure
    #[error("network error: {0}")]
    Network(String),

    /// Service-side failure (HTTP 408 or 5xx)
    #[error("service unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    /// HTTP success with a body we could not decode
    #[error("malformed completion response: {0}")]
    MalformedResponse(String),

    /// Credentials missing or refused (HTTP 401/403)
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Service rejected the request itself (HTTP 400/404/422)
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Client-side misuse (empty prompt, unbuildable request)
    #[error("invalid completion request: {0}")]
    InvalidRequest(String),

    /// Transient failures outlasted the retry budget
    #[error("completion service kept failing after {attempts} attempts: {last}")]
    TransientExhausted { attempts: u32, last: Box<LlmError> },
}

impl LlmError {
    /// Worth retrying after a delay
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_)
                | Self::Network(_)
                | Self::Unavailable { .. }
                | Self::MalformedResponse(_)
        )
    }

    /// Retrying cannot help; the request should abort
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::Rejected { .. } | Self::InvalidRequest(_)
        )
    }

    /// Report taxonomy
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        if self.is_fatal() {
            ErrorKind::FatalCompletion
        } else {
            ErrorKind::TransientExhausted
        }
    }

    /// Classify an HTTP status into a transient or fatal error
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited(message),
            408 | 500..=599 => Self::Unavailable { status, message },
            401 | 403 => Self::Authentication(message),
            _ => Self::Rejected { status, message },
        }
    }
}
