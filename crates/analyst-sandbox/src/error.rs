//! Sandbox infrastructure errors
//!
//! These are host-side failures (no interpreter, unwritable scratch space).
//! Anything the generated script does wrong is an `ExecutionOutcome`, never
//! a `SandboxError`.

use std::path::PathBuf;

/// Host-side sandbox failures
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Scratch directory could not be prepared
    #[error("scratch space error at {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Interpreter process could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Interpreter answered the probe with something unusable
    #[error("python interpreter probe failed: {0}")]
    Interpreter(String),

    /// Waiting on the child failed
    #[error("failed waiting for sandbox process: {0}")]
    Wait(#[source] std::io::Error),

    /// Harness context could not be encoded
    #[error("cannot encode harness context: {0}")]
    Context(#[from] serde_json::Error),

    /// Grammar could not be loaded
    #[error("python grammar unavailable: {0}")]
    Parser(String),

    /// Output reader task died
    #[error("output capture failed: {0}")]
    Capture(String),
}

impl SandboxError {
    pub(crate) fn scratch(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Scratch {
            path: path.into(),
            source,
        }
    }
}
