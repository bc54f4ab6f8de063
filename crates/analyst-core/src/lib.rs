//! Analyst Core - shared building blocks for the analysis loop
//!
//! Provides the pieces every other crate in the workspace leans on:
//! - Immutable configuration (`AnalystConfig`) built once per process
//! - Request, step and execution-outcome types
//! - The step state machine (legal status transitions)
//! - A generic bounded-retry combinator used by both the completion client
//!   and the correction loop
//!
//! # Example
//!
//! ```rust,ignore
//! use analyst_core::retry::{retry, Disposition, RetryPolicy};
//!
//! let policy = RetryPolicy::linear(3, 1_000);
//! let value = retry(policy, |_: &std::io::Error| Disposition::Retry, |attempt| async move {
//!     call_service(attempt).await
//! })
//! .await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod retry;
pub mod state;
pub mod types;

pub use config::{
    AnalystConfig, CompletionConfig, OrchestrationConfig, PartialResults, SandboxConfig,
    SandboxPolicy, ViolationPolicy,
};
pub use error::{ConfigError, ErrorKind, StateMachineError};
pub use retry::{
    Backoff, Classifier, Disposition, GiveUp, RetryDecision, RetryError, RetryPolicy, Retried,
    Retrier,
};
pub use types::{
    AnalysisRequest, Attempt, Column, ColumnType, DataFormat, DataHandle, DataMetadata,
    ExecutionFault, ExecutionOutcome, OutcomeKind, RequestId, Step, StepError, StepStatus,
    Violation, ViolationCategory,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the analysis loop
    pub use crate::{
        AnalysisRequest, AnalystConfig, DataHandle, DataMetadata, ExecutionOutcome, RetryPolicy,
        Step, StepStatus,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
