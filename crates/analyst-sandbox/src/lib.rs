//! Analyst Sandbox - running untrusted analysis scripts
//!
//! Two layers enforce one policy (import whitelist, function blocklist):
//! - [`Scanner`]: static tree-sitter scan before anything is spawned
//! - the Python harness: restricted builtins plus an audit hook inside the
//!   child interpreter
//!
//! [`SandboxExecutor`] ties them together with per-attempt scratch
//! directories and a host-side watchdog, and turns everything the script
//! does into an [`analyst_core::ExecutionOutcome`].

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod executor;
pub mod harness;
pub mod policy;
pub mod scanner;
pub mod scratch;

pub use error::SandboxError;
pub use executor::{resolve_interpreter, CodeExecutor, ExecutionRequest, SandboxExecutor};
pub use policy::CompiledPolicy;
pub use scanner::{ScanReport, Scanner, SyntaxIssue};
pub use scratch::ScratchSpace;
