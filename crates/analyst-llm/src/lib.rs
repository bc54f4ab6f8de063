//! Analyst LLM - completion service access
//!
//! - [`CompletionService`]: one call to a text-completion backend
//! - [`CompletionClient`]: bounded retry over a service (transient failures
//!   are retried with backoff, fatal ones surface immediately)
//! - [`HttpCompletionService`]: OpenAI-compatible HTTP backend
//! - [`prompt`]: templates and length truncation

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod client;
pub mod error;
pub mod http;
pub mod prompt;

pub use client::{Completion, CompletionClient, CompletionRequest, CompletionService};
pub use error::LlmError;
pub use http::HttpCompletionService;
pub use prompt::{truncate_prompt, PromptTemplate};
