//! Analyst Engine - Plan → Generate → Execute → Correct
//!
//! Answers a data-analysis question by planning steps, generating a Python
//! script per step and running it in the sandbox, regenerating with the
//! error as feedback until the step succeeds or its budget is spent.
//!
//! # Example
//!
//! ```rust,ignore
//! use analyst_engine::Analyst;
//!
//! let analyst = Analyst::new(config, service, executor);
//! let report = analyst
//!     .submit_analysis("Which region sold the most units?", &[DataHandle::from_path("sales.csv")])
//!     .await;
//! println!("{}", report.aggregated_answer);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod controller;
pub mod error;
pub mod generator;
pub mod planner;
pub mod report;
pub mod summarizer;

pub use controller::{Analyst, CorrectionLoop, StepContext};
pub use error::{GenerationError, PlanningError, RequestError, SummarizeError};
pub use generator::{prepare_code, CodeGenerator, Correction, GenerationRequest};
pub use planner::{parse_plan, Planner};
pub use report::{AbortInfo, AnalysisReport, StepReport};
pub use summarizer::FileSummarizer;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
