//! Testing utilities for the analyst workspace
//!
//! Scripted fakes for the two external seams (completion service, code
//! executor), fixtures, and a guard for tests that need a real interpreter.

#![allow(missing_docs)]

use analyst_core::{
    AnalystConfig, Backoff, Column, ColumnType, DataFormat, DataHandle, DataMetadata,
    ExecutionFault, ExecutionOutcome, RetryPolicy, Violation, ViolationCategory,
};
use analyst_llm::{CompletionRequest, CompletionService, LlmError};
use analyst_sandbox::{CodeExecutor, ExecutionRequest, SandboxError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

/// Completion service answering from a fixed script
///
/// Responses are consumed in order; every request is recorded. Running out
/// of responses is a fatal error so a miscounted test fails loudly.
#[derive(Debug, Default)]
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scripted = Self::new();
        for text in texts {
            scripted.push_ok(text);
        }
        scripted
    }

    pub fn push_ok(&self, text: impl Into<String>) -> &Self {
        self.responses.lock().push_back(Ok(text.into()));
        self
    }

    pub fn push_err(&self, error: LlmError) -> &Self {
        self.responses.lock().push_back(Err(error));
        self
    }

    /// Calls received so far
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.prompt.clone()).collect()
    }

    /// Unconsumed responses
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        request: &CompletionRequest,
        _config: &analyst_core::CompletionConfig,
    ) -> Result<String, LlmError> {
        self.requests.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| {
                Err(LlmError::InvalidRequest(
                    "scripted completions exhausted".into(),
                ))
            })
    }
}

/// Code executor answering from a fixed script
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<ExecutionOutcome>>,
    codes: Mutex<Vec<String>>,
    previous: Mutex<Vec<Vec<Value>>>,
}

impl ScriptedExecutor {
    pub fn new<I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = ExecutionOutcome>,
    {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Scripts received so far
    pub fn codes(&self) -> Vec<String> {
        self.codes.lock().clone()
    }

    /// `PREVIOUS_RESULTS` seen by each call
    pub fn previous_results(&self) -> Vec<Vec<Value>> {
        self.previous.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.codes.lock().len()
    }
}

#[async_trait]
impl CodeExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        request: &ExecutionRequest<'_>,
    ) -> Result<ExecutionOutcome, SandboxError> {
        self.codes.lock().push(request.code.to_string());
        self.previous.lock().push(request.previous_results.to_vec());
        self.outcomes
            .lock()
            .pop_front()
            .ok_or_else(|| SandboxError::Capture("scripted outcomes exhausted".into()))
    }
}

/// Outcome helpers
pub fn succeeded(result: Value) -> ExecutionOutcome {
    ExecutionOutcome::Succeeded {
        result,
        stdout: String::new(),
    }
}

pub fn execution_error(kind: &str, message: &str) -> ExecutionOutcome {
    ExecutionOutcome::ExecutionError(ExecutionFault::new(kind, message))
}

pub fn import_violation(module: &str) -> ExecutionOutcome {
    ExecutionOutcome::SandboxViolation(Violation::new(ViolationCategory::Import, module).at_line(1))
}

pub fn timeout(limit_ms: u64) -> ExecutionOutcome {
    ExecutionOutcome::Timeout { limit_ms }
}

/// Config with immediate retries and short limits
pub fn test_config() -> AnalystConfig {
    let mut config = AnalystConfig::default();
    config.retry = RetryPolicy::immediate(3);
    config.sandbox.execution_timeout_ms = 5_000;
    config
}

/// Config with the given retry budget and linear delay
pub fn config_with_retry(max_retries: u32, delay_ms: u64) -> AnalystConfig {
    let mut config = test_config();
    config.retry = RetryPolicy {
        max_retries,
        backoff: Backoff::Linear { delay_ms },
    };
    config
}

/// Small sales CSV written into `dir`
pub fn write_sales_csv(dir: &Path) -> DataHandle {
    let path = dir.join("sales.csv");
    std::fs::write(
        &path,
        "region,units,price\nnorth,10,2.5\nsouth,4,3.0\nnorth,6,2.5\neast,8,4.0\n",
    )
    .expect("write sales fixture");
    DataHandle::from_path(path)
}

/// Metadata matching [`write_sales_csv`]
pub fn sales_metadata() -> DataMetadata {
    DataMetadata {
        source: "sales".into(),
        format: DataFormat::Csv,
        schema: vec![
            Column::new("region", ColumnType::String),
            Column::new("units", ColumnType::Integer),
            Column::new("price", ColumnType::Float),
        ],
        sample_rows: vec![
            json!({"region": "north", "units": 10, "price": 2.5}),
            json!({"region": "south", "units": 4, "price": 3.0}),
        ],
        row_count: 4,
    }
}

/// JSON plan naming `steps`
pub fn plan_json(steps: &[&str]) -> String {
    json!({"plan": "analysis", "steps": steps}).to_string()
}

/// Whether a working Python interpreter is on PATH
pub async fn python_available() -> bool {
    analyst_sandbox::resolve_interpreter("python3").await.is_ok()
}

/// Return early from a test when no interpreter is available
#[macro_export]
macro_rules! require_python {
    () => {
        if !$crate::python_available().await {
            eprintln!("skipping: python3 not available");
            return;
        }
    };
}
