//! Core types for the analysis loop
//!
//! Defines the fundamental types shared by planner, generator, sandbox and
//! controller:
//! - Requests, data handles and data metadata
//! - Steps and their status
//! - Execution outcomes (the structured result of one sandboxed attempt)

use crate::error::{ErrorKind, StateMachineError};
use crate::state::validate_transition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Unique request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Generate new request ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, read-only reference to a data source
///
/// `name` is the identifier generated code uses to look the source up
/// (`DATA["sales"]`); `path` is never handed to the script directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataHandle {
    name: String,
    path: PathBuf,
}

impl DataHandle {
    /// Create handle with explicit name
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: sanitize_identifier(&name.into()),
            path: path.into(),
        }
    }

    /// Create handle named after the file stem
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name: sanitize_identifier(&stem),
            path,
        }
    }

    /// Identifier visible to generated code
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host path of the source
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name used for the sandbox copy
    #[must_use]
    pub fn file_name(&self) -> String {
        match self.path.extension() {
            Some(ext) => format!("{}.{}", self.name, ext.to_string_lossy()),
            None => self.name.clone(),
        }
    }

    fn renamed(&self, name: String) -> Self {
        Self {
            name,
            path: self.path.clone(),
        }
    }
}

fn sanitize_identifier(raw: &str) -> String {
    let mut out: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if out.is_empty() {
        out.push_str("data");
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Source format as seen by the summarizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Csv,
    Json,
    Text,
}

/// Inferred column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    String,
    /// No non-empty values seen
    Empty,
}

/// One schema entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub dtype: ColumnType,
}

impl Column {
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, dtype: ColumnType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Compact description of one data source
///
/// Rendered into planner and generator prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMetadata {
    /// Handle name the script uses
    pub source: String,
    pub format: DataFormat,
    /// Ordered (name, type) pairs
    pub schema: Vec<Column>,
    pub sample_rows: Vec<Value>,
    pub row_count: usize,
}

impl DataMetadata {
    /// Metadata with no schema (free text sources)
    #[must_use]
    pub fn text(source: impl Into<String>, preview: impl Into<String>, line_count: usize) -> Self {
        Self {
            source: source.into(),
            format: DataFormat::Text,
            schema: Vec::new(),
            sample_rows: vec![Value::String(preview.into())],
            row_count: line_count,
        }
    }

    /// Column names in schema order
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.schema.iter().map(|c| c.name.as_str())
    }
}

/// One analysis request
///
/// Immutable once created; the controller only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    id: RequestId,
    question: String,
    data: Vec<DataHandle>,
    metadata: Vec<DataMetadata>,
}

impl AnalysisRequest {
    /// Create request; duplicate handle names get a numeric suffix
    ///
    /// Metadata is matched to handles by position; a renamed handle renames
    /// the metadata entry that carried its old name.
    #[must_use]
    pub fn new(
        question: impl Into<String>,
        data: Vec<DataHandle>,
        mut metadata: Vec<DataMetadata>,
    ) -> Self {
        let mut seen = HashSet::new();
        let data = data
            .into_iter()
            .enumerate()
            .map(|(i, handle)| {
                let mut name = handle.name().to_string();
                let mut n = 2;
                while !seen.insert(name.clone()) {
                    name = format!("{}_{n}", handle.name());
                    n += 1;
                }
                if let Some(meta) = metadata.get_mut(i) {
                    if meta.source == handle.name() {
                        meta.source.clone_from(&name);
                    }
                }
                handle.renamed(name)
            })
            .collect();
        Self {
            id: RequestId::new(),
            question: question.into(),
            data,
            metadata,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn question(&self) -> &str {
        &self.question
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &[DataHandle] {
        &self.data
    }

    #[inline]
    #[must_use]
    pub fn metadata(&self) -> &[DataMetadata] {
        &self.metadata
    }
}

/// Step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Generating,
    Executing,
    Succeeded,
    Failed,
}

impl StepStatus {
    /// Terminal statuses are never left
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Runtime failure raised by generated code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFault {
    /// Exception class or exit reason (`KeyError`, `SyntaxError`, `AbnormalExit`)
    pub kind: String,
    pub message: String,
    pub trace: Option<String>,
}

impl ExecutionFault {
    #[inline]
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

/// What sort of resource a violation touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    /// Module outside the whitelist
    Import,
    /// Blocked builtin or function
    Call,
    /// Reflection through dunder attributes
    Reflection,
    /// File access outside scratch space
    FileSystem,
    /// Socket or URL access
    Network,
    /// Process creation or signalling
    Process,
}

/// Blocked resource use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub category: ViolationCategory,
    /// Module, function or path that was blocked
    pub resource: String,
    /// 1-based source line, when known
    pub line: Option<usize>,
}

impl Violation {
    #[inline]
    #[must_use]
    pub fn new(category: ViolationCategory, resource: impl Into<String>) -> Self {
        Self {
            category,
            resource: resource.into(),
            line: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.category {
            ViolationCategory::Import => "import of",
            ViolationCategory::Call => "call to",
            ViolationCategory::Reflection => "reflective access to",
            ViolationCategory::FileSystem => "file access to",
            ViolationCategory::Network => "network access via",
            ViolationCategory::Process => "process control via",
        };
        write!(f, "blocked {what} '{}'", self.resource)?;
        if let Some(line) = self.line {
            write!(f, " at line {line}")?;
        }
        Ok(())
    }
}

/// Classification tag of an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    ExecutionError,
    SandboxViolation,
    Timeout,
}

/// Structured result of one sandboxed attempt
///
/// Produced at the sandbox boundary; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "classification", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Script finished; `result` is its declared result
    Succeeded { result: Value, stdout: String },
    /// Script raised or terminated abnormally
    ExecutionError(ExecutionFault),
    /// Script touched a blocked resource
    SandboxViolation(Violation),
    /// Watchdog terminated the script
    Timeout { limit_ms: u64 },
}

impl ExecutionOutcome {
    /// Classification tag
    #[inline]
    #[must_use]
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Succeeded { .. } => OutcomeKind::Succeeded,
            Self::ExecutionError(_) => OutcomeKind::ExecutionError,
            Self::SandboxViolation(_) => OutcomeKind::SandboxViolation,
            Self::Timeout { .. } => OutcomeKind::Timeout,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Structured error for a failed outcome
    #[must_use]
    pub fn error(&self) -> Option<StepError> {
        match self {
            Self::Succeeded { .. } => None,
            Self::ExecutionError(fault) => Some(StepError {
                kind: ErrorKind::Execution,
                message: format!("{}: {}", fault.kind, fault.message),
                trace: fault.trace.clone(),
            }),
            Self::SandboxViolation(violation) => Some(StepError::new(
                ErrorKind::SandboxViolation,
                violation.to_string(),
            )),
            Self::Timeout { limit_ms } => Some(StepError::new(
                ErrorKind::Timeout,
                format!("execution exceeded {limit_ms} ms and was terminated"),
            )),
        }
    }
}

/// Error attached to a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl StepError {
    #[inline]
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: None,
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One generate+execute attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based
    pub number: u32,
    pub code: String,
    pub outcome: ExecutionOutcome,
    pub duration_ms: u64,
}

/// One unit of analysis work
///
/// Owned by the correction loop; every status change goes through the
/// transition table in [`crate::state`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    index: usize,
    description: String,
    status: StepStatus,
    code: Option<String>,
    attempts: u32,
    max_attempts: u32,
    last_error: Option<StepError>,
    result: Option<Value>,
    history: Vec<Attempt>,
}

impl Step {
    /// Create pending step
    #[must_use]
    pub fn new(index: usize, description: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            index,
            description: description.into(),
            status: StepStatus::Pending,
            code: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            result: None,
            history: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[inline]
    #[must_use]
    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Latest generated script
    #[inline]
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[inline]
    #[must_use]
    pub fn last_error(&self) -> Option<&StepError> {
        self.last_error.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Executed attempts in order
    #[inline]
    #[must_use]
    pub fn history(&self) -> &[Attempt] {
        &self.history
    }

    fn transition(&mut self, to: StepStatus) -> Result<(), StateMachineError> {
        validate_transition(self.status, to)?;
        self.status = to;
        Ok(())
    }

    /// Enter `Generating` and count the attempt
    pub fn begin_attempt(&mut self) -> Result<u32, StateMachineError> {
        if self.attempts >= self.max_attempts {
            return Err(StateMachineError::AttemptBudgetExceeded {
                attempts: self.attempts,
            });
        }
        self.transition(StepStatus::Generating)?;
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Generated code is ready; enter `Executing`
    pub fn code_ready(&mut self, code: String) -> Result<(), StateMachineError> {
        self.transition(StepStatus::Executing)?;
        self.code = Some(code);
        Ok(())
    }

    /// Record an executed attempt
    ///
    /// A successful outcome moves the step to `Succeeded`; a failed one keeps
    /// it in `Executing` with `last_error` set, for the controller to either
    /// retry or fail.
    pub fn record(&mut self, attempt: Attempt) -> Result<(), StateMachineError> {
        if self.status != StepStatus::Executing {
            return Err(StateMachineError::IllegalTransition {
                from: self.status,
                to: StepStatus::Executing,
            });
        }
        match &attempt.outcome {
            ExecutionOutcome::Succeeded { result, .. } => {
                self.transition(StepStatus::Succeeded)?;
                self.result = Some(result.clone());
                self.last_error = None;
            }
            failed => self.last_error = failed.error(),
        }
        self.history.push(attempt);
        Ok(())
    }

    /// Enter `Failed` with the given error
    pub fn fail(&mut self, error: StepError) -> Result<(), StateMachineError> {
        self.transition(StepStatus::Failed)?;
        self.last_error = Some(error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attempt(number: u32, outcome: ExecutionOutcome) -> Attempt {
        Attempt {
            number,
            code: "result = 1".into(),
            outcome,
            duration_ms: 1,
        }
    }

    #[test]
    fn handle_name_is_sanitized() {
        let handle = DataHandle::from_path("/tmp/2024 Sales-Report.csv");
        assert_eq!(handle.name(), "_2024_sales_report");
        assert_eq!(handle.file_name(), "_2024_sales_report.csv");
    }

    #[test]
    fn request_deduplicates_handle_names() {
        let request = AnalysisRequest::new(
            "q",
            vec![
                DataHandle::from_path("/a/sales.csv"),
                DataHandle::from_path("/b/sales.csv"),
            ],
            vec![],
        );
        let names: Vec<_> = request.data().iter().map(DataHandle::name).collect();
        assert_eq!(names, vec!["sales", "sales_2"]);
    }

    #[test]
    fn renamed_handles_rename_their_metadata() {
        let request = AnalysisRequest::new(
            "q",
            vec![
                DataHandle::from_path("/a/notes.txt"),
                DataHandle::from_path("/b/notes.txt"),
            ],
            vec![
                DataMetadata::text("notes", "first", 1),
                DataMetadata::text("notes", "second", 1),
            ],
        );
        let sources: Vec<_> = request.metadata().iter().map(|m| m.source.as_str()).collect();
        assert_eq!(sources, vec!["notes", "notes_2"]);
    }

    #[test]
    fn step_happy_path() {
        let mut step = Step::new(0, "mean of revenue", 4);
        assert_eq!(step.begin_attempt().unwrap(), 1);
        step.code_ready("result = 1".into()).unwrap();
        step.record(attempt(
            1,
            ExecutionOutcome::Succeeded {
                result: json!(1),
                stdout: String::new(),
            },
        ))
        .unwrap();

        assert_eq!(step.status(), StepStatus::Succeeded);
        assert_eq!(step.result(), Some(&json!(1)));
        assert!(step.last_error().is_none());
    }

    #[test]
    fn failed_outcome_keeps_step_executing() {
        let mut step = Step::new(0, "x", 4);
        step.begin_attempt().unwrap();
        step.code_ready("x".into()).unwrap();
        step.record(attempt(1, ExecutionOutcome::Timeout { limit_ms: 10 }))
            .unwrap();

        assert_eq!(step.status(), StepStatus::Executing);
        assert_eq!(step.last_error().unwrap().kind, ErrorKind::Timeout);

        assert_eq!(step.begin_attempt().unwrap(), 2);
        assert_eq!(step.status(), StepStatus::Generating);
    }

    #[test]
    fn step_never_leaves_terminal_status() {
        let mut step = Step::new(0, "x", 4);
        step.begin_attempt().unwrap();
        step.fail(StepError::new(ErrorKind::Generation, "empty"))
            .unwrap();

        assert!(step.begin_attempt().is_err());
        assert!(step.code_ready("x".into()).is_err());
        assert_eq!(step.status(), StepStatus::Failed);
    }

    #[test]
    fn step_attempts_are_bounded() {
        let mut step = Step::new(0, "x", 2);
        for n in 1..=2 {
            step.begin_attempt().unwrap();
            step.code_ready("x".into()).unwrap();
            step.record(attempt(n, ExecutionOutcome::Timeout { limit_ms: 1 }))
                .unwrap();
        }
        assert_eq!(
            step.begin_attempt(),
            Err(StateMachineError::AttemptBudgetExceeded { attempts: 2 })
        );
    }

    #[test]
    fn outcome_error_mapping() {
        let violation = ExecutionOutcome::SandboxViolation(
            Violation::new(ViolationCategory::Import, "subprocess").at_line(1),
        );
        let err = violation.error().unwrap();
        assert_eq!(err.kind, ErrorKind::SandboxViolation);
        assert_eq!(err.message, "blocked import of 'subprocess' at line 1");

        let fault = ExecutionOutcome::ExecutionError(ExecutionFault::new("KeyError", "'revenue'"));
        assert_eq!(fault.error().unwrap().message, "KeyError: 'revenue'");
        assert_eq!(fault.kind(), OutcomeKind::ExecutionError);
    }

    #[test]
    fn outcome_serializes_with_classification_tag() {
        let outcome = ExecutionOutcome::Timeout { limit_ms: 500 };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value, json!({"classification": "timeout", "limit_ms": 500}));
    }
}
