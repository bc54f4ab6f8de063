//! Code generation
//!
//! One completion call per attempt. The first attempt sees the step, the
//! question and the data metadata; a correction attempt additionally sees the
//! previous script and the error it produced.

use crate::error::GenerationError;
use crate::planner::{describe_metadata, fenced_blocks};
use analyst_core::{CompletionConfig, DataMetadata, SandboxPolicy, StepError};
use analyst_llm::prompt::ANALYST_SYSTEM;
use analyst_llm::{CompletionClient, CompletionRequest, PromptTemplate};
use serde_json::Value;
use std::fmt::Write as _;

/// Lines of a trace kept in a correction prompt
const TRACE_TAIL_LINES: usize = 15;

const GENERATE_TEMPLATE: PromptTemplate = PromptTemplate::new(
    "Write a Python script for one step of a data analysis.\n\n\
     Overall question: {question}\n\
     Current step: {step}\n\n\
     Available data (read each source through its path in the DATA dict):\n{metadata}\n\
     {previous}\
     Rules:\n\
     - Read data only via DATA['name']; never hard-code paths.\n\
     - Store the answer for this step in a variable named `result` \
     (numbers, strings, lists, dicts or pandas objects).\n\
     - Do not write files other than temporary ones in the working directory.\n\
     - Allowed imports: {modules}.\n\
     - Do not use: {blocked}.\n\n\
     Respond with the complete script in a single ```python code block.",
);

const CORRECTION_TEMPLATE: PromptTemplate = PromptTemplate::new(
    "\nThe previous script for this step failed.\n\n\
     Previous script:\n```python\n{code}\n```\n\n\
     Error ({kind}): {message}\n\
     {trace}\n\
     Fix the problem and return the full corrected script.",
);

/// Previous attempt fed back as corrective context
#[derive(Debug, Clone, Copy)]
pub struct Correction<'a> {
    pub code: &'a str,
    pub error: &'a StepError,
}

/// Everything the generator needs for one attempt
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub question: &'a str,
    pub step: &'a str,
    pub metadata: &'a [DataMetadata],
    /// Results of earlier succeeded steps, in plan order
    pub previous_results: &'a [Value],
    pub correction: Option<Correction<'a>>,
}

/// Generates analysis scripts through the completion client
#[derive(Debug, Clone)]
pub struct CodeGenerator {
    client: CompletionClient,
    config: CompletionConfig,
    modules: String,
    blocked: String,
}

impl CodeGenerator {
    #[must_use]
    pub fn new(client: CompletionClient, config: CompletionConfig, policy: &SandboxPolicy) -> Self {
        let mut modules: Vec<&str> = policy.allowed_modules.iter().map(String::as_str).collect();
        modules.sort_unstable();
        Self {
            client,
            config,
            modules: modules.join(", "),
            blocked: policy.blocked_builtins.join(", "),
        }
    }

    /// Prompt for `request`
    #[must_use]
    pub fn prompt(&self, request: &GenerationRequest<'_>) -> String {
        let described = describe_metadata(request.metadata);
        let previous = describe_previous(request.previous_results);
        let mut prompt = GENERATE_TEMPLATE.render(&[
            ("question", request.question),
            ("step", request.step),
            ("metadata", &described),
            ("previous", &previous),
            ("modules", &self.modules),
            ("blocked", &self.blocked),
        ]);

        if let Some(correction) = request.correction {
            let trace = correction
                .error
                .trace
                .as_deref()
                .map(|t| format!("Traceback (last lines):\n{}\n", trace_tail(t, TRACE_TAIL_LINES)))
                .unwrap_or_default();
            let kind = correction.error.kind.to_string();
            prompt.push_str(&CORRECTION_TEMPLATE.render(&[
                ("code", correction.code),
                ("kind", &kind),
                ("message", &correction.error.message),
                ("trace", &trace),
            ]));
        }
        prompt
    }

    /// Generate a script for one attempt
    ///
    /// # Errors
    /// `Completion` when the service fails, `Empty` when the response holds
    /// no code.
    pub async fn generate(
        &self,
        request: &GenerationRequest<'_>,
    ) -> Result<String, GenerationError> {
        let prompt = self.prompt(request);
        let completion = self
            .client
            .complete(
                CompletionRequest::new(prompt).with_system(ANALYST_SYSTEM),
                &self.config,
            )
            .await?;
        let code = prepare_code(&completion.text)?;
        tracing::debug!(
            lines = code.lines().count(),
            correction = request.correction.is_some(),
            "script generated"
        );
        Ok(code)
    }
}

/// Clean completion text into a runnable script
///
/// Takes the first fenced block when there is one (dropping the prose around
/// it); otherwise strips leading prose lines up to the first line that looks
/// like Python.
///
/// # Errors
/// `Empty` when nothing is left.
pub fn prepare_code(text: &str) -> Result<String, GenerationError> {
    let code = match fenced_blocks(text).into_iter().find(|b| !b.is_empty()) {
        Some(block) => block.to_string(),
        None => strip_leading_prose(text),
    };
    let code = code.trim_matches('\n').trim_end();
    if code.trim().is_empty() {
        return Err(GenerationError::Empty);
    }
    Ok(format!("{code}\n"))
}

fn strip_leading_prose(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .position(|line| looks_like_code(line))
        .unwrap_or(lines.len());
    lines[start..].join("\n")
}

fn looks_like_code(line: &str) -> bool {
    const STARTERS: [&str; 10] = [
        "import ", "from ", "def ", "class ", "for ", "with ", "if ", "print(", "result", "#",
    ];
    let trimmed = line.trim_start();
    STARTERS.iter().any(|s| trimmed.starts_with(s))
        || trimmed
            .split_once('=')
            .is_some_and(|(lhs, _)| is_assignment_target(lhs.trim()))
}

fn is_assignment_target(lhs: &str) -> bool {
    !lhs.is_empty()
        && lhs
            .chars()
            .all(|c| {
                c.is_ascii_alphanumeric()
                    || matches!(c, '_' | ',' | ' ' | '[' | ']' | '\'' | '"' | '.')
            })
        && !lhs.contains("  ")
        && !lhs.starts_with(|c: char| c.is_ascii_digit())
}

fn describe_previous(results: &[Value]) -> String {
    if results.is_empty() {
        return String::new();
    }
    let mut out =
        String::from("Results of earlier steps (also available as PREVIOUS_RESULTS[i]):\n");
    for (i, value) in results.iter().enumerate() {
        let _ = writeln!(out, "- PREVIOUS_RESULTS[{i}] = {value}");
    }
    out.push('\n');
    out
}

/// Last `n` lines of a trace
fn trace_tail(trace: &str, n: usize) -> String {
    let lines: Vec<&str> = trace.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
